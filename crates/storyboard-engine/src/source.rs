use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use storyboard_contracts::media::{mime_for_extension, ImageData, ImageSource};

const DOWNLOAD_TIMEOUT_S: u64 = 30;

/// Turns every kind of [`ImageSource`] into bytes plus a mime type.
pub struct ImageResolver {
    http: HttpClient,
    timeout: Duration,
}

impl Default for ImageResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageResolver {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
            timeout: Duration::from_secs(DOWNLOAD_TIMEOUT_S),
        }
    }

    pub fn resolve(&self, source: &ImageSource) -> Result<ImageData> {
        match source {
            ImageSource::Frame {
                frame_id,
                image_url,
            } => self
                .resolve_url(image_url)
                .with_context(|| format!("frame {frame_id} has no readable image")),
            ImageSource::Sketch { data_url } => {
                ImageData::from_data_url(data_url).context("sketch is not a valid data URL")
            }
            ImageSource::Asset { path } => read_image_file(path),
            ImageSource::Raw { url } => self.resolve_url(url),
        }
    }

    /// Accepts `data:` URLs, `http(s)://` URLs, `file://` URLs and plain
    /// filesystem paths.
    pub fn resolve_url(&self, url: &str) -> Result<ImageData> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            bail!("empty image reference");
        }
        if trimmed.starts_with("data:") {
            return ImageData::from_data_url(trimmed);
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return self.download(trimmed);
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        read_image_file(Path::new(path))
    }

    fn download(&self, url: &str) -> Result<ImageData> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        if !response.status().is_success() {
            bail!("image download failed ({}): {url}", response.status().as_u16());
        }
        let header_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| value.starts_with("image/"));
        let bytes = response
            .bytes()
            .context("failed reading downloaded image bytes")?
            .to_vec();
        if bytes.is_empty() {
            bail!("image download returned no bytes: {url}");
        }
        let mime_type = header_mime
            .or_else(|| sniff_mime(&bytes))
            .unwrap_or_else(|| "image/png".to_string());
        Ok(ImageData::new(bytes, mime_type))
    }
}

fn read_image_file(path: &Path) -> Result<ImageData> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    let mime_type = sniff_mime(&bytes)
        .or_else(|| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .and_then(mime_for_extension)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "image/png".to_string());
    Ok(ImageData::new(bytes, mime_type))
}

fn sniff_mime(bytes: &[u8]) -> Option<String> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

#[cfg(test)]
mod tests {
    use storyboard_contracts::story::FrameId;

    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn every_source_kind_normalizes_to_image_data() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("upload.bin");
        fs::write(&path, PNG_MAGIC)?;
        let inline = ImageData::new(vec![7, 7, 7], "image/webp").to_data_url();
        let resolver = ImageResolver::new();

        let sources = [
            ImageSource::Frame {
                frame_id: FrameId::from("f0"),
                image_url: inline.clone(),
            },
            ImageSource::Sketch {
                data_url: inline.clone(),
            },
            ImageSource::Raw { url: inline },
        ];
        for source in &sources {
            let image = resolver.resolve(source)?;
            assert_eq!(image.bytes, vec![7, 7, 7]);
            assert_eq!(image.mime_type, "image/webp");
        }

        let asset = resolver.resolve(&ImageSource::Asset { path: path.clone() })?;
        assert_eq!(asset.mime_type, "image/png");
        let raw_path = resolver.resolve(&ImageSource::Raw {
            url: format!("file://{}", path.display()),
        })?;
        assert_eq!(raw_path.bytes, PNG_MAGIC.to_vec());
        Ok(())
    }

    #[test]
    fn unreadable_sources_are_errors() {
        let resolver = ImageResolver::new();
        assert!(resolver
            .resolve(&ImageSource::Sketch {
                data_url: "not-a-data-url".to_string(),
            })
            .is_err());
        assert!(resolver
            .resolve(&ImageSource::Asset {
                path: "/definitely/not/here.png".into(),
            })
            .is_err());
        assert!(resolver.resolve_url("   ").is_err());
    }

    #[test]
    fn extension_is_used_when_bytes_are_not_recognized() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("photo.jpeg");
        fs::write(&path, [1, 2, 3])?;
        let image = ImageResolver::new().resolve_url(&path.display().to_string())?;
        assert_eq!(image.mime_type, "image/jpeg");
        Ok(())
    }
}
