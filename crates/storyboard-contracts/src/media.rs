use std::path::PathBuf;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::story::FrameId;

/// Raw image bytes plus the mime type they were produced or uploaded with.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn from_data_url(url: &str) -> anyhow::Result<Self> {
        let Some(rest) = url.trim().strip_prefix("data:") else {
            bail!("not a data URL");
        };
        let Some((header, payload)) = rest.split_once(',') else {
            bail!("data URL is missing its payload separator");
        };
        let Some(mime_type) = header.strip_suffix(";base64") else {
            bail!("only base64 data URLs are supported");
        };
        let mime_type = if mime_type.is_empty() {
            "application/octet-stream"
        } else {
            mime_type
        };
        let bytes = BASE64
            .decode(payload.trim().as_bytes())
            .context("data URL base64 decode failed")?;
        if bytes.is_empty() {
            bail!("data URL carries no bytes");
        }
        Ok(Self::new(bytes, mime_type))
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.bytes)
    }
}

/// Content fingerprint used as the dossier lookup key.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Anything a caller can hand to the pipeline as "the picture to work on".
///
/// Every variant resolves to [`ImageData`] through a single normalization
/// step in the engine; nothing downstream inspects the variant again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// An existing storyboard frame; `image_url` is its active version.
    Frame { frame_id: FrameId, image_url: String },
    /// A freshly drawn sketch, always inline.
    Sketch { data_url: String },
    /// An uploaded asset on disk.
    Asset { path: PathBuf },
    /// A bare URL: `data:`, `http(s)://` or a filesystem path.
    Raw { url: String },
}

impl ImageSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frame { .. } => "frame",
            Self::Sketch { .. } => "sketch",
            Self::Asset { .. } => "asset",
            Self::Raw { .. } => "raw",
        }
    }

    pub fn frame_id(&self) -> Option<&FrameId> {
        match self {
            Self::Frame { frame_id, .. } => Some(frame_id),
            _ => None,
        }
    }
}

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.trim().to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_decodes_mime_and_bytes() -> anyhow::Result<()> {
        let image = ImageData::from_data_url("data:image/jpeg;base64,AQID")?;
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.to_data_url(), "data:image/jpeg;base64,AQID");
        Ok(())
    }

    #[test]
    fn data_url_rejects_plain_urls_and_empty_payloads() {
        assert!(ImageData::from_data_url("https://example.com/a.png").is_err());
        assert!(ImageData::from_data_url("data:image/png;base64,").is_err());
        assert!(ImageData::from_data_url("data:text/plain,hello").is_err());
    }

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        let a = fingerprint(b"robot");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint(b"robot"));
        assert_ne!(a, fingerprint(b"robot-7"));
    }

    #[test]
    fn image_source_serializes_with_kind_tag() -> anyhow::Result<()> {
        let source = ImageSource::Sketch {
            data_url: "data:image/png;base64,AA==".to_string(),
        };
        let value = serde_json::to_value(&source)?;
        assert_eq!(value["kind"], "sketch");
        assert_eq!(source.kind(), "sketch");
        Ok(())
    }
}
