use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use sha2::{Digest, Sha256};
use storyboard_contracts::media::ImageData;

use crate::capability::{
    GenerationPart, ImageGenerator, ImageRequest, ImageResponse, ResponsePart,
    StructuredGenerator, StructuredRequest,
};
use crate::error::CapabilityError;

/// Offline stand-in for a real backend: neutral schema-conforming briefs
/// and flat-colored frames whose color is derived from the prompt text.
pub struct DryrunProvider;

impl StructuredGenerator for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, CapabilityError> {
        let seed_text = last_text(&request.parts);
        Ok(request.schema.placeholder(&clamp_text(&seed_text, 80)))
    }
}

impl ImageGenerator for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, CapabilityError> {
        let prompt = first_text(&request.parts);
        let (width, height) = request.aspect_ratio.dimensions();
        let bytes = render_flat_png(width / 4, height / 4, &prompt).map_err(|err| {
            CapabilityError::invalid_response(format!("dryrun render failed: {err}"))
        })?;
        Ok(ImageResponse {
            parts: vec![
                ResponsePart::Text("dryrun frame".to_string()),
                ResponsePart::InlineImage(ImageData::new(bytes, "image/png")),
            ],
        })
    }
}

fn first_text(parts: &[GenerationPart]) -> String {
    parts
        .iter()
        .find_map(|part| match part {
            GenerationPart::Text(text) => Some(text.clone()),
            GenerationPart::Image(_) => None,
        })
        .unwrap_or_default()
}

fn last_text(parts: &[GenerationPart]) -> String {
    parts
        .iter()
        .rev()
        .find_map(|part| match part {
            GenerationPart::Text(text) => Some(text.clone()),
            GenerationPart::Image(_) => None,
        })
        .unwrap_or_default()
}

fn clamp_text(text: &str, max_chars: usize) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    single_line.chars().take(max_chars).collect()
}

fn render_flat_png(width: u32, height: u32, prompt: &str) -> image::ImageResult<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width.max(1), height.max(1));
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(canvas).write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use storyboard_contracts::story::AspectRatio;

    use super::*;
    use crate::schema::OutputSchema;

    #[test]
    fn structured_placeholder_matches_schema() -> anyhow::Result<()> {
        let schema = OutputSchema::new()
            .string("imagePrompt", "prompt")
            .enumeration("subjectType", &["none", "character"], "kind");
        let request = StructuredRequest {
            model: "dryrun-structured-1".to_string(),
            parts: vec![GenerationPart::text("make it rain")],
            schema: schema.clone(),
            timeout: Duration::from_secs(1),
        };
        let value = DryrunProvider.generate_structured(&request)?;
        schema.validate(&value)?;
        assert_eq!(value["subjectType"], "none");
        Ok(())
    }

    #[test]
    fn rendered_frame_is_a_decodable_png_sized_by_ratio() -> anyhow::Result<()> {
        let request = ImageRequest {
            model: "dryrun-image-1".to_string(),
            parts: vec![GenerationPart::text("harbor at dusk")],
            aspect_ratio: AspectRatio::Square,
            timeout: Duration::from_secs(1),
        };
        let image = DryrunProvider
            .generate_image(&request)?
            .into_first_image()
            .ok_or_else(|| anyhow::anyhow!("no image"))?;
        assert_eq!(image.mime_type, "image/png");
        let decoded = image::load_from_memory(&image.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (256, 256));
        Ok(())
    }

    #[test]
    fn same_prompt_renders_same_color() {
        assert_eq!(color_from_prompt("boat"), color_from_prompt("boat"));
        assert_ne!(color_from_prompt("boat"), color_from_prompt("train"));
    }
}
