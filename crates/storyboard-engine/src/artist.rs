//! Synthesis stage: one image call carrying the brief and every reference,
//! each scoped to what it may influence.

use std::sync::Arc;
use std::time::Duration;

use storyboard_contracts::media::ImageData;
use storyboard_contracts::story::AspectRatio;
use tracing::debug;

use crate::capability::{GenerationPart, ImageGenerator, ImageRequest};
use crate::director::AnalysisBrief;
use crate::error::{FailureKind, PipelineError};

/// The identity reference as handed to the image model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorImage {
    pub role_label: String,
    pub image: ImageData,
}

#[derive(Clone)]
pub struct Artist {
    generator: Arc<dyn ImageGenerator>,
    model: String,
}

impl Artist {
    pub fn new(generator: Arc<dyn ImageGenerator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> &str {
        self.generator.name()
    }

    pub fn synthesize(
        &self,
        brief: &AnalysisBrief,
        target: &ImageData,
        style_references: &[ImageData],
        identity_anchor: Option<&AnchorImage>,
        aspect_ratio: AspectRatio,
        timeout: Duration,
    ) -> Result<ImageData, PipelineError> {
        let request = ImageRequest {
            model: self.model.clone(),
            parts: build_parts(brief, target, style_references, identity_anchor, aspect_ratio),
            aspect_ratio,
            timeout,
        };
        let response = self
            .generator
            .generate_image(&request)
            .map_err(|err| PipelineError::synthesis(err.kind.into(), err.message))?;
        let image = response.into_first_image().ok_or_else(|| {
            PipelineError::synthesis(
                FailureKind::NoImage,
                format!("{} returned no inline image", self.provider()),
            )
        })?;
        if image.bytes.is_empty() {
            return Err(PipelineError::synthesis(
                FailureKind::NoImage,
                format!("{} returned an empty image", self.provider()),
            ));
        }
        debug!(
            provider = self.provider(),
            model = %self.model,
            references = style_references.len(),
            anchored = identity_anchor.is_some(),
            bytes = image.bytes.len(),
            "frame synthesized"
        );
        Ok(image)
    }
}

fn build_parts(
    brief: &AnalysisBrief,
    target: &ImageData,
    style_references: &[ImageData],
    identity_anchor: Option<&AnchorImage>,
    aspect_ratio: AspectRatio,
) -> Vec<GenerationPart> {
    let mut parts = Vec::with_capacity(style_references.len() * 2 + 5);
    parts.push(GenerationPart::text(format!(
        "{}\nFrame aspect ratio: {aspect_ratio}. Render a single storyboard frame with no text, \
captions or borders.",
        brief.image_prompt.trim()
    )));
    for (idx, image) in style_references.iter().enumerate() {
        parts.push(GenerationPart::text(format!(
            "STYLE REFERENCE {}: match its rendering style, palette, line work and lighting only. \
Do not copy its characters, objects or composition.",
            idx + 1
        )));
        parts.push(GenerationPart::Image(image.clone()));
    }
    parts.push(GenerationPart::text(format!(
        "SUBJECT: keep the identity of this subject (shape, features, colors, clothing) but not \
its pose or framing. Required change: {}",
        brief.transformation.trim()
    )));
    parts.push(GenerationPart::Image(target.clone()));
    if let Some(anchor) = identity_anchor {
        parts.push(GenerationPart::text(format!(
            "IDENTITY ANCHOR for '{}': the authoritative appearance of this subject. It overrides \
every other reference. Pose and framing may differ, appearance must not.",
            anchor.role_label
        )));
        parts.push(GenerationPart::Image(anchor.image.clone()));
    }
    parts
}
