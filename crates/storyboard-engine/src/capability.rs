use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use storyboard_contracts::media::ImageData;
use storyboard_contracts::story::AspectRatio;

use crate::error::CapabilityError;
use crate::providers::{DryrunProvider, GeminiProvider};
use crate::schema::OutputSchema;

/// One element of a multimodal request, sent in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationPart {
    Text(String),
    Image(ImageData),
}

impl GenerationPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_image(&self) -> Option<&ImageData> {
        match self {
            Self::Image(image) => Some(image),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub model: String,
    pub parts: Vec<GenerationPart>,
    pub schema: OutputSchema,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: String,
    pub parts: Vec<GenerationPart>,
    pub aspect_ratio: AspectRatio,
    pub timeout: Duration,
}

impl ImageRequest {
    pub fn images(&self) -> impl Iterator<Item = &ImageData> {
        self.parts.iter().filter_map(GenerationPart::as_image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Text(String),
    InlineImage(ImageData),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageResponse {
    pub parts: Vec<ResponsePart>,
}

impl ImageResponse {
    /// The first inline image, ignoring any narration around it.
    pub fn into_first_image(self) -> Option<ImageData> {
        self.parts.into_iter().find_map(|part| match part {
            ResponsePart::InlineImage(image) => Some(image),
            ResponsePart::Text(_) => None,
        })
    }
}

/// Schema-constrained generation. Implementations must return a payload
/// that validates against `request.schema` or fail with
/// `InvalidResponse`; they never coerce.
pub trait StructuredGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, CapabilityError>;
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, CapabilityError>;
}

#[derive(Default)]
pub struct CapabilityRegistry {
    structured: BTreeMap<String, Arc<dyn StructuredGenerator>>,
    image: BTreeMap<String, Arc<dyn ImageGenerator>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_structured(&mut self, provider: Arc<dyn StructuredGenerator>) {
        self.structured
            .insert(provider.name().to_string(), provider);
    }

    pub fn register_image(&mut self, provider: Arc<dyn ImageGenerator>) {
        self.image.insert(provider.name().to_string(), provider);
    }

    /// Registers a provider serving both capabilities.
    pub fn register<P>(&mut self, provider: P)
    where
        P: StructuredGenerator + ImageGenerator + 'static,
    {
        let provider = Arc::new(provider);
        self.register_structured(provider.clone());
        self.register_image(provider);
    }

    pub fn structured(&self, name: &str) -> Option<Arc<dyn StructuredGenerator>> {
        self.structured.get(name).cloned()
    }

    pub fn image(&self, name: &str) -> Option<Arc<dyn ImageGenerator>> {
        self.image.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .structured
            .keys()
            .chain(self.image.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

pub fn default_capability_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(DryrunProvider);
    registry.register(GeminiProvider::new());
    registry
}
