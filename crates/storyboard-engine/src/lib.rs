pub mod artist;
pub mod assembler;
pub mod capability;
pub mod config;
pub mod director;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod schema;
pub mod source;

#[cfg(test)]
mod test_support;

pub use artist::{AnchorImage, Artist};
pub use assembler::{AssembledContext, ContextAssembler, IdentityAnchor, StyleReference};
pub use capability::{
    default_capability_registry, CapabilityRegistry, GenerationPart, ImageGenerator, ImageRequest,
    ImageResponse, StructuredGenerator, StructuredRequest,
};
pub use config::{DisplayPromptSource, ExtensionBias, PipelineConfig, ReferenceWindow};
pub use director::{brief_schema, AnalysisBrief, Director, DirectorInput};
pub use error::{
    CapabilityError, CapabilityErrorKind, FailedStage, FailureKind, PipelineError, RecoverableKind,
};
pub use pipeline::{AdaptationRequest, AdaptationResult, AdaptationTarget, Pipeline};
pub use progress::{
    CollectingProgress, NoProgress, PipelineState, ProgressEvent, ProgressFanout, ProgressSink,
    ProgressStage,
};
pub use providers::{DryrunProvider, GeminiProvider};
pub use schema::{OutputSchema, SchemaViolation};
pub use source::ImageResolver;
