mod frame;
mod store;

pub use frame::{
    AspectRatio, Frame, FrameId, GenerationStatus, DEFAULT_FRAME_DURATION_S, MIN_FRAME_DURATION_S,
};
pub use store::{ApplyOutcome, InvocationTicket, StoryStore, STORY_SCHEMA_VERSION};
