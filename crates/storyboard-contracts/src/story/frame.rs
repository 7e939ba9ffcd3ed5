use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_FRAME_DURATION_S: f64 = 0.25;
pub const DEFAULT_FRAME_DURATION_S: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FrameId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Widescreen,
    #[serde(rename = "4:3")]
    Standard,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "9:16")]
    Vertical,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 4] = [
        AspectRatio::Widescreen,
        AspectRatio::Standard,
        AspectRatio::Square,
        AspectRatio::Vertical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Widescreen => "16:9",
            Self::Standard => "4:3",
            Self::Square => "1:1",
            Self::Vertical => "9:16",
        }
    }

    /// Pixel dimensions at roughly one megapixel, used by offline renderers.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Widescreen => (1344, 768),
            Self::Standard => (1184, 888),
            Self::Square => (1024, 1024),
            Self::Vertical => (768, 1344),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim();
        for ratio in Self::ALL {
            if ratio.as_str() == normalized {
                return Ok(ratio);
            }
        }
        bail!("unsupported aspect ratio '{normalized}' (expected 16:9, 4:3, 1:1 or 9:16)")
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Idle,
    Generating {
        message: String,
    },
    Error {
        message: String,
    },
}

impl GenerationStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Generating { message } | Self::Error { message } => Some(message.as_str()),
        }
    }
}

/// One storyboard beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    #[serde(default)]
    pub image_versions: Vec<String>,
    #[serde(default)]
    pub active_version_index: usize,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(default)]
    pub source_hash: Option<String>,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub generation_status: GenerationStatus,
}

impl Frame {
    pub fn new(image_url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: FrameId::generate(),
            image_versions: vec![image_url.into()],
            active_version_index: 0,
            prompt: prompt.into(),
            duration: DEFAULT_FRAME_DURATION_S,
            source_hash: None,
            aspect_ratio: AspectRatio::default(),
            generation_status: GenerationStatus::Idle,
        }
    }

    /// A placeholder slot whose image is still being produced.
    pub fn pending(prompt: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: FrameId::generate(),
            image_versions: Vec::new(),
            active_version_index: 0,
            prompt: prompt.into(),
            duration: DEFAULT_FRAME_DURATION_S,
            source_hash: None,
            aspect_ratio: AspectRatio::default(),
            generation_status: GenerationStatus::Generating {
                message: message.into(),
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<FrameId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_source_hash(mut self, hash: impl Into<String>) -> Self {
        self.source_hash = Some(hash.into());
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.set_duration(duration);
        self
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = if duration.is_finite() {
            duration.max(MIN_FRAME_DURATION_S)
        } else {
            DEFAULT_FRAME_DURATION_S
        };
    }

    /// The active version, if one exists at all.
    pub fn active_image(&self) -> Option<&str> {
        self.image_versions
            .get(self.active_version_index)
            .map(String::as_str)
    }

    /// The active version when the frame is settled enough to be shown to a
    /// generator as context. Generating and failed frames never qualify.
    pub fn usable_image(&self) -> Option<&str> {
        if !self.generation_status.is_idle() {
            return None;
        }
        self.active_image()
    }

    pub fn push_version(&mut self, image_url: impl Into<String>) {
        self.image_versions.push(image_url.into());
        self.active_version_index = self.image_versions.len() - 1;
    }

    pub fn set_active_version(&mut self, index: usize) -> anyhow::Result<()> {
        if index >= self.image_versions.len() {
            bail!(
                "frame {} has {} versions; index {index} out of range",
                self.id,
                self.image_versions.len()
            );
        }
        self.active_version_index = index;
        Ok(())
    }

    /// Drops every version after `index` and makes `index` active.
    pub fn rollback_to(&mut self, index: usize) -> anyhow::Result<()> {
        self.set_active_version(index)?;
        self.image_versions.truncate(index + 1);
        Ok(())
    }

    pub(crate) fn repair(&mut self) {
        self.set_duration(self.duration);
        if self.image_versions.is_empty() {
            self.active_version_index = 0;
        } else if self.active_version_index >= self.image_versions.len() {
            self.active_version_index = self.image_versions.len() - 1;
        }
    }
}

fn default_duration() -> f64 {
    DEFAULT_FRAME_DURATION_S
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_clamped_to_minimum() {
        let frame = Frame::new("data:image/png;base64,AA==", "a").with_duration(0.1);
        assert_eq!(frame.duration, MIN_FRAME_DURATION_S);
        let frame = Frame::new("data:image/png;base64,AA==", "a").with_duration(f64::NAN);
        assert_eq!(frame.duration, DEFAULT_FRAME_DURATION_S);
    }

    #[test]
    fn versions_append_and_roll_back() -> anyhow::Result<()> {
        let mut frame = Frame::new("v1", "a");
        frame.push_version("v2");
        frame.push_version("v3");
        assert_eq!(frame.active_image(), Some("v3"));

        frame.set_active_version(0)?;
        assert_eq!(frame.active_image(), Some("v1"));
        assert_eq!(frame.image_versions.len(), 3);

        frame.rollback_to(1)?;
        assert_eq!(frame.image_versions, vec!["v1", "v2"]);
        assert_eq!(frame.active_image(), Some("v2"));
        assert!(frame.set_active_version(2).is_err());
        Ok(())
    }

    #[test]
    fn pending_and_failed_frames_have_no_usable_image() {
        let pending = Frame::pending("b", "Analyzing...");
        assert_eq!(pending.usable_image(), None);

        let mut failed = Frame::new("v1", "c");
        failed.generation_status = GenerationStatus::Error {
            message: "boom".to_string(),
        };
        assert_eq!(failed.active_image(), Some("v1"));
        assert_eq!(failed.usable_image(), None);
    }

    #[test]
    fn aspect_ratio_parses_and_serializes_as_ratio_text() -> anyhow::Result<()> {
        assert_eq!("9:16".parse::<AspectRatio>()?, AspectRatio::Vertical);
        assert!("21:9".parse::<AspectRatio>().is_err());
        assert_eq!(serde_json::to_value(AspectRatio::Standard)?, "4:3");
        Ok(())
    }
}
