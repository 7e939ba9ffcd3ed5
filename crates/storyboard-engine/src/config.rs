use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

pub const DEFAULT_ANALYSIS_TIMEOUT_S: f64 = 60.0;
pub const DEFAULT_SYNTHESIS_TIMEOUT_S: f64 = 180.0;
pub const DEFAULT_STORY_LANGUAGE: &str = "English";
/// The language image models follow most reliably, whatever the story uses.
pub const IMAGE_PROMPT_LANGUAGE: &str = "English";

/// Which side gets the extra slot when the reference window grows past the
/// two adjacent neighbors and both sides still have room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtensionBias {
    #[default]
    Left,
    Right,
}

impl FromStr for ExtensionBias {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "left" | "before" => Ok(Self::Left),
            "right" | "after" => Ok(Self::Right),
            other => bail!("unknown extension bias '{other}' (expected left or right)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceWindow {
    pub max_references: usize,
    pub extension_bias: ExtensionBias,
}

impl Default for ReferenceWindow {
    fn default() -> Self {
        Self {
            max_references: 2,
            extension_bias: ExtensionBias::Left,
        }
    }
}

/// Where the human-facing prompt of a finished frame comes from, tried in
/// order until one is non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPromptSource {
    VideoPrompt,
    VisualDescription,
    Instruction,
}

pub const DEFAULT_DISPLAY_PROMPT_PRECEDENCE: [DisplayPromptSource; 3] = [
    DisplayPromptSource::VideoPrompt,
    DisplayPromptSource::VisualDescription,
    DisplayPromptSource::Instruction,
];

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub analysis_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub reference_window: ReferenceWindow,
    pub story_language: String,
    pub analysis_model: Option<String>,
    pub synthesis_model: Option<String>,
    pub display_prompt_precedence: Vec<DisplayPromptSource>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_timeout: Duration::from_secs_f64(DEFAULT_ANALYSIS_TIMEOUT_S),
            synthesis_timeout: Duration::from_secs_f64(DEFAULT_SYNTHESIS_TIMEOUT_S),
            reference_window: ReferenceWindow::default(),
            story_language: DEFAULT_STORY_LANGUAGE.to_string(),
            analysis_model: None,
            synthesis_model: None,
            display_prompt_precedence: DEFAULT_DISPLAY_PROMPT_PRECEDENCE.to_vec(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; out-of-range numbers are
    /// clamped and unparsable ones fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        config.analysis_timeout = Duration::from_secs_f64(clamped_f64(
            get("STORYBOARD_ANALYSIS_TIMEOUT"),
            DEFAULT_ANALYSIS_TIMEOUT_S,
            5.0,
            300.0,
        ));
        config.synthesis_timeout = Duration::from_secs_f64(clamped_f64(
            get("STORYBOARD_SYNTHESIS_TIMEOUT"),
            DEFAULT_SYNTHESIS_TIMEOUT_S,
            15.0,
            600.0,
        ));
        config.reference_window.max_references =
            clamped_f64(get("STORYBOARD_REFERENCE_WINDOW"), 2.0, 0.0, 6.0).round() as usize;
        if let Some(bias) = get("STORYBOARD_REFERENCE_BIAS").and_then(|raw| raw.parse().ok()) {
            config.reference_window.extension_bias = bias;
        }
        if let Some(language) = get("STORYBOARD_STORY_LANGUAGE") {
            config.story_language = language;
        }
        config.analysis_model = get("STORYBOARD_ANALYSIS_MODEL");
        config.synthesis_model = get("STORYBOARD_SYNTHESIS_MODEL");
        config
    }
}

fn clamped_f64(raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}
