use std::fmt;

use thiserror::Error;

/// How a call into a generative capability went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityErrorKind {
    /// Credentials missing, rejected, or out of quota.
    QuotaExceeded,
    /// The service answered with a 5xx or could not be reached.
    ServiceUnavailable,
    Timeout,
    Transport,
    /// The service answered, but not with something usable.
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::QuotaExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::ServiceUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Transport, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::InvalidResponse, message)
    }

    /// Classifies a non-success HTTP answer from `provider`.
    pub fn from_status(provider: &str, code: u16, body: &str) -> Self {
        let message = format!("{provider} request failed ({code}): {body}");
        let exhausted = body.contains("RESOURCE_EXHAUSTED") || body.contains("PERMISSION_DENIED");
        match code {
            401 | 403 | 429 => Self::quota(message),
            _ if exhausted => Self::quota(message),
            500 | 502 | 503 | 504 => Self::unavailable(message),
            _ => Self::transport(message),
        }
    }
}

/// Failures the caller may retry after an out-of-band recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableKind {
    QuotaExceeded,
    ServiceUnavailable,
}

impl RecoverableKind {
    pub fn action(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => {
                "Select a different API key, or wait for the quota to reset, then try again."
            }
            Self::ServiceUnavailable => {
                "The generation service is temporarily unavailable. Wait a moment and try again."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Generic,
    Timeout,
    /// The payload did not conform to the requested schema.
    Malformed,
    /// The image call succeeded but carried no inline image.
    NoImage,
    Recoverable(RecoverableKind),
}

impl From<CapabilityErrorKind> for FailureKind {
    fn from(kind: CapabilityErrorKind) -> Self {
        match kind {
            CapabilityErrorKind::QuotaExceeded => Self::Recoverable(RecoverableKind::QuotaExceeded),
            CapabilityErrorKind::ServiceUnavailable => {
                Self::Recoverable(RecoverableKind::ServiceUnavailable)
            }
            CapabilityErrorKind::Timeout => Self::Timeout,
            CapabilityErrorKind::InvalidResponse => Self::Malformed,
            CapabilityErrorKind::Transport => Self::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Context,
    Analysis,
    Synthesis,
}

impl fmt::Display for FailedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Context => "context",
            Self::Analysis => "analysis",
            Self::Synthesis => "synthesis",
        })
    }
}

/// Why an adaptation produced nothing. Partial results never escape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("context error: {message}")]
    Context { message: String },
    #[error("analysis failed: {message}")]
    Analysis { kind: FailureKind, message: String },
    #[error("synthesis failed: {message}")]
    Synthesis { kind: FailureKind, message: String },
}

impl PipelineError {
    pub fn context(message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
        }
    }

    pub fn analysis(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Analysis {
            kind,
            message: message.into(),
        }
    }

    pub fn synthesis(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Synthesis {
            kind,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> FailedStage {
        match self {
            Self::Context { .. } => FailedStage::Context,
            Self::Analysis { .. } => FailedStage::Analysis,
            Self::Synthesis { .. } => FailedStage::Synthesis,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Context { .. } => FailureKind::Generic,
            Self::Analysis { kind, .. } | Self::Synthesis { kind, .. } => *kind,
        }
    }

    pub fn recoverable(&self) -> Option<RecoverableKind> {
        match self.kind() {
            FailureKind::Recoverable(kind) => Some(kind),
            _ => None,
        }
    }

    /// One sentence for the person at the keyboard: which stage failed and,
    /// where one exists, what to do about it.
    pub fn user_message(&self) -> String {
        let (stage, message) = match self {
            Self::Context { message } => {
                return format!("Could not read the source image: {message}");
            }
            Self::Analysis { message, .. } => ("Scene analysis", message),
            Self::Synthesis { message, .. } => ("Image synthesis", message),
        };
        match self.kind() {
            FailureKind::Recoverable(kind) => format!("{stage} failed. {}", kind.action()),
            FailureKind::Timeout => format!("{stage} timed out. Try again."),
            FailureKind::Malformed => {
                format!("{stage} returned an unusable response. Try again.")
            }
            FailureKind::NoImage => {
                format!("{stage} returned no image. Try again or rephrase the instruction.")
            }
            FailureKind::Generic => format!("{stage} failed: {message}"),
        }
    }
}
