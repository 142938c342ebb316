use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScreensError {
    #[error("Frame capture failed for screenshot {index}: {message}")]
    CaptureFailed { index: usize, message: String },

    #[error("Frame probe failed: {0}")]
    ProbeFailed(String),

    #[error("Optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("Screenshot {index} failed size validation after {attempts} attempts")]
    ValidationFailed { index: usize, attempts: usize },

    #[error("Upload to {host} failed: {error}")]
    UploadFailed { host: String, error: UploadError },

    #[error("all configured image hosts exhausted (attempted: {})", .attempted.join(", "))]
    HostExhaustion { attempted: Vec<String> },

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ScreensError {
    /// Whether the failing image can be salvaged by a retake or another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScreensError::CaptureFailed { .. }
            | ScreensError::ValidationFailed { .. } => true,
            ScreensError::UploadFailed { error, .. } => !error.is_terminal(),
            _ => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScreensError::OptimizationFailed(_) | ScreensError::ProbeFailed(_) => {
                ErrorSeverity::Low
            }
            ScreensError::CaptureFailed { .. } | ScreensError::ValidationFailed { .. } => {
                ErrorSeverity::Low
            }
            ScreensError::ConfigurationError(_) | ScreensError::InvalidSource(_) => {
                ErrorSeverity::High
            }
            ScreensError::HostExhaustion { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Classification reported by an image host backend for a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailureKind {
    /// The host already holds identical content.
    Duplicate,
    /// The host rejected the configured credentials.
    AuthFailure,
    /// Timeouts, 5xx responses, dropped connections.
    Transient,
}

impl fmt::Display for UploadFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadFailureKind::Duplicate => "duplicate",
            UploadFailureKind::AuthFailure => "auth failure",
            UploadFailureKind::Transient => "transient",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct UploadError {
    pub kind: UploadFailureKind,
    pub message: String,
}

impl UploadError {
    pub fn new(kind: UploadFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(UploadFailureKind::Duplicate, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(UploadFailureKind::AuthFailure, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(UploadFailureKind::Transient, message)
    }

    /// Terminal failures abort the retry loop for the current host immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            UploadFailureKind::Duplicate | UploadFailureKind::AuthFailure
        )
    }
}

impl From<std::io::Error> for ScreensError {
    fn from(err: std::io::Error) -> Self {
        ScreensError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ScreensError {
    fn from(err: serde_json::Error) -> Self {
        ScreensError::SerializationError(err.to_string())
    }
}

impl From<image::ImageError> for ScreensError {
    fn from(err: image::ImageError) -> Self {
        ScreensError::ImageError(err.to_string())
    }
}
