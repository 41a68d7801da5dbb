use thiserror::Error;

use crate::types::InputHint;

/// Top-level error type for the ocrgate orchestration core.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("backend not found: {0}")]
    NotFound(String),

    #[error("backend already registered: {0}")]
    DuplicateName(String),

    #[error("unsupported input format: {format} (supported: {})", supported.join(", "))]
    UnsupportedFormat {
        format: String,
        supported: Vec<String>,
    },

    #[error("malformed input{}: {reason}", hint.map(|h| format!(" at {h}")).unwrap_or_default())]
    MalformedInput {
        reason: String,
        hint: Option<InputHint>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("dispatcher overloaded: {depth} requests waiting (limit {limit})")]
    Overloaded { depth: usize, limit: usize },

    #[error("backend '{name}' failed to load: {reason}")]
    BackendLoad { name: String, reason: String },

    #[error("device memory allocation failed: requested {requested} bytes, available {available} bytes")]
    DeviceOutOfMemory { requested: usize, available: usize },

    #[error("PDF rendering error: {0}")]
    PdfRender(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcrError {
    /// HTTP status a transport layer should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            OcrError::UnsupportedFormat { .. } | OcrError::InvalidInput(_) => 400,
            OcrError::NotFound(_) => 404,
            OcrError::MalformedInput { .. } => 422,
            OcrError::Overloaded { .. }
            | OcrError::BackendLoad { .. }
            | OcrError::DeviceOutOfMemory { .. } => 503,
            _ => 500,
        }
    }

    /// True when the error was caused by the caller's request rather than
    /// by the service.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    pub fn malformed(reason: impl Into<String>, hint: Option<InputHint>) -> Self {
        OcrError::MalformedInput {
            reason: reason.into(),
            hint,
        }
    }
}

pub type Result<T> = std::result::Result<T, OcrError>;

/// Failure raised by a backend while processing a single frame.
///
/// `ResourceExhausted` is transient and retried by the accelerator guard;
/// `Processing` is terminal for the frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("processing failed: {0}")]
    Processing(String),
}

impl From<OcrError> for FrameError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::DeviceOutOfMemory { .. } => FrameError::ResourceExhausted(err.to_string()),
            other => FrameError::Processing(other.to_string()),
        }
    }
}
