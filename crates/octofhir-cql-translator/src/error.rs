//! Error types for CQL translation

use thiserror::Error;

/// Result type for translation operations
pub type TranslatorResult<T> = Result<T, TranslatorError>;

/// Errors that abort a translation request.
///
/// Compilation diagnostics are not errors: they travel inside the
/// translated output and only influence the verdict.
#[derive(Debug, Error)]
pub enum TranslatorError {
    /// Source text could not be read from the request
    #[error("Unable to read request")]
    UnreadableRequest,

    /// Requested output media type is not an ELM representation
    #[error("Unsupported media type: {0}")]
    UnsupportedFormat(String),

    /// The `signatures` parameter named an unknown signature level
    #[error("Invalid signature level: {0}")]
    InvalidSignatureLevel(String),

    /// Anything else that went wrong while translating
    #[error("Translation failed: {0}")]
    Internal(String),
}

impl TranslatorError {
    /// Whether the error was caused by the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, TranslatorError::Internal(_))
    }
}

impl From<std::str::Utf8Error> for TranslatorError {
    fn from(_: std::str::Utf8Error) -> Self {
        TranslatorError::UnreadableRequest
    }
}

impl From<std::string::FromUtf8Error> for TranslatorError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        TranslatorError::UnreadableRequest
    }
}

impl From<std::io::Error> for TranslatorError {
    fn from(_: std::io::Error) -> Self {
        TranslatorError::UnreadableRequest
    }
}
