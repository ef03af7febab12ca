use thiserror::Error;

/// The one failure kind surfaced by a conversion attempt.
///
/// Missing input, output-dir creation, non-zero exit, missing artifact,
/// timeout and launch failures all land here; the message carries the detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConversionError {
    message: String,
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type ConversionResult<T> = std::result::Result<T, ConversionError>;
