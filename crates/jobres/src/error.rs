use thiserror::Error;

use crate::pack::UnpackError;

#[derive(Debug, Error)]
pub enum JrError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Inconsistency: {0}")]
    Inconsistency(String),
    #[error("Out of range: {0}")]
    OutOfRange(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] UnpackError),
}

pub(crate) fn invalid_input<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(JrError::InvalidInput(message.into()))
}

pub(crate) fn inconsistency<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(JrError::Inconsistency(message.into()))
}

pub(crate) fn out_of_range<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(JrError::OutOfRange(message.into()))
}
