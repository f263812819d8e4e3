use jobres::pack::UnpackError;
use thiserror::Error;

use crate::common::error::DbdError::Generic;

#[derive(Debug, Error)]
pub enum DbdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Accounting daemon connection error: {0}")]
    DbConnection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Agent queue is full, {0} messages were saved for replay")]
    ReplayOverflow(usize),
    #[error("Fatal error: {0}")]
    Fatal(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Error: {0}")]
    Generic(String),
}

impl From<UnpackError> for DbdError {
    fn from(e: UnpackError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<jobres::Error> for DbdError {
    fn from(e: jobres::Error) -> Self {
        match e {
            jobres::Error::Protocol(e) => e.into(),
            e => Generic(e.to_string()),
        }
    }
}

impl From<toml::de::Error> for DbdError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<String> for DbdError {
    fn from(e: String) -> Self {
        Generic(e)
    }
}

impl From<&str> for DbdError {
    fn from(e: &str) -> Self {
        Generic(e.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(Generic(message))
}

pub(crate) fn connection_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(DbdError::DbConnection(message.into()))
}

pub(crate) fn protocol_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(DbdError::Protocol(message.into()))
}
