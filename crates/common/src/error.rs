//! Wire-level errors

use thiserror::Error;

/// A payload or routing key did not match the expected message kind
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid binary envelope: {0}")]
    Binary(String),

    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// A message could not be serialized for publishing
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding failed: {0}")]
    Binary(String),
}

impl From<bincode::Error> for DecodeError {
    fn from(err: bincode::Error) -> Self {
        DecodeError::Binary(err.to_string())
    }
}

impl From<bincode::Error> for EncodeError {
    fn from(err: bincode::Error) -> Self {
        EncodeError::Binary(err.to_string())
    }
}
