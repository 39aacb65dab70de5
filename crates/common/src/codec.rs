//! Wire codecs
//!
//! JSON for tasks, metadata and embeddings; a bincode envelope for raw video
//! payloads. Decoding validates the fields downstream code relies on, so a
//! mismatched payload fails here with a [`DecodeError`] instead of deep inside
//! a handler.

use crate::messages::{EmbeddingMessage, ScrapeTask, VideoByteMessage, VideoMetadataMessage};
use crate::{DecodeError, EncodeError, EMBEDDING_DIM};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A message kind with a fixed wire encoding
pub trait WireMessage: Sized {
    /// MIME type set on published messages
    const CONTENT_TYPE: &'static str;

    /// Serialize for publishing
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self) -> Result<Vec<u8>, EncodeError>;

    /// Deserialize and validate a received payload
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed or fails validation.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn require(field: &str, value: &str) -> Result<(), DecodeError> {
    if value.trim().is_empty() {
        return Err(DecodeError::Invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

impl WireMessage for ScrapeTask {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_json(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let task: Self = decode_json(bytes)?;
        require("hashtag", &task.hashtag)?;
        Ok(task)
    }
}

impl WireMessage for VideoMetadataMessage {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_json(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let msg: Self = decode_json(bytes)?;
        require("post_id", &msg.post_id)?;
        require("author.id", &msg.author.id)?;
        require("music.id", &msg.music.id)?;
        for challenge in &msg.challenges {
            require("challenge.id", &challenge.id)?;
        }
        Ok(msg)
    }
}

impl WireMessage for VideoByteMessage {
    const CONTENT_TYPE: &'static str = BINARY_CONTENT_TYPE;

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let msg: Self = bincode::deserialize(bytes)?;
        if msg.video.is_empty() {
            return Err(DecodeError::Invalid("video payload is empty".to_string()));
        }
        Ok(msg)
    }
}

impl WireMessage for EmbeddingMessage {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_json(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let msg: Self = decode_json(bytes)?;
        if let Some((i, v)) = msg
            .vectors
            .iter()
            .enumerate()
            .find(|(_, v)| v.len() != EMBEDDING_DIM)
        {
            return Err(DecodeError::Invalid(format!(
                "vector {i} has {} dimensions, expected {EMBEDDING_DIM}",
                v.len()
            )));
        }
        Ok(msg)
    }
}
