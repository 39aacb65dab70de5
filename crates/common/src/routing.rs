//! Routing keys
//!
//! Keys are dot-delimited topic strings and the final segment is always the
//! subject id (hashtag, post id or task type):
//! - `content.hashtag.<hashtag>` - video metadata
//! - `content.bytes.<post_id>` - raw video payloads
//! - `content.embeddings.<post_id>` - embedding vectors
//! - `producer.<task_type>` - scrape tasks

use crate::DecodeError;
use std::fmt;

pub const HASHTAG_PREFIX: &str = "content.hashtag";
pub const BYTES_PREFIX: &str = "content.bytes";
pub const EMBEDDINGS_PREFIX: &str = "content.embeddings";
pub const TASK_PREFIX: &str = "producer";

/// Binding pattern for the metadata queue
pub const HASHTAG_BINDING: &str = "content.hashtag.#";
/// Binding pattern for the video bytes queue
pub const BYTES_BINDING: &str = "content.bytes.#";
/// Binding pattern for the embeddings queue
pub const EMBEDDINGS_BINDING: &str = "content.embeddings.#";
/// Binding pattern for the task queue
pub const TASK_BINDING: &str = "producer.#";

/// Task types understood by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    HashtagSearch,
}

impl TaskKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HashtagSearch => "hashtag_search",
        }
    }

    /// Parse a task type name
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownTaskType`] for any other name.
    pub fn parse(name: &str) -> Result<Self, DecodeError> {
        match name {
            "hashtag_search" => Ok(Self::HashtagSearch),
            other => Err(DecodeError::UnknownTaskType(other.to_string())),
        }
    }
}

/// A typed routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingKey {
    Hashtag(String),
    Bytes(String),
    Embeddings(String),
    Task(TaskKind),
}

impl RoutingKey {
    /// Key for a hashtag metadata message
    ///
    /// # Errors
    ///
    /// Fails when the hashtag is empty or contains a dot.
    pub fn hashtag(tag: &str) -> Result<Self, DecodeError> {
        Ok(Self::Hashtag(check_subject(tag)?))
    }

    /// Key for a raw video payload
    ///
    /// # Errors
    ///
    /// Fails when the post id is empty or contains a dot.
    pub fn bytes(post_id: &str) -> Result<Self, DecodeError> {
        Ok(Self::Bytes(check_subject(post_id)?))
    }

    /// Key for an embedding message
    ///
    /// # Errors
    ///
    /// Fails when the post id is empty or contains a dot.
    pub fn embeddings(post_id: &str) -> Result<Self, DecodeError> {
        Ok(Self::Embeddings(check_subject(post_id)?))
    }

    /// Parse a routing key received from the broker
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidRoutingKey`] when the key does not belong to
    /// a known family, and [`DecodeError::UnknownTaskType`] for an unknown task.
    pub fn parse(key: &str) -> Result<Self, DecodeError> {
        let invalid = || DecodeError::InvalidRoutingKey(key.to_string());
        let (family, subject) = key.rsplit_once('.').ok_or_else(invalid)?;
        if subject.is_empty() {
            return Err(invalid());
        }
        match family {
            HASHTAG_PREFIX => Ok(Self::Hashtag(subject.to_string())),
            BYTES_PREFIX => Ok(Self::Bytes(subject.to_string())),
            EMBEDDINGS_PREFIX => Ok(Self::Embeddings(subject.to_string())),
            TASK_PREFIX => Ok(Self::Task(TaskKind::parse(subject)?)),
            _ => Err(invalid()),
        }
    }

    /// The subject id carried in the final segment
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::Hashtag(s) | Self::Bytes(s) | Self::Embeddings(s) => s,
            Self::Task(kind) => kind.name(),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hashtag(tag) => write!(f, "{HASHTAG_PREFIX}.{tag}"),
            Self::Bytes(id) => write!(f, "{BYTES_PREFIX}.{id}"),
            Self::Embeddings(id) => write!(f, "{EMBEDDINGS_PREFIX}.{id}"),
            Self::Task(kind) => write!(f, "{TASK_PREFIX}.{}", kind.name()),
        }
    }
}

/// Final segment of any dot-delimited key
#[must_use]
pub fn subject_id(key: &str) -> Option<&str> {
    key.rsplit('.').next().filter(|s| !s.is_empty())
}

fn check_subject(subject: &str) -> Result<String, DecodeError> {
    if subject.is_empty() || subject.contains('.') {
        return Err(DecodeError::InvalidRoutingKey(format!(
            "subject must be non-empty and dot-free: {subject:?}"
        )));
    }
    Ok(subject.to_string())
}
