//! Persistence capabilities for the pipeline consumers
//!
//! Two capabilities, each consumed by exactly one kind of actor:
//! - [`MetadataStore`]: the active-hashtag set, transactional persistence of
//!   scraped video metadata, and the post and author trends view refreshes
//! - [`EmbeddingStore`]: per-post embedding rows keyed by `(post_id, element_id)`
//!
//! Both are implemented by [`PostgresStore`] (`PostgreSQL` + pgvector) and by
//! [`MemoryStore`], which keeps the same conflict, transaction and foreign-key
//! semantics in process.
//!
//! Sessions are opened per message and never shared between messages.
//!
//! # Example
//!
//! ```rust,no_run
//! use svt_storage::{MetadataStore, PostgresConfig, PostgresStore};
//!
//! # async fn run() -> Result<(), svt_storage::StorageError> {
//! let store = PostgresStore::new(PostgresConfig::default());
//! for hashtag in store.active_hashtags().await? {
//!     println!("monitoring #{hashtag}");
//! }
//! # Ok(())
//! # }
//! ```

use svt_common::VideoMetadataMessage;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{FailPoint, MemoryStore, MetadataStep};
pub use postgres::{PostgresConfig, PostgresStore};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    /// Uniqueness or foreign-key violation
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl StorageError {
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Structured metadata persistence
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Titles of the hashtags currently marked active
    async fn active_hashtags(&self) -> StorageResult<Vec<String>>;

    /// Persist one video's metadata in a single all-or-nothing transaction
    ///
    /// Authors, music and posts are inserted if absent, stat snapshots are
    /// inserted if absent for `(id, collected_at)`, and each challenge's
    /// `hashtag_count` is incremented when the challenge already exists.
    async fn persist_video_metadata(&self, message: &VideoMetadataMessage) -> StorageResult<()>;

    /// Recompute the `post_trends` materialized view
    async fn refresh_post_trends(&self) -> StorageResult<()>;

    /// Recompute the `author_trends` materialized view
    async fn refresh_author_trends(&self) -> StorageResult<()>;
}

/// Embedding row persistence
#[async_trait::async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Append `vectors` to the post in order, in one transaction
    ///
    /// Returns the element ids assigned to each vector.
    async fn append_embeddings(&self, post_id: &str, vectors: &[Vec<f32>])
        -> StorageResult<Vec<i32>>;
}
