//! Common types for the short-video enrichment pipeline
//!
//! Every actor in the pipeline talks to the others only through the broker.
//! This crate defines what travels over it:
//! - the typed message kinds ([`ScrapeTask`], [`VideoMetadataMessage`],
//!   [`VideoByteMessage`], [`EmbeddingMessage`])
//! - the dot-delimited routing keys whose final segment is the subject id
//! - the wire codecs, which validate at the deserialization boundary

pub mod codec;
pub mod error;
pub mod messages;
pub mod routing;

pub use codec::WireMessage;
pub use error::{DecodeError, EncodeError};
pub use messages::{
    truncate_to_minute, AuthorInfo, AuthorStats, ChallengeInfo, EmbeddingMessage, MusicInfo,
    PostStats, ScrapeTask, VideoByteMessage, VideoMetadataMessage,
};
pub use routing::{subject_id, RoutingKey, TaskKind};

/// Dimension of every vector produced by the multimodal embedding model
pub const EMBEDDING_DIM: usize = 1408;

/// Number of videos requested per hashtag scrape
pub const DEFAULT_REQUESTED_COUNT: u32 = 500;
