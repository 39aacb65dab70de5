//! Short-video trends pipeline
//!
//! Scrapes videos by hashtag, stores their metadata, and enriches each video
//! with multimodal embedding vectors. The pipeline is a chain of actors that
//! only talk through the message broker:
//!
//! ```text
//! TaskManager -> Producer -> MetadataConsumer
//!                         -> EnrichmentWorker -> EmbeddingsConsumer
//! ```
//!
//! Each actor lives in its own crate; this crate re-exports them.

pub use svt_broker as broker;
pub use svt_common as common;
pub use svt_consumers as consumers;
pub use svt_embeddings as embeddings;
pub use svt_enrichment as enrichment;
pub use svt_keyframe as keyframe;
pub use svt_producer as producer;
pub use svt_scene as scene;
pub use svt_storage as storage;
pub use svt_task_manager as task_manager;
