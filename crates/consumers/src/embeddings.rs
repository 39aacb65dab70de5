//! Embeddings consumer
//!
//! The post id comes from the routing key; element ids are assigned by the
//! store at write time. Integrity violations (for instance a post whose
//! metadata has not been stored) are logged and the message is acknowledged
//! without persisting anything. Every other storage error is retried.

use async_trait::async_trait;
use std::sync::Arc;
use svt_broker::{Delivery, HandlerError, MessageHandler};
use svt_common::{DecodeError, EmbeddingMessage, RoutingKey, WireMessage};
use svt_storage::{EmbeddingStore, StorageError, StorageResult};
use tracing::{error, info};

/// What became of one embedding message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Element ids assigned to the vectors, in order
    Stored(Vec<i32>),
    /// Dropped after an integrity violation
    Discarded(String),
}

/// Integrity violations are dropped; any other error propagates
fn absorb_integrity(result: StorageResult<Vec<i32>>) -> StorageResult<StoreOutcome> {
    match result {
        Ok(ids) => Ok(StoreOutcome::Stored(ids)),
        Err(StorageError::Integrity(reason)) => Ok(StoreOutcome::Discarded(reason)),
        Err(e) => Err(e),
    }
}

pub struct EmbeddingsConsumer {
    store: Arc<dyn EmbeddingStore>,
}

impl EmbeddingsConsumer {
    #[must_use]
    pub fn new(store: Arc<dyn EmbeddingStore>) -> Self {
        Self { store }
    }

    /// Store the vectors of one post
    ///
    /// # Errors
    ///
    /// Returns any storage error other than an integrity violation.
    pub async fn store(&self, post_id: &str, message: &EmbeddingMessage) -> StorageResult<StoreOutcome> {
        let outcome = absorb_integrity(
            self.store
                .append_embeddings(post_id, &message.vectors)
                .await,
        )?;
        match &outcome {
            StoreOutcome::Stored(ids) => {
                info!("Stored {} embeddings for post {}", ids.len(), post_id);
            }
            StoreOutcome::Discarded(reason) => {
                error!(
                    "Discarding {} embeddings for post {}: {}",
                    message.vectors.len(),
                    post_id,
                    reason
                );
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl MessageHandler for EmbeddingsConsumer {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let post_id = match RoutingKey::parse(&delivery.routing_key)? {
            RoutingKey::Embeddings(post_id) => post_id,
            _ => {
                return Err(DecodeError::InvalidRoutingKey(delivery.routing_key.clone()).into());
            }
        };
        let message = EmbeddingMessage::decode(&delivery.body)?;
        self.store(&post_id, &message)
            .await
            .map_err(HandlerError::retry)?;
        Ok(())
    }
}
