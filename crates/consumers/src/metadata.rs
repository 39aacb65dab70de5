//! Metadata consumer
//!
//! One transaction per message. Any failing statement rolls the whole message
//! back and the delivery is requeued, so partial writes never persist.

use async_trait::async_trait;
use std::sync::Arc;
use svt_broker::{Delivery, HandlerError, MessageHandler};
use svt_common::{VideoMetadataMessage, WireMessage};
use svt_storage::MetadataStore;
use tracing::{debug, info};

pub struct MetadataConsumer {
    store: Arc<dyn MetadataStore>,
}

impl MetadataConsumer {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for MetadataConsumer {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let message = VideoMetadataMessage::decode(&delivery.body)?;
        debug!(
            "Metadata for post {} via {} (redelivered: {})",
            message.post_id, delivery.routing_key, delivery.redelivered
        );

        self.store
            .persist_video_metadata(&message)
            .await
            .map_err(HandlerError::retry)?;

        info!(
            "Stored post {} by {} with {} hashtags",
            message.post_id,
            message.author.id,
            message.challenges.len()
        );
        Ok(())
    }
}
