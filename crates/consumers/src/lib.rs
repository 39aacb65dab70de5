//! Persistence consumers
//!
//! [`MetadataConsumer`] writes scraped metadata, [`EmbeddingsConsumer`] writes
//! embedding rows. Both process up to [`CONSUMER_PREFETCH`] deliveries
//! concurrently and leave redelivery to the broker: a storage failure maps to
//! [`HandlerError::Retry`], an undecodable payload to [`HandlerError::Decode`].

pub mod embeddings;
pub mod metadata;

pub use embeddings::{EmbeddingsConsumer, StoreOutcome};
pub use metadata::MetadataConsumer;

pub use svt_broker::HandlerError;

/// Prefetch for the metadata and embeddings queues
pub const CONSUMER_PREFETCH: u16 = 100;

#[cfg(test)]
pub(crate) mod testing {
    use svt_broker::{Acknowledge, BrokerResult, Delivery};

    struct NoAck;

    #[async_trait::async_trait]
    impl Acknowledge for NoAck {
        async fn ack(&self) -> BrokerResult<()> {
            Ok(())
        }

        async fn nack(&self, _requeue: bool) -> BrokerResult<()> {
            Ok(())
        }
    }

    pub fn delivery(routing_key: &str, body: Vec<u8>) -> Delivery {
        Delivery::new(routing_key.to_string(), body, false, Box::new(NoAck))
    }
}
