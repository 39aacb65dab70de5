//! Broker capability for pipeline actors
//!
//! Actors never subclass a shared client; each one is handed a
//! [`BrokerClient`] and uses only the four things it needs: publish, consume,
//! and acknowledge (through [`Delivery`]), plus a topology check at startup.
//!
//! Two implementations are provided:
//! - [`AmqpBroker`]: RabbitMQ over AMQP 0.9.1 (lapin)
//! - [`MemoryBroker`]: in-process topic routing with prefetch and requeue, used
//!   by tests and local runs
//!
//! # Example
//!
//! ```rust,no_run
//! use svt_broker::{AmqpBroker, BrokerClient, BrokerConfig, OutgoingMessage};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = AmqpBroker::connect(&BrokerConfig::default(), "example").await?;
//! let message = OutgoingMessage::json(br#"{"hashtag":"harris"}"#.to_vec());
//! broker.publish("tasks_exchange", "producer.hashtag_search", message).await?;
//! # Ok(())
//! # }
//! ```

pub mod amqp;
pub mod config;
pub mod dispatch;
pub mod memory;
pub mod retry;
pub mod topic;
pub mod topology;

pub use amqp::AmqpBroker;
pub use config::BrokerConfig;
pub use dispatch::{consume_deliveries, run_consumer, HandlerError, MessageHandler};
pub use memory::MemoryBroker;
pub use retry::{retry_startup, StartupRetry};
pub use topic::topic_matches;
pub use topology::{Binding, Topology};

use futures::stream::BoxStream;
use svt_common::codec::{BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE};
use svt_common::{EncodeError, WireMessage};
use thiserror::Error;

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Topology missing: {0}")]
    TopologyMissing(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Broker closed")]
    Closed,

    #[error("Startup failed after {attempts} attempts: {last_error}")]
    StartupExhausted { attempts: u32, last_error: String },
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// A message ready to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub content_type: &'static str,
    /// Survive a broker restart (delivery mode 2)
    pub persistent: bool,
}

impl OutgoingMessage {
    /// Persistent JSON message
    #[must_use]
    pub fn json(payload: Vec<u8>) -> Self {
        Self {
            payload,
            content_type: JSON_CONTENT_TYPE,
            persistent: true,
        }
    }

    /// Persistent binary message
    #[must_use]
    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            payload,
            content_type: BINARY_CONTENT_TYPE,
            persistent: true,
        }
    }

    /// Encode a typed message, marked persistent
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn encode<M: WireMessage>(message: &M) -> Result<Self, EncodeError> {
        Ok(Self {
            payload: message.encode()?,
            content_type: M::CONTENT_TYPE,
            persistent: true,
        })
    }
}

/// Settles a delivery with the broker
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    /// Negative acknowledgement; `requeue` asks the broker to redeliver
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A received message
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Set when the broker has delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    #[must_use]
    pub fn new(
        routing_key: String,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            routing_key,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge successful processing
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the acknowledgement.
    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    /// Negative acknowledgement
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the acknowledgement.
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Narrow broker capability injected into every actor
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish to an exchange with a routing key
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()>;

    /// Start consuming a queue with at most `prefetch` unacknowledged deliveries
    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream>;

    /// Declare exchanges, queues and bindings (idempotent)
    async fn declare_topology(&self, topology: &Topology) -> BrokerResult<()>;

    /// Check that the topology exists without creating anything
    async fn verify_topology(&self, topology: &Topology) -> BrokerResult<()>;
}
