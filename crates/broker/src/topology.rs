//! Exchange and queue layout
//!
//! One durable topic exchange carries content messages, another carries scrape
//! tasks. Each consumer owns one durable queue bound with a wildcard pattern.

use serde::{Deserialize, Serialize};
use svt_common::routing::{BYTES_BINDING, EMBEDDINGS_BINDING, HASHTAG_BINDING, TASK_BINDING};

/// A queue bound to an exchange with a topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

/// Names of every exchange and queue in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub content_exchange: String,
    pub task_exchange: String,
    pub metadata_queue: String,
    pub bytes_queue: String,
    pub embeddings_queue: String,
    pub task_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Self {
            content_exchange: var("RABBITMQ_EXCHANGE", "content_exchange"),
            task_exchange: var("RMQ_TASKS_EXCHANGE", "tasks_exchange"),
            metadata_queue: var("RABBITMQ_HASHTAG_QUEUE", "hashtag_metadata"),
            bytes_queue: var("RABBITMQ_BYTES_QUEUE", "video_bytes"),
            embeddings_queue: var("RABBITMQ_EMBEDDINGS_QUEUE", "embeddings"),
            task_queue: var("RABBITMQ_TASKS_QUEUE", "producer_tasks"),
        }
    }
}

impl Topology {
    #[must_use]
    pub fn exchanges(&self) -> [&str; 2] {
        [&self.content_exchange, &self.task_exchange]
    }

    #[must_use]
    pub fn queues(&self) -> [&str; 4] {
        [
            &self.metadata_queue,
            &self.bytes_queue,
            &self.embeddings_queue,
            &self.task_queue,
        ]
    }

    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        let bind = |queue: &str, exchange: &str, pattern: &str| Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        vec![
            bind(&self.metadata_queue, &self.content_exchange, HASHTAG_BINDING),
            bind(&self.bytes_queue, &self.content_exchange, BYTES_BINDING),
            bind(&self.embeddings_queue, &self.content_exchange, EMBEDDINGS_BINDING),
            bind(&self.task_queue, &self.task_exchange, TASK_BINDING),
        ]
    }
}
