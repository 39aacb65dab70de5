//! Consume loop shared by every actor
//!
//! Deliveries are handed to a [`MessageHandler`]; the loop settles each one
//! only after the handler returns:
//! - `Ok` acknowledges
//! - [`HandlerError::Decode`] rejects without requeue (a malformed payload
//!   would fail the same way on every redelivery)
//! - [`HandlerError::Retry`] negatively acknowledges with requeue, so the
//!   broker redelivers (at-least-once)
//!
//! Up to `prefetch` deliveries are processed concurrently, each in its own
//! task.

use crate::{retry_startup, BrokerClient, BrokerResult, Delivery, StartupRetry, Topology};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use svt_common::DecodeError;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Per-message failure classification
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Undecodable message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Processing failed: {0}")]
    Retry(String),
}

impl HandlerError {
    /// Any error that should lead to redelivery
    pub fn retry(err: impl std::fmt::Display) -> Self {
        Self::Retry(err.to_string())
    }
}

/// Processes one message
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

async fn settle(queue: &str, delivery: &Delivery, outcome: Result<(), HandlerError>) {
    let result = match outcome {
        Ok(()) => delivery.ack().await,
        Err(HandlerError::Decode(e)) => {
            error!(
                "Rejecting undecodable message {} from {}: {}",
                delivery.routing_key, queue, e
            );
            delivery.nack(false).await
        }
        Err(HandlerError::Retry(e)) => {
            warn!(
                "Requeueing message {} from {}: {}",
                delivery.routing_key, queue, e
            );
            delivery.nack(true).await
        }
    };
    if let Err(e) = result {
        error!("Failed to settle message {}: {}", delivery.routing_key, e);
    }
}

/// Consume `queue` until the delivery stream ends
///
/// Waits for in-flight handlers before returning.
///
/// # Errors
///
/// Returns an error if the consumer cannot be started.
pub async fn consume_deliveries<H: MessageHandler>(
    client: &dyn BrokerClient,
    queue: &str,
    prefetch: u16,
    handler: Arc<H>,
) -> BrokerResult<()> {
    let mut stream = client.consume(queue, prefetch).await?;
    let permits = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
    let mut in_flight = JoinSet::new();

    while let Some(next) = stream.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Delivery stream for {} failed: {}", queue, e);
                break;
            }
        };

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let handler = Arc::clone(&handler);
        let queue_name = queue.to_string();
        in_flight.spawn(async move {
            let _permit = permit;
            debug!("Handling {} from {}", delivery.routing_key, queue_name);
            let outcome = handler.handle(&delivery).await;
            settle(&queue_name, &delivery, outcome).await;
        });

        // Reap finished handlers so the set does not grow without bound
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                error!("Message handler task failed: {}", e);
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Message handler task failed: {}", e);
        }
    }
    info!("Stopped consuming {}", queue);
    Ok(())
}

/// Run a consumer forever, reconnecting when the delivery stream ends
///
/// `connect` opens a fresh broker connection; `make_handler` builds the handler
/// around it so publishers always use the live connection. Each (re)connection
/// waits the policy's delay first, then goes through the startup retry policy
/// and a topology check.
///
/// # Errors
///
/// Returns an error once a (re)connection exhausts the retry policy.
pub async fn run_consumer<C, Fut, F, H>(
    policy: &StartupRetry,
    topology: &Topology,
    queue: &str,
    prefetch: u16,
    connect: C,
    make_handler: F,
) -> BrokerResult<()>
where
    C: Fn() -> Fut,
    Fut: Future<Output = BrokerResult<Arc<dyn BrokerClient>>>,
    F: Fn(Arc<dyn BrokerClient>) -> Arc<H>,
    H: MessageHandler,
{
    let mut reconnecting = false;
    loop {
        if reconnecting {
            tokio::time::sleep(policy.delay).await;
        }
        reconnecting = true;

        let client = retry_startup(policy, "Broker startup", || {
            let connecting = connect();
            async move {
                let client = connecting.await?;
                client.verify_topology(topology).await?;
                Ok(client)
            }
        })
        .await?;

        let handler = make_handler(Arc::clone(&client));
        if let Err(e) = consume_deliveries(client.as_ref(), queue, prefetch, handler).await {
            warn!("Consumer for {} failed: {}", queue, e);
        }
        warn!(
            "Delivery stream for {} ended, reconnecting in {:?}",
            queue, policy.delay
        );
    }
}
