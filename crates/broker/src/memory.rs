//! In-process broker
//!
//! Implements the same contract as RabbitMQ for the parts the pipeline relies
//! on: topic routing through declared bindings, per-consumer prefetch,
//! ack/nack with requeue (redelivered messages go back to the head of the
//! queue with the redelivered flag set), and rejection without requeue.

use crate::topic::topic_matches;
use crate::{
    Acknowledge, BrokerClient, BrokerError, BrokerResult, Delivery, DeliveryStream,
    OutgoingMessage, Topology,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct Stored {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: usize,
    dead_letters: Vec<Stored>,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, QueueState>,
    published: Vec<(String, String, OutgoingMessage)>,
    publish_failure: Option<String>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker; clones share the same state
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Broker with `topology` already declared
    #[must_use]
    pub fn with_topology(topology: &Topology) -> Self {
        let broker = Self::new();
        broker.declare(topology);
        broker
    }

    fn declare(&self, topology: &Topology) {
        let mut state = self.inner.lock();
        for exchange in topology.exchanges() {
            state.exchanges.insert(exchange.to_string());
        }
        for queue in topology.queues() {
            state.queues.entry(queue.to_string()).or_default();
        }
        for b in topology.bindings() {
            let binding = (b.exchange, b.pattern, b.queue);
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }
    }

    /// End every delivery stream once its queue has nothing left to hand out
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Make every subsequent publish fail with `reason` (`None` restores)
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.inner.lock().publish_failure = reason.map(str::to_string);
    }

    /// Every accepted publish as `(exchange, routing_key, message)`
    #[must_use]
    pub fn published(&self) -> Vec<(String, String, OutgoingMessage)> {
        self.inner.lock().published.clone()
    }

    /// Routing keys published to `exchange`, in order
    #[must_use]
    pub fn published_keys(&self, exchange: &str) -> Vec<String> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(e, _, _)| e == exchange)
            .map(|(_, k, _)| k.clone())
            .collect()
    }

    /// Messages waiting in `queue`
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages rejected without requeue from `queue`
    #[must_use]
    pub fn dead_letter_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.dead_letters.len())
    }

    /// Bodies and routing keys waiting in `queue`, without consuming them
    #[must_use]
    pub fn peek(&self, queue: &str) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.ready
                .iter()
                .map(|m| (m.routing_key.clone(), m.body.clone()))
                .collect()
        })
    }

    /// Wait until `queue` has no ready and no unacknowledged messages
    pub async fn drained(&self, queue: &str) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                let idle = state
                    .queues
                    .get(queue)
                    .map_or(true, |q| q.ready.is_empty() && q.unacked == 0);
                if idle {
                    return;
                }
            }
            notified.await;
        }
    }

    fn settle(&self, queue: &str, message: Stored, outcome: Settle, counter: &AtomicUsize) {
        {
            let mut state = self.inner.lock();
            if let Some(q) = state.queues.get_mut(queue) {
                q.unacked = q.unacked.saturating_sub(1);
                match outcome {
                    Settle::Ack => {}
                    Settle::Requeue => q.ready.push_front(Stored {
                        redelivered: true,
                        ..message
                    }),
                    Settle::Reject => q.dead_letters.push(message),
                }
            }
        }
        counter.fetch_sub(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn try_take(&self, queue: &str, prefetch: usize, in_flight: &AtomicUsize) -> Option<Stored> {
        if in_flight.load(Ordering::SeqCst) >= prefetch {
            return None;
        }
        let mut state = self.inner.lock();
        let q = state.queues.get_mut(queue)?;
        let message = q.ready.pop_front()?;
        q.unacked += 1;
        in_flight.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }

    async fn next_delivery(
        &self,
        queue: &str,
        prefetch: usize,
        in_flight: &Arc<AtomicUsize>,
    ) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take(queue, prefetch, in_flight) {
                let acker = MemoryAcker {
                    broker: self.clone(),
                    queue: queue.to_string(),
                    message: message.clone(),
                    in_flight: Arc::clone(in_flight),
                    settled: AtomicBool::new(false),
                };
                return Some(Delivery::new(
                    message.routing_key,
                    message.body,
                    message.redelivered,
                    Box::new(acker),
                ));
            }
            if self.inner.closed.load(Ordering::SeqCst) && self.ready_count(queue) == 0 {
                return None;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    message: Stored,
    in_flight: Arc<AtomicUsize>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn finish(&self, outcome: Settle) -> BrokerResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Publish("delivery already settled".to_string()));
        }
        self.broker
            .settle(&self.queue, self.message.clone(), outcome, &self.in_flight);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.finish(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.finish(if requeue {
            Settle::Requeue
        } else {
            Settle::Reject
        })
    }
}

#[async_trait::async_trait]
impl BrokerClient for MemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()> {
        {
            let mut state = self.inner.lock();
            if let Some(reason) = &state.publish_failure {
                return Err(BrokerError::Publish(reason.clone()));
            }
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::TopologyMissing(format!("exchange {exchange}")));
            }
            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(e, pattern, _)| e == exchange && topic_matches(pattern, routing_key))
                .map(|(_, _, q)| q.clone())
                .collect();
            if targets.is_empty() {
                debug!("Unroutable message on {} with key {}", exchange, routing_key);
            }
            for queue in targets {
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .ready
                    .push_back(Stored {
                        routing_key: routing_key.to_string(),
                        body: message.payload.clone(),
                        redelivered: false,
                    });
            }
            state
                .published
                .push((exchange.to_string(), routing_key.to_string(), message));
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
        if !self.inner.lock().queues.contains_key(queue) {
            return Err(BrokerError::TopologyMissing(format!("queue {queue}")));
        }
        let broker = self.clone();
        let queue = queue.to_string();
        let prefetch = usize::from(prefetch.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let stream = futures::stream::unfold(
            (broker, queue, in_flight),
            move |(broker, queue, in_flight)| async move {
                let delivery = broker.next_delivery(&queue, prefetch, &in_flight).await?;
                Some((Ok(delivery), (broker, queue, in_flight)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn declare_topology(&self, topology: &Topology) -> BrokerResult<()> {
        self.declare(topology);
        Ok(())
    }

    async fn verify_topology(&self, topology: &Topology) -> BrokerResult<()> {
        let state = self.inner.lock();
        for exchange in topology.exchanges() {
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::TopologyMissing(format!("exchange {exchange}")));
            }
        }
        for queue in topology.queues() {
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::TopologyMissing(format!("queue {queue}")));
            }
        }
        Ok(())
    }
}
