//! Bounded pool for blocking enrichment jobs
//!
//! A fixed-size rayon pool runs the jobs; a semaphore caps how many jobs may
//! be queued or running at once. When the cap is reached the pool either
//! waits for a slot ([`PoolPolicy::Queue`]) or refuses the job
//! ([`PoolPolicy::Reject`]).

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Failed to build worker pool: {0}")]
    Build(String),

    #[error("Worker pool is saturated ({0} jobs in flight)")]
    Saturated(usize),

    #[error("Worker job panicked: {0}")]
    Panicked(String),

    #[error("Worker pool shut down")]
    Closed,
}

/// What to do with a job when every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPolicy {
    Queue,
    Reject,
}

impl FromStr for PoolPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown pool policy: {other}")),
        }
    }
}

/// Pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker threads
    pub threads: usize,
    /// Jobs queued or running at once; at least `threads`
    pub queue_depth: usize,
    pub policy: PoolPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: std::env::var("ENRICHMENT_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            queue_depth: std::env::var("ENRICHMENT_QUEUE_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            policy: std::env::var("ENRICHMENT_POOL_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(PoolPolicy::Queue),
        }
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    slots: Arc<Semaphore>,
    depth: usize,
    policy: PoolPolicy,
}

impl WorkerPool {
    /// Build the pool
    ///
    /// # Errors
    ///
    /// Returns an error when `threads` is zero or the threads cannot be
    /// spawned.
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        if config.threads == 0 {
            return Err(PoolError::Build("pool size must be at least 1".to_string()));
        }
        let depth = config.queue_depth.max(config.threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("svt-enrich-{i}"))
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;
        debug!(
            "Enrichment pool: {} threads, depth {}, {:?}",
            config.threads, depth, config.policy
        );
        Ok(Self {
            pool,
            slots: Arc::new(Semaphore::new(depth)),
            depth,
            policy: config.policy,
        })
    }

    /// Jobs currently queued or running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.depth - self.slots.available_permits()
    }

    /// Run a blocking job on the pool and wait for its result
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Saturated`] under [`PoolPolicy::Reject`] when no
    /// slot is free, and [`PoolError::Panicked`] if the job panics.
    pub async fn run<T, F>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.policy {
            PoolPolicy::Queue => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?,
            PoolPolicy::Reject => self
                .slots
                .clone()
                .try_acquire_owned()
                .map_err(|_| PoolError::Saturated(self.depth))?,
        };

        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _permit = permit;
            let result = catch_unwind(AssertUnwindSafe(job)).map_err(|panic| {
                panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string())
            });
            // The caller may have gone away; nothing to do then
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| PoolError::Closed)?
            .map_err(PoolError::Panicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool(threads: usize, queue_depth: usize, policy: PoolPolicy) -> Arc<WorkerPool> {
        Arc::new(
            WorkerPool::new(&PoolConfig {
                threads,
                queue_depth,
                policy,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Queue".parse::<PoolPolicy>(), Ok(PoolPolicy::Queue));
        assert_eq!(" reject ".parse::<PoolPolicy>(), Ok(PoolPolicy::Reject));
        assert!("drop".parse::<PoolPolicy>().is_err());
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        assert!(matches!(
            WorkerPool::new(&PoolConfig {
                threads: 0,
                queue_depth: 4,
                policy: PoolPolicy::Queue
            }),
            Err(PoolError::Build(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_job_and_returns_result() {
        let pool = pool(1, 1, PoolPolicy::Queue);
        assert_eq!(pool.run(|| 6 * 7).await, Ok(42));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let pool = pool(1, 1, PoolPolicy::Queue);
        let result: Result<(), _> = pool.run(|| panic!("bad frame")).await;
        assert_eq!(result, Err(PoolError::Panicked("bad frame".to_string())));
        // The worker thread survives
        assert_eq!(pool.run(|| 1).await, Ok(1));
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_when_full() {
        let pool = pool(1, 1, PoolPolicy::Reject);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(move || {
                    let _ = release_rx.recv();
                })
                .await
            })
        };
        while pool.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(pool.run(|| ()).await, Err(PoolError::Saturated(1)));
        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(pool.run(|| ()).await, Ok(()));
    }

    #[tokio::test]
    async fn test_queue_policy_bounds_concurrency() {
        let pool = pool(2, 2, PoolPolicy::Queue);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
