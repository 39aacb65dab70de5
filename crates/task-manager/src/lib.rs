//! Task manager
//!
//! Owns the set of hashtags to monitor, refreshes it from the metadata store
//! and pushes one scrape task per hashtag to the producer on a fixed
//! timetable. It also refreshes the `post_trends` and `author_trends` views
//! after each scrape round.
//!
//! Nothing here halts the schedule: a failed refresh leaves the active set
//! empty until the next refresh, and a failed publish is logged and retried
//! on the next dispatch.

pub mod schedule;

pub use schedule::{build_scheduler, Job, Timetable, Trigger};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use svt_broker::{BrokerClient, OutgoingMessage};
use svt_common::{RoutingKey, ScrapeTask, TaskKind, DEFAULT_REQUESTED_COUNT};
use svt_storage::MetadataStore;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobSchedulerError;
use tracing::{debug, error, info, warn};

/// Outcome of one dispatch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub published: usize,
    pub failed: usize,
}

pub struct TaskManager {
    store: Arc<dyn MetadataStore>,
    broker: Arc<dyn BrokerClient>,
    task_exchange: String,
    requested_count: u32,
    active: Vec<String>,
}

impl TaskManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn BrokerClient>,
        task_exchange: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            task_exchange: task_exchange.into(),
            requested_count: DEFAULT_REQUESTED_COUNT,
            active: Vec::new(),
        }
    }

    /// Hashtags monitored as of the last refresh
    #[must_use]
    pub fn active_hashtags(&self) -> &[String] {
        &self.active
    }

    /// Reload the active hashtags; on failure the set becomes empty
    pub async fn refresh_targets(&mut self) -> usize {
        match self.store.active_hashtags().await {
            Ok(hashtags) => {
                info!("Monitoring {} hashtags", hashtags.len());
                self.active = hashtags;
            }
            Err(e) => {
                error!("Failed to load active hashtags, skipping dispatch: {}", e);
                self.active.clear();
            }
        }
        self.active.len()
    }

    /// Publish one scrape task per active hashtag
    pub async fn dispatch(&self, now: DateTime<Utc>) -> DispatchSummary {
        let routing_key = RoutingKey::Task(TaskKind::HashtagSearch).to_string();
        let mut summary = DispatchSummary::default();

        for hashtag in &self.active {
            let task = ScrapeTask {
                hashtag: hashtag.clone(),
                requested_count: self.requested_count,
                scheduled_at: now,
            };
            let result = match OutgoingMessage::encode(&task) {
                Ok(message) => {
                    self.broker
                        .publish(&self.task_exchange, &routing_key, message)
                        .await
                }
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {
                    debug!("Sent scrape task for #{}", hashtag);
                    summary.published += 1;
                }
                Err(e) => {
                    warn!("Failed to send scrape task for #{}: {}", hashtag, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Dispatched {} scrape tasks ({} failed)",
            summary.published, summary.failed
        );
        summary
    }

    /// Refresh the `post_trends` and `author_trends` views; failures are logged
    /// and do not stop the other view
    pub async fn refresh_trends(&self) {
        match self.store.refresh_post_trends().await {
            Ok(()) => info!("Refreshed post_trends"),
            Err(e) => error!("Failed to refresh post_trends: {}", e),
        }
        match self.store.refresh_author_trends().await {
            Ok(()) => info!("Refreshed author_trends"),
            Err(e) => error!("Failed to refresh author_trends: {}", e),
        }
    }

    /// Run one job
    pub async fn run_job(&mut self, job: Job, now: DateTime<Utc>) {
        match job {
            Job::RefreshTargets => {
                self.refresh_targets().await;
            }
            Job::Dispatch => {
                self.dispatch(now).await;
            }
            Job::RefreshTrends => self.refresh_trends().await,
        }
    }

    /// Refresh and dispatch once, then follow the timetable until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler cannot be built, started or stopped.
    pub async fn run(self, timetable: Timetable) -> Result<(), JobSchedulerError> {
        let manager = Arc::new(Mutex::new(self));
        {
            let mut first = manager.lock().await;
            first.refresh_targets().await;
            first.dispatch(Utc::now()).await;
        }

        let mut scheduler = build_scheduler(&timetable, manager).await?;
        scheduler.start().await?;
        info!("Task manager scheduled: {:?}", timetable);

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for shutdown signal, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down scheduler");
        scheduler.shutdown().await
    }
}
