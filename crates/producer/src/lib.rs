//! Producer
//!
//! Consumes scrape tasks one at a time and turns each into per-video
//! messages: a [`VideoMetadataMessage`] on `content.hashtag.<tag>` and, when
//! the media can be fetched, a [`VideoByteMessage`] on `content.bytes.<post_id>`.
//!
//! The task queue is consumed with prefetch 1, and an in-process gate
//! serializes tasks again in case the broker is configured otherwise.
//! Every video ends in an [`ItemOutcome`]; one bad video never aborts the
//! rest of the batch.

pub mod discovery;
pub mod item;

pub use discovery::{DiscoveryClient, DiscoveryConfig, HttpDiscoveryClient, Session};
pub use item::DiscoveryItem;

use async_trait::async_trait;
use std::sync::Arc;
use svt_broker::{BrokerClient, BrokerResult, Delivery, HandlerError, MessageHandler, OutgoingMessage};
use svt_common::{
    DecodeError, RoutingKey, ScrapeTask, TaskKind, VideoByteMessage, VideoMetadataMessage,
    WireMessage,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Prefetch for the task queue
pub const TASK_PREFETCH: u16 = 1;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discovery service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Invalid discovery URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Routing(#[from] DecodeError),
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// What happened to one discovered video
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Metadata and media were both published
    Published,
    /// Metadata was published, the media could not be fetched
    Skipped(String),
    /// Nothing usable was published for this video
    Failed(String),
}

/// Per-task tally of item outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeSummary {
    pub hashtag: String,
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScrapeSummary {
    fn new(hashtag: &str) -> Self {
        Self {
            hashtag: hashtag.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Published => self.published += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.published + self.skipped + self.failed
    }
}

pub struct Producer {
    discovery: Arc<dyn DiscoveryClient>,
    broker: Arc<dyn BrokerClient>,
    content_exchange: String,
    gate: Mutex<()>,
}

impl Producer {
    #[must_use]
    pub fn new(
        discovery: Arc<dyn DiscoveryClient>,
        broker: Arc<dyn BrokerClient>,
        content_exchange: impl Into<String>,
    ) -> Self {
        Self {
            discovery,
            broker,
            content_exchange: content_exchange.into(),
            gate: Mutex::new(()),
        }
    }

    /// Execute one task while holding the gate
    ///
    /// # Errors
    ///
    /// Returns an error when the hashtag cannot be routed or the discovery
    /// session or listing fails; per-video problems are reported in the
    /// summary instead.
    pub async fn run_task(&self, task: &ScrapeTask) -> ScrapeResult<ScrapeSummary> {
        let _guard = self.gate.lock().await;
        self.scrape_hashtag(task).await
    }

    /// Scrape up to `task.requested_count` videos for `task.hashtag`
    ///
    /// The discovery session is closed whether or not the scrape succeeds.
    ///
    /// # Errors
    ///
    /// See [`Producer::run_task`].
    pub async fn scrape_hashtag(&self, task: &ScrapeTask) -> ScrapeResult<ScrapeSummary> {
        let metadata_key = RoutingKey::hashtag(&task.hashtag)?;
        let collected_at = task.collected_at();

        let session = self.discovery.open_session().await?;
        let listing = self
            .discovery
            .hashtag_videos(&session, &task.hashtag, task.requested_count)
            .await;
        let result = match listing {
            Ok(items) => {
                let mut summary = ScrapeSummary::new(&task.hashtag);
                let limit = usize::try_from(task.requested_count).unwrap_or(usize::MAX);
                for item in items.iter().take(limit) {
                    let outcome = self.process_item(item, &metadata_key, collected_at).await;
                    match &outcome {
                        ItemOutcome::Published => debug!("#{}: published {}", task.hashtag, item.id),
                        ItemOutcome::Skipped(reason) => {
                            warn!("#{}: skipped media for {}: {}", task.hashtag, item.id, reason);
                        }
                        ItemOutcome::Failed(reason) => {
                            warn!("#{}: failed item {:?}: {}", task.hashtag, item.id, reason);
                        }
                    }
                    summary.record(&outcome);
                }
                Ok(summary)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.discovery.close_session(&session).await {
            warn!("Failed to close discovery session {}: {}", session.id, e);
        }

        if let Ok(summary) = &result {
            info!(
                "#{}: {} videos, {} published, {} skipped, {} failed",
                summary.hashtag,
                summary.total(),
                summary.published,
                summary.skipped,
                summary.failed
            );
        }
        result
    }

    async fn process_item(
        &self,
        item: &DiscoveryItem,
        metadata_key: &RoutingKey,
        collected_at: chrono::DateTime<chrono::Utc>,
    ) -> ItemOutcome {
        let metadata: VideoMetadataMessage = match item.to_metadata(collected_at) {
            Ok(metadata) => metadata,
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };
        if let Err(e) = self.publish(metadata_key, &metadata).await {
            return ItemOutcome::Failed(format!("metadata publish failed: {e}"));
        }

        let bytes_key = match RoutingKey::bytes(&metadata.post_id) {
            Ok(key) => key,
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };
        let message = match self.fetch_media(item).await {
            Ok(message) => message,
            Err(e) => return ItemOutcome::Skipped(e.to_string()),
        };
        match self.publish(&bytes_key, &message).await {
            Ok(()) => ItemOutcome::Published,
            Err(e) => ItemOutcome::Failed(format!("video publish failed: {e}")),
        }
    }

    async fn fetch_media(&self, item: &DiscoveryItem) -> ScrapeResult<VideoByteMessage> {
        let video_url = item
            .video_url()
            .ok_or_else(|| ScrapeError::InvalidItem("no video URL".to_string()))?;
        let video = self.discovery.download(video_url).await?;
        if video.is_empty() {
            return Err(ScrapeError::InvalidItem("empty video download".to_string()));
        }
        let audio = match item.audio_url() {
            Some(url) => Some(self.discovery.download(url).await?),
            None => None,
        };
        Ok(VideoByteMessage {
            video,
            caption: item.caption().to_string(),
            audio,
        })
    }

    /// Encode and publish persistently; failures are returned for logging only
    async fn publish<M: WireMessage>(&self, key: &RoutingKey, message: &M) -> BrokerResult<()> {
        let outgoing = OutgoingMessage::encode(message)?;
        let key = key.to_string();
        self.broker
            .publish(&self.content_exchange, &key, outgoing)
            .await?;
        debug!("Published {}", key);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Producer {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        match RoutingKey::parse(&delivery.routing_key)? {
            RoutingKey::Task(TaskKind::HashtagSearch) => {}
            _ => {
                return Err(DecodeError::InvalidRoutingKey(delivery.routing_key.clone()).into());
            }
        }
        let task = ScrapeTask::decode(&delivery.body)?;
        RoutingKey::hashtag(&task.hashtag)?;
        info!(
            "Scraping #{} ({} videos, scheduled {})",
            task.hashtag, task.requested_count, task.scheduled_at
        );
        self.run_task(&task).await.map_err(HandlerError::retry)?;
        Ok(())
    }
}
