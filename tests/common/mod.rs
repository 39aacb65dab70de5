//! Shared fixtures for pipeline scenario tests
//!
//! In-process stand-ins for the three external collaborators (discovery
//! service, key frame extraction, embedding model) plus a small harness that
//! runs actors against a `MemoryBroker`.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use short_video_pipeline::broker::{consume_deliveries, MemoryBroker, MessageHandler, Topology};
use short_video_pipeline::common::EMBEDDING_DIM;
use short_video_pipeline::embeddings::{EmbeddingModel, EmbeddingResult, MultimodalEmbedding};
use short_video_pipeline::keyframe::{KeyFrame, KeyframeResult, KeyframeSource};
use short_video_pipeline::producer::item::{ItemAuthor, ItemChallenge, ItemMusic, ItemVideo};
use short_video_pipeline::producer::{DiscoveryClient, DiscoveryItem, ScrapeResult, Session};
use tokio::task::JoinHandle;

pub fn topology() -> Topology {
    Topology {
        content_exchange: "content".to_string(),
        task_exchange: "tasks".to_string(),
        metadata_queue: "hashtag_metadata".to_string(),
        bytes_queue: "video_bytes".to_string(),
        embeddings_queue: "embeddings".to_string(),
        task_queue: "producer_tasks".to_string(),
    }
}

pub fn video(n: usize, hashtag: &str) -> DiscoveryItem {
    DiscoveryItem {
        id: format!("{}", 7_400_000 + n),
        desc: Some(format!("clip {n} #{hashtag}")),
        author: ItemAuthor {
            id: format!("author-{}", n % 2),
            ..ItemAuthor::default()
        },
        music: ItemMusic {
            id: "music-1".to_string(),
            original: Some(false),
            ..ItemMusic::default()
        },
        challenges: vec![ItemChallenge {
            id: format!("challenge-{hashtag}"),
            title: hashtag.to_string(),
            desc: None,
        }],
        video: ItemVideo {
            download_addr: Some(format!("https://cdn.example/{n}.mp4")),
            play_addr: None,
        },
        ..DiscoveryItem::default()
    }
}

/// Discovery service returning a fixed listing
pub struct StaticDiscovery {
    pub items: Vec<DiscoveryItem>,
    pub sessions: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(items: Vec<DiscoveryItem>) -> Self {
        Self {
            items,
            sessions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn open_session(&self) -> ScrapeResult<Session> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            id: format!("session-{n}"),
        })
    }

    async fn hashtag_videos(
        &self,
        _session: &Session,
        _hashtag: &str,
        _count: u32,
    ) -> ScrapeResult<Vec<DiscoveryItem>> {
        Ok(self.items.clone())
    }

    async fn download(&self, url: &str) -> ScrapeResult<Vec<u8>> {
        Ok(url.as_bytes().to_vec())
    }

    async fn close_session(&self, _session: &Session) -> ScrapeResult<()> {
        Ok(())
    }
}

/// Key frame source reporting a fixed number of scenes
pub struct SceneCount(pub usize);

impl KeyframeSource for SceneCount {
    fn keyframes(&self, _video_path: &Path) -> KeyframeResult<Vec<KeyFrame>> {
        Ok((0..self.0.max(1))
            .map(|i| KeyFrame {
                index: i,
                timestamp: 0.0,
                width: 4,
                height: 4,
                jpeg: vec![u8::try_from(i % 256).unwrap_or(0)],
            })
            .collect())
    }
}

/// Model that records which calls carried text
#[derive(Default)]
pub struct RecordingModel {
    pub texts: Mutex<Vec<Option<String>>>,
}

impl EmbeddingModel for RecordingModel {
    fn embed(&self, image_jpeg: &[u8], text: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
        self.texts.lock().unwrap().push(text.map(str::to_string));
        Ok(MultimodalEmbedding {
            image: vec![f32::from(image_jpeg[0]); EMBEDDING_DIM],
            text: text.map(|_| vec![-1.0; EMBEDDING_DIM]),
            placeholder: false,
        })
    }
}

/// Start consuming `queue` with `handler` until the broker is closed
pub fn spawn_consumer<H: MessageHandler>(
    broker: &MemoryBroker,
    queue: &str,
    prefetch: u16,
    handler: Arc<H>,
) -> JoinHandle<()> {
    let broker = broker.clone();
    let queue = queue.to_string();
    tokio::spawn(async move {
        consume_deliveries(&broker, &queue, prefetch, handler)
            .await
            .unwrap();
    })
}

/// Close the broker and wait for every consumer to finish
pub async fn shutdown(broker: &MemoryBroker, consumers: Vec<JoinHandle<()>>) {
    broker.close();
    for consumer in consumers {
        consumer.await.unwrap();
    }
}
