//! Video enrichment worker
//!
//! Turns a raw video payload into an ordered list of embedding vectors:
//!
//! 1. write the payload to a scratch file unique to this job
//! 2. extract one key frame per scene (a single frame at 0 without cuts)
//! 3. embed every frame; the caption goes with the first frame only
//! 4. flatten image vectors plus the one text vector and publish them on
//!    `content.embeddings.<post_id>`
//!
//! Steps 1-3 block and run on the bounded [`WorkerPool`]. The delivery is
//! acknowledged only after the publish succeeds.

pub mod pool;

pub use pool::{PoolConfig, PoolError, PoolPolicy, WorkerPool};

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use svt_broker::{BrokerClient, BrokerError, Delivery, HandlerError, MessageHandler, OutgoingMessage};
use svt_common::{DecodeError, EmbeddingMessage, RoutingKey, VideoByteMessage, WireMessage};
use svt_embeddings::{embed_or_placeholder, EmbeddingError, EmbeddingModel};
use svt_keyframe::{KeyframeError, KeyframeSource};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Prefetch for the bytes queue
pub const BYTES_PREFETCH: u16 = 100;

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("Scratch file error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Keyframes(#[from] KeyframeError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Routing(#[from] DecodeError),
}

pub type EnrichmentResult<T> = Result<T, EnrichmentError>;

/// Result of enriching one video
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    pub message: EmbeddingMessage,
    pub frames: usize,
    /// Frames whose model call failed and carry the placeholder vector
    pub placeholders: usize,
}

/// Blocking enrichment of one video payload
///
/// The scratch file is removed when this returns, on success or failure.
///
/// # Errors
///
/// Returns an error if the scratch file cannot be written, no key frame can
/// be extracted, or the model rejects its credentials. Other model failures
/// do not fail the video.
pub fn enrich(
    keyframes: &dyn KeyframeSource,
    model: &dyn EmbeddingModel,
    video: &[u8],
    caption: &str,
) -> EnrichmentResult<Enriched> {
    let mut scratch = tempfile::Builder::new()
        .prefix("svt-video-")
        .suffix(".mp4")
        .tempfile()?;
    write_payload(&mut scratch, video)?;

    let frames = keyframes.keyframes(scratch.path())?;
    let caption = Some(caption).filter(|c| !c.trim().is_empty());

    let mut vectors = Vec::with_capacity(frames.len() + 1);
    let mut placeholders = 0;
    for (i, frame) in frames.iter().enumerate() {
        let text = if i == 0 { caption } else { None };
        let embedding = embed_or_placeholder(model, &frame.jpeg, text)?;
        if embedding.placeholder {
            placeholders += 1;
        }
        vectors.extend(embedding.into_vectors());
    }

    Ok(Enriched {
        message: EmbeddingMessage { vectors },
        frames: frames.len(),
        placeholders,
    })
}

fn write_payload(scratch: &mut NamedTempFile, video: &[u8]) -> std::io::Result<()> {
    scratch.write_all(video)?;
    scratch.flush()
}

pub struct EnrichmentWorker {
    keyframes: Arc<dyn KeyframeSource>,
    model: Arc<dyn EmbeddingModel>,
    pool: Arc<WorkerPool>,
    broker: Arc<dyn BrokerClient>,
    content_exchange: String,
}

impl EnrichmentWorker {
    #[must_use]
    pub fn new(
        keyframes: Arc<dyn KeyframeSource>,
        model: Arc<dyn EmbeddingModel>,
        pool: Arc<WorkerPool>,
        broker: Arc<dyn BrokerClient>,
        content_exchange: impl Into<String>,
    ) -> Self {
        Self {
            keyframes,
            model,
            pool,
            broker,
            content_exchange: content_exchange.into(),
        }
    }

    /// Enrich one video and publish its vectors
    ///
    /// # Errors
    ///
    /// Returns an error if enrichment fails, the pool refuses the job or the
    /// publish fails; the caller redelivers in every case.
    pub async fn process(&self, post_id: &str, payload: VideoByteMessage) -> EnrichmentResult<usize> {
        let key = RoutingKey::embeddings(post_id)?.to_string();

        let keyframes = self.keyframes.clone();
        let model = self.model.clone();
        let enriched = self
            .pool
            .run(move || {
                enrich(
                    keyframes.as_ref(),
                    model.as_ref(),
                    &payload.video,
                    &payload.caption,
                )
            })
            .await??;

        let count = enriched.message.vectors.len();
        let message = OutgoingMessage::encode(&enriched.message).map_err(BrokerError::from)?;
        self.broker
            .publish(&self.content_exchange, &key, message)
            .await?;
        info!(
            "Post {}: {} key frames, {} vectors ({} placeholders) published",
            post_id, enriched.frames, count, enriched.placeholders
        );
        Ok(count)
    }
}

#[async_trait]
impl MessageHandler for EnrichmentWorker {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let post_id = match RoutingKey::parse(&delivery.routing_key)? {
            RoutingKey::Bytes(post_id) => post_id,
            _ => {
                return Err(DecodeError::InvalidRoutingKey(delivery.routing_key.clone()).into());
            }
        };
        let payload = VideoByteMessage::decode(&delivery.body)?;
        debug!(
            "Post {}: {} video bytes (redelivered: {})",
            post_id,
            payload.video.len(),
            delivery.redelivered
        );
        self.process(&post_id, payload)
            .await
            .map_err(HandlerError::retry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use svt_broker::{MemoryBroker, Topology};
    use svt_common::EMBEDDING_DIM;
    use svt_embeddings::{placeholder_vector, EmbeddingError, EmbeddingResult, MultimodalEmbedding};
    use svt_keyframe::{KeyFrame, KeyframeResult};

    /// Returns `scenes` frames (one at 0 when there are none)
    struct FakeKeyframes {
        scenes: usize,
        fail: bool,
        paths: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    }

    impl FakeKeyframes {
        fn new(scenes: usize) -> Self {
            Self {
                scenes,
                fail: false,
                paths: Mutex::new(Vec::new()),
            }
        }
    }

    impl KeyframeSource for FakeKeyframes {
        fn keyframes(&self, video_path: &Path) -> KeyframeResult<Vec<KeyFrame>> {
            let contents = std::fs::read(video_path).unwrap();
            self.paths
                .lock()
                .unwrap()
                .push((video_path.to_path_buf(), contents));
            if self.fail {
                return Err(KeyframeError::NoFrames(video_path.display().to_string()));
            }
            Ok((0..self.scenes.max(1))
                .map(|i| KeyFrame {
                    index: i,
                    timestamp: i as f64 * 2.5,
                    width: 8,
                    height: 8,
                    jpeg: vec![u8::try_from(i).unwrap()],
                })
                .collect())
        }
    }

    /// Image vector filled with the frame byte, text vector filled with -1
    #[derive(Default)]
    struct FakeModel {
        fail_frames: Vec<u8>,
        texts: Mutex<Vec<Option<String>>>,
    }

    impl EmbeddingModel for FakeModel {
        fn embed(&self, image_jpeg: &[u8], text: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
            self.texts.lock().unwrap().push(text.map(str::to_string));
            if self.fail_frames.contains(&image_jpeg[0]) {
                return Err(EmbeddingError::Api {
                    status: 500,
                    body: "internal".to_string(),
                });
            }
            Ok(MultimodalEmbedding {
                image: vec![f32::from(image_jpeg[0]); EMBEDDING_DIM],
                text: text.map(|_| vec![-1.0; EMBEDDING_DIM]),
                placeholder: false,
            })
        }
    }

    #[test]
    fn test_three_scenes_yield_four_vectors() {
        let model = FakeModel::default();
        let enriched = enrich(&FakeKeyframes::new(3), &model, b"mp4", "#harris rally").unwrap();

        let vectors = &enriched.message.vectors;
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0][0], 0.0);
        assert_eq!(vectors[1][0], -1.0);
        assert_eq!(vectors[2][0], 1.0);
        assert_eq!(vectors[3][0], 2.0);
        assert_eq!(
            *model.texts.lock().unwrap(),
            vec![Some("#harris rally".to_string()), None, None]
        );
    }

    #[test]
    fn test_no_cuts_yields_one_frame_with_caption() {
        let model = FakeModel::default();
        let enriched = enrich(&FakeKeyframes::new(0), &model, b"mp4", "caption").unwrap();
        assert_eq!(enriched.frames, 1);
        assert_eq!(enriched.message.vectors.len(), 2);
        assert_eq!(*model.texts.lock().unwrap(), vec![Some("caption".to_string())]);
    }

    #[test]
    fn test_blank_caption_is_not_embedded() {
        let model = FakeModel::default();
        let enriched = enrich(&FakeKeyframes::new(2), &model, b"mp4", "  ").unwrap();
        assert_eq!(enriched.message.vectors.len(), 2);
        assert!(model.texts.lock().unwrap().iter().all(Option::is_none));
    }

    #[test]
    fn test_model_failure_uses_placeholder() {
        let model = FakeModel {
            fail_frames: vec![1],
            ..FakeModel::default()
        };
        let enriched = enrich(&FakeKeyframes::new(3), &model, b"mp4", "caption").unwrap();
        assert_eq!(enriched.placeholders, 1);
        assert_eq!(enriched.message.vectors.len(), 4);
        assert_eq!(enriched.message.vectors[2], placeholder_vector());
    }

    /// Every call is refused as if the bearer token had expired
    struct ExpiredToken;

    impl EmbeddingModel for ExpiredToken {
        fn embed(&self, _: &[u8], _: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
            Err(EmbeddingError::Unauthorized {
                status: 401,
                body: "Request had invalid authentication credentials".to_string(),
            })
        }
    }

    #[test]
    fn test_rejected_credentials_fail_the_video() {
        let result = enrich(&FakeKeyframes::new(3), &ExpiredToken, b"mp4", "caption");
        assert!(matches!(
            result,
            Err(EnrichmentError::Embedding(EmbeddingError::Unauthorized { .. }))
        ));
    }

    #[test]
    fn test_scratch_file_is_removed_on_both_paths() {
        let source = FakeKeyframes::new(1);
        enrich(&source, &FakeModel::default(), b"payload", "").unwrap();

        let mut failing = FakeKeyframes::new(1);
        failing.fail = true;
        assert!(enrich(&failing, &FakeModel::default(), b"payload", "").is_err());

        for (path, contents) in source
            .paths
            .lock()
            .unwrap()
            .iter()
            .chain(failing.paths.lock().unwrap().iter())
        {
            assert_eq!(contents, b"payload");
            assert!(!path.exists());
            let name = path.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("svt-video-") && name.ends_with(".mp4"));
        }
    }

    fn topology() -> Topology {
        Topology {
            content_exchange: "content".to_string(),
            task_exchange: "tasks".to_string(),
            metadata_queue: "meta".to_string(),
            bytes_queue: "bytes".to_string(),
            embeddings_queue: "emb".to_string(),
            task_queue: "task".to_string(),
        }
    }

    fn worker(source: FakeKeyframes, broker: &MemoryBroker) -> EnrichmentWorker {
        worker_with_model(source, Arc::new(FakeModel::default()), broker)
    }

    fn worker_with_model(
        source: FakeKeyframes,
        model: Arc<dyn EmbeddingModel>,
        broker: &MemoryBroker,
    ) -> EnrichmentWorker {
        let pool = WorkerPool::new(&PoolConfig {
            threads: 1,
            queue_depth: 2,
            policy: PoolPolicy::Queue,
        })
        .unwrap();
        EnrichmentWorker::new(
            Arc::new(source),
            model,
            Arc::new(pool),
            Arc::new(broker.clone()),
            "content",
        )
    }

    #[tokio::test]
    async fn test_process_publishes_embeddings_for_post() {
        let broker = MemoryBroker::with_topology(&topology());
        let worker = worker(FakeKeyframes::new(3), &broker);
        let payload = VideoByteMessage {
            video: b"mp4".to_vec(),
            caption: "#harris".to_string(),
            audio: None,
        };

        assert_eq!(worker.process("7421", payload).await.unwrap(), 4);
        let queued = broker.peek("emb");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, "content.embeddings.7421");
        assert_eq!(EmbeddingMessage::decode(&queued[0].1).unwrap().vectors.len(), 4);
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let broker = MemoryBroker::with_topology(&topology());
        let worker = worker(FakeKeyframes::new(1), &broker);
        broker.fail_publishes(Some("channel closed"));
        let payload = VideoByteMessage {
            video: b"mp4".to_vec(),
            caption: String::new(),
            audio: None,
        };
        assert!(matches!(
            worker.process("7421", payload).await,
            Err(EnrichmentError::Broker(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_publishes_nothing() {
        let broker = MemoryBroker::with_topology(&topology());
        let worker = worker_with_model(FakeKeyframes::new(2), Arc::new(ExpiredToken), &broker);
        let payload = VideoByteMessage {
            video: b"mp4".to_vec(),
            caption: "#harris".to_string(),
            audio: None,
        };

        assert!(matches!(
            worker.process("7421", payload).await,
            Err(EnrichmentError::Embedding(_))
        ));
        assert!(broker.peek("emb").is_empty());
        assert!(broker.published_keys("content").is_empty());
    }
}
