//! End-to-end pipeline scenarios over the in-memory broker and store
//!
//! Run tests with: `cargo test --test pipeline_scenarios`

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use futures::StreamExt;
use short_video_pipeline::broker::{
    BrokerClient, Delivery, DeliveryStream, MemoryBroker, MessageHandler, OutgoingMessage,
};
use short_video_pipeline::common::{
    truncate_to_minute, EmbeddingMessage, ScrapeTask, VideoByteMessage, VideoMetadataMessage,
    WireMessage,
};
use short_video_pipeline::consumers::{EmbeddingsConsumer, MetadataConsumer, CONSUMER_PREFETCH};
use short_video_pipeline::enrichment::{EnrichmentWorker, PoolConfig, PoolPolicy, WorkerPool};
use short_video_pipeline::producer::{Producer, TASK_PREFETCH};
use short_video_pipeline::storage::{FailPoint, MemoryStore, MetadataStep};
use short_video_pipeline::task_manager::TaskManager;
use std::sync::Arc;

fn worker(broker: &MemoryBroker, scenes: usize, model: Arc<RecordingModel>) -> EnrichmentWorker {
    let pool = WorkerPool::new(&PoolConfig {
        threads: 2,
        queue_depth: 4,
        policy: PoolPolicy::Queue,
    })
    .unwrap();
    EnrichmentWorker::new(
        Arc::new(SceneCount(scenes)),
        model,
        Arc::new(pool),
        Arc::new(broker.clone()),
        "content",
    )
}

#[tokio::test]
async fn test_harris_task_yields_at_most_five_metadata_messages() {
    let broker = MemoryBroker::with_topology(&topology());
    let store = Arc::new(MemoryStore::new());
    store.set_hashtags(&[("harris", true)]);

    let scheduled = Utc.with_ymd_and_hms(2024, 10, 3, 8, 1, 44).unwrap();
    let mut manager = TaskManager::new(store.clone(), Arc::new(broker.clone()), "tasks");
    manager.refresh_targets().await;
    manager.dispatch(scheduled).await;

    // Ask for 5 out of a listing of 12
    let mut task = broker.peek("producer_tasks");
    assert_eq!(task.len(), 1);
    let mut scrape = ScrapeTask::decode(&task.remove(0).1).unwrap();
    scrape.requested_count = 5;

    let discovery = Arc::new(StaticDiscovery::new((0..12).map(|n| video(n, "harris")).collect()));
    let producer = Producer::new(discovery, Arc::new(broker.clone()), "content");
    let summary = producer.run_task(&scrape).await.unwrap();
    assert_eq!(summary.published, 5);

    let metadata = broker.peek("hashtag_metadata");
    assert_eq!(metadata.len(), 5);
    for (key, body) in metadata {
        assert_eq!(key, "content.hashtag.harris");
        let message = VideoMetadataMessage::decode(&body).unwrap();
        assert_eq!(message.collected_at, truncate_to_minute(scheduled));
    }
}

#[tokio::test]
async fn test_full_pipeline_stores_contiguous_embeddings() {
    let broker = MemoryBroker::with_topology(&topology());
    let store = Arc::new(MemoryStore::new());
    store.set_hashtags(&[("harris", true)]);
    let model = Arc::new(RecordingModel::default());
    let mut consumers = Vec::new();

    let mut manager = TaskManager::new(store.clone(), Arc::new(broker.clone()), "tasks");
    manager.refresh_targets().await;
    manager.dispatch(Utc::now()).await;

    let discovery = Arc::new(StaticDiscovery::new((0..3).map(|n| video(n, "harris")).collect()));
    let producer = Arc::new(Producer::new(discovery, Arc::new(broker.clone()), "content"));
    consumers.push(spawn_consumer(&broker, "producer_tasks", TASK_PREFETCH, producer));
    broker.drained("producer_tasks").await;

    let metadata = Arc::new(MetadataConsumer::new(store.clone()));
    consumers.push(spawn_consumer(&broker, "hashtag_metadata", CONSUMER_PREFETCH, metadata));
    broker.drained("hashtag_metadata").await;
    assert_eq!(store.post_count(), 3);
    assert_eq!(store.author_count(), 2);
    assert_eq!(store.music_count(), 1);

    let enrichment = Arc::new(worker(&broker, 3, model.clone()));
    consumers.push(spawn_consumer(&broker, "video_bytes", 10, enrichment));
    broker.drained("video_bytes").await;

    let embeddings = Arc::new(EmbeddingsConsumer::new(store.clone()));
    consumers.push(spawn_consumer(&broker, "embeddings", CONSUMER_PREFETCH, embeddings));
    broker.drained("embeddings").await;

    shutdown(&broker, consumers).await;

    for n in 0..3 {
        let post_id = format!("{}", 7_400_000 + n);
        assert_eq!(store.element_ids(&post_id), vec![1, 2, 3, 4]);
    }
    assert_eq!(broker.dead_letter_count("embeddings"), 0);
    // One caption per video, on its first frame
    let captioned = model.texts.lock().unwrap().iter().filter(|t| t.is_some()).count();
    assert_eq!(captioned, 3);
}

#[tokio::test]
async fn test_three_scene_video_yields_four_vectors() {
    let broker = MemoryBroker::with_topology(&topology());
    let model = Arc::new(RecordingModel::default());
    let worker = worker(&broker, 3, model.clone());

    let payload = VideoByteMessage {
        video: b"\x00\x00\x00\x18ftypmp42".to_vec(),
        caption: "Rally tonight #harris".to_string(),
        audio: None,
    };
    worker.process("7421", payload).await.unwrap();

    let published = broker.peek("embeddings");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "content.embeddings.7421");
    let message = EmbeddingMessage::decode(&published[0].1).unwrap();
    assert_eq!(message.vectors.len(), 4);
    assert_eq!(
        *model.texts.lock().unwrap(),
        vec![Some("Rally tonight #harris".to_string()), None, None]
    );
}

#[tokio::test]
async fn test_video_without_cuts_yields_one_captioned_frame() {
    let broker = MemoryBroker::with_topology(&topology());
    let model = Arc::new(RecordingModel::default());
    let worker = worker(&broker, 0, model.clone());

    let payload = VideoByteMessage {
        video: b"static".to_vec(),
        caption: "still life".to_string(),
        audio: None,
    };
    assert_eq!(worker.process("88", payload).await.unwrap(), 2);
    assert_eq!(*model.texts.lock().unwrap(), vec![Some("still life".to_string())]);
}

#[tokio::test]
async fn test_redelivered_metadata_counts_hashtag_each_time() {
    let store = Arc::new(MemoryStore::new());
    let broker = MemoryBroker::with_topology(&topology());
    let producer_side: Arc<dyn BrokerClient> = Arc::new(broker.clone());

    let message = video(1, "vote")
        .to_metadata(Utc.with_ymd_and_hms(2024, 10, 3, 16, 1, 0).unwrap())
        .unwrap();
    let redeliveries = 3;
    for _ in 0..redeliveries {
        producer_side
            .publish(
                "content",
                "content.hashtag.vote",
                OutgoingMessage::encode(&message).unwrap(),
            )
            .await
            .unwrap();
    }

    let consumer = Arc::new(MetadataConsumer::new(store.clone()));
    let handle = spawn_consumer(&broker, "hashtag_metadata", CONSUMER_PREFETCH, consumer);
    broker.drained("hashtag_metadata").await;
    shutdown(&broker, vec![handle]).await;

    assert_eq!(store.post_count(), 1);
    assert_eq!(store.post_snapshot_count(), 1);
    assert_eq!(store.author_snapshot_count(), 1);
    assert_eq!(store.hashtag_count("challenge-vote"), Some(redeliveries));
}

#[tokio::test]
async fn test_failed_transaction_leaves_no_rows_and_is_redelivered() {
    let store = Arc::new(MemoryStore::new());
    let consumer = MetadataConsumer::new(store.clone());
    let message = video(2, "harris").to_metadata(Utc::now()).unwrap();
    let body = message.encode().unwrap();

    // Fails at the challenge link, after every other statement ran
    store.fail_times(FailPoint::Metadata(MetadataStep::PostChallenge), 1);
    let broker = MemoryBroker::with_topology(&topology());
    let delivered: Arc<dyn BrokerClient> = Arc::new(broker.clone());
    delivered
        .publish(
            "content",
            "content.hashtag.harris",
            OutgoingMessage::json(body),
        )
        .await
        .unwrap();

    let mut stream = delivered.consume("hashtag_metadata", 1).await.unwrap();
    let first = next_delivery(&mut stream).await;
    assert!(!first.redelivered);
    assert!(consumer.handle(&first).await.is_err());
    assert_eq!(store.author_count(), 0);
    assert_eq!(store.music_count(), 0);
    assert_eq!(store.post_count(), 0);
    assert_eq!(store.author_snapshot_count(), 0);
    assert_eq!(store.post_snapshot_count(), 0);
    assert_eq!(store.post_challenge_count(), 0);
    first.nack(true).await.unwrap();

    let second = next_delivery(&mut stream).await;
    assert!(second.redelivered);
    consumer.handle(&second).await.unwrap();
    second.ack().await.unwrap();
    assert_eq!(store.post_count(), 1);
    assert_eq!(store.hashtag_count("challenge-harris"), Some(1));
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    stream.next().await.unwrap().unwrap()
}
