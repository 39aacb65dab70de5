//! svt - short-video trends pipeline
//!
//! One subcommand per pipeline actor. Each process waits (with bounded retry)
//! for the broker topology to exist and then runs until it is stopped.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use svt_broker::{
    retry_startup, run_consumer, AmqpBroker, BrokerClient, BrokerConfig, BrokerResult,
    StartupRetry, Topology,
};
use svt_consumers::{EmbeddingsConsumer, MetadataConsumer, CONSUMER_PREFETCH};
use svt_embeddings::{EmbeddingModel, VertexConfig, VertexEmbeddingModel};
use svt_enrichment::{EnrichmentWorker, PoolConfig, PoolPolicy, WorkerPool, BYTES_PREFETCH};
use svt_keyframe::FfmpegKeyframes;
use svt_producer::{DiscoveryConfig, HttpDiscoveryClient, Producer, TASK_PREFETCH};
use svt_scene::AdaptiveConfig;
use svt_storage::{PostgresConfig, PostgresStore};
use svt_task_manager::{TaskManager, Timetable};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CRATES: [&str; 11] = [
    "svt",
    "svt_broker",
    "svt_common",
    "svt_storage",
    "svt_scene",
    "svt_keyframe",
    "svt_embeddings",
    "svt_task_manager",
    "svt_producer",
    "svt_enrichment",
    "svt_consumers",
];

#[derive(Parser)]
#[command(
    name = "svt",
    version,
    about = "Hashtag scraping and video enrichment pipeline",
    after_help = "EXAMPLES:\n  \
                  svt declare-topology\n  \
                  svt task-manager\n  \
                  svt producer --discovery-url http://discovery:8000\n  \
                  svt video-processor --pool-size 4 --policy reject\n\n\
                  Settings not given on the command line are read from the\n\
                  environment (a .env file is loaded first)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// RabbitMQ host (overrides RABBITMQ_SERVER)
    #[arg(long, global = true)]
    rabbitmq_server: Option<String>,

    /// PostgreSQL host (overrides POSTGRES_HOST)
    #[arg(long, global = true)]
    postgres_host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Declare exchanges, queues and bindings, then exit
    DeclareTopology,

    /// Dispatch scrape tasks for active hashtags on the timetable
    TaskManager,

    /// Consume scrape tasks and publish video metadata and bytes
    Producer {
        /// Discovery service URL (overrides DISCOVERY_API_URL)
        #[arg(long)]
        discovery_url: Option<String>,
    },

    /// Persist video metadata
    MetadataConsumer,

    /// Extract key frames and publish embeddings
    VideoProcessor {
        /// Worker threads (overrides ENRICHMENT_POOL_SIZE)
        #[arg(long)]
        pool_size: Option<usize>,

        /// Jobs queued or running at once (overrides ENRICHMENT_QUEUE_DEPTH)
        #[arg(long)]
        queue_depth: Option<usize>,

        /// What to do when the pool is full: queue or reject
        #[arg(long)]
        policy: Option<PoolPolicy>,

        /// Adaptive scene-cut threshold
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Persist embedding vectors
    EmbeddingsConsumer,
}

struct Settings {
    broker: BrokerConfig,
    postgres: PostgresConfig,
    topology: Topology,
    retry: StartupRetry,
}

impl Settings {
    fn from_cli(cli: &Cli) -> Self {
        let mut broker = BrokerConfig::default();
        if let Some(host) = &cli.rabbitmq_server {
            broker.host.clone_from(host);
        }
        let mut postgres = PostgresConfig::default();
        if let Some(host) = &cli.postgres_host {
            postgres.host.clone_from(host);
        }
        Self {
            broker,
            postgres,
            topology: Topology::default(),
            retry: StartupRetry::default(),
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default_filter = CRATES
        .iter()
        .map(|name| format!("{name}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect_amqp(config: BrokerConfig, name: &'static str) -> BrokerResult<Arc<dyn BrokerClient>> {
    let broker: Arc<dyn BrokerClient> = Arc::new(AmqpBroker::connect(&config, name).await?);
    Ok(broker)
}

/// Connect and wait for the topology, with the startup retry policy
async fn connect_verified(settings: &Settings, name: &'static str) -> Result<Arc<dyn BrokerClient>> {
    let broker = retry_startup(&settings.retry, "Broker startup", || async move {
        let client = connect_amqp(settings.broker.clone(), name).await?;
        client.verify_topology(&settings.topology).await?;
        Ok(client)
    })
    .await
    .context("Broker topology is not available")?;
    Ok(broker)
}

async fn declare_topology(settings: &Settings) -> Result<()> {
    let broker = retry_startup(&settings.retry, "Broker connection", || {
        connect_amqp(settings.broker.clone(), "svt-declare-topology")
    })
    .await
    .context("Failed to connect to RabbitMQ")?;
    broker
        .declare_topology(&settings.topology)
        .await
        .context("Failed to declare topology")?;
    info!(
        "Declared exchanges {:?} and queues {:?}",
        settings.topology.exchanges(),
        settings.topology.queues()
    );
    Ok(())
}

async fn task_manager(settings: &Settings) -> Result<()> {
    let broker = connect_verified(settings, "svt-task-manager").await?;
    let store = Arc::new(PostgresStore::new(settings.postgres.clone()));
    TaskManager::new(store, broker, settings.topology.task_exchange.clone())
        .run(Timetable::default())
        .await
        .context("Task manager scheduler failed")
}

async fn producer(settings: &Settings, discovery_url: Option<String>) -> Result<()> {
    let mut config = DiscoveryConfig::default();
    if let Some(url) = discovery_url {
        config.base_url = url;
    }
    info!("Using discovery service at {}", config.base_url);
    let discovery = Arc::new(HttpDiscoveryClient::new(config).context("Failed to build HTTP client")?);
    let exchange = settings.topology.content_exchange.clone();

    run_consumer(
        &settings.retry,
        &settings.topology,
        &settings.topology.task_queue,
        TASK_PREFETCH,
        || connect_amqp(settings.broker.clone(), "svt-producer"),
        |broker| Arc::new(Producer::new(discovery.clone(), broker, exchange.clone())),
    )
    .await
    .context("Producer stopped")
}

async fn metadata_consumer(settings: &Settings) -> Result<()> {
    let store = Arc::new(PostgresStore::new(settings.postgres.clone()));
    run_consumer(
        &settings.retry,
        &settings.topology,
        &settings.topology.metadata_queue,
        CONSUMER_PREFETCH,
        || connect_amqp(settings.broker.clone(), "svt-metadata-consumer"),
        |_| Arc::new(MetadataConsumer::new(store.clone())),
    )
    .await
    .context("Metadata consumer stopped")
}

async fn embeddings_consumer(settings: &Settings) -> Result<()> {
    let store = Arc::new(PostgresStore::new(settings.postgres.clone()));
    run_consumer(
        &settings.retry,
        &settings.topology,
        &settings.topology.embeddings_queue,
        CONSUMER_PREFETCH,
        || connect_amqp(settings.broker.clone(), "svt-embeddings-consumer"),
        |_| Arc::new(EmbeddingsConsumer::new(store.clone())),
    )
    .await
    .context("Embeddings consumer stopped")
}

async fn video_processor(
    settings: &Settings,
    pool_config: PoolConfig,
    scene_config: AdaptiveConfig,
) -> Result<()> {
    let pool = Arc::new(WorkerPool::new(&pool_config).context("Failed to build worker pool")?);
    let keyframes = Arc::new(FfmpegKeyframes::new(scene_config));

    // The blocking HTTP client must be created and dropped off the runtime
    let model: Arc<dyn EmbeddingModel> = tokio::task::spawn_blocking(|| {
        VertexEmbeddingModel::new(VertexConfig::default()).map(Arc::new)
    })
    .await
    .context("Embedding client setup panicked")?
    .context("Failed to create embedding client")?;
    info!(
        "Video processor: {} threads, queue depth {}, {:?} policy",
        pool_config.threads, pool_config.queue_depth, pool_config.policy
    );

    let exchange = settings.topology.content_exchange.clone();
    let result = run_consumer(
        &settings.retry,
        &settings.topology,
        &settings.topology.bytes_queue,
        BYTES_PREFETCH,
        || connect_amqp(settings.broker.clone(), "svt-video-processor"),
        |broker| {
            Arc::new(EnrichmentWorker::new(
                keyframes.clone(),
                model.clone(),
                pool.clone(),
                broker,
                exchange.clone(),
            ))
        },
    )
    .await;

    tokio::task::spawn_blocking(move || drop(model)).await.ok();
    result.context("Video processor stopped")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = Settings::from_cli(&cli);

    match cli.command {
        Commands::DeclareTopology => declare_topology(&settings).await,
        Commands::TaskManager => task_manager(&settings).await,
        Commands::Producer { discovery_url } => producer(&settings, discovery_url).await,
        Commands::MetadataConsumer => metadata_consumer(&settings).await,
        Commands::VideoProcessor {
            pool_size,
            queue_depth,
            policy,
            threshold,
        } => {
            let mut pool_config = PoolConfig::default();
            if let Some(threads) = pool_size {
                pool_config.threads = threads;
            }
            if let Some(depth) = queue_depth {
                pool_config.queue_depth = depth;
            }
            if let Some(policy) = policy {
                pool_config.policy = policy;
            }
            let mut scene_config = AdaptiveConfig::default();
            if let Some(threshold) = threshold {
                scene_config.adaptive_threshold = threshold;
            }
            video_processor(&settings, pool_config, scene_config).await
        }
        Commands::EmbeddingsConsumer => embeddings_consumer(&settings).await,
    }
}
