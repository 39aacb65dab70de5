//! `PostgreSQL` implementation of the storage capabilities
//!
//! The schema (authors, music, posts, challenges, their reporting tables and
//! the pgvector `video_embeddings` table) is owned by the migration tooling;
//! this module only reads and writes it.

use crate::{EmbeddingStore, MetadataStore, StorageError, StorageResult};
use chrono::NaiveDateTime;
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use svt_common::VideoMetadataMessage;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Transaction};
use tracing::{debug, error};

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,

    /// Upper bound on concurrently open per-message sessions
    pub max_sessions: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "svt".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            max_sessions: std::env::var("POSTGRES_MAX_SESSIONS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(16),
        }
    }
}

impl PostgresConfig {
    /// Build connection string
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

const SELECT_ACTIVE_HASHTAGS: &str = "SELECT title FROM active_hashtags WHERE active = true";

const INSERT_AUTHOR: &str = r"
    INSERT INTO authors (id, nickname, signature, unique_id, verified)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (id) DO NOTHING
";

const INSERT_AUTHOR_SNAPSHOT: &str = r"
    INSERT INTO authors_reporting (
        id, collected_at, digg_count, follower_count,
        following_count, heart_count, video_count
    )
    VALUES ($1, $2::TIMESTAMP, $3::BIGINT, $4::BIGINT, $5::BIGINT, $6::BIGINT, $7::BIGINT)
    ON CONFLICT (id, collected_at) DO NOTHING
";

const INSERT_MUSIC: &str = r"
    INSERT INTO music (id, author_name, title, duration, original)
    VALUES ($1, $2, $3, $4::INT, $5)
    ON CONFLICT (id) DO NOTHING
";

const INSERT_POST: &str = r"
    INSERT INTO posts (
        id, created_at, description, duet_enabled, duet_from_id,
        is_ad, can_repost, author_id, music_id
    )
    VALUES ($1, $2::BIGINT, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (id) DO NOTHING
";

const INSERT_POST_SNAPSHOT: &str = r"
    INSERT INTO posts_reporting (
        id, collected_at, collect_count, comment_count, digg_count,
        play_count, repost_count, share_count
    )
    VALUES ($1, $2::TIMESTAMP, $3::BIGINT, $4::BIGINT, $5::BIGINT, $6::BIGINT, $7::BIGINT, $8::BIGINT)
    ON CONFLICT (id, collected_at) DO NOTHING
";

/// Not idempotent: a redelivered message counts its challenges again.
const UPSERT_CHALLENGE: &str = r"
    INSERT INTO challenges (id, title, description, hashtag_count)
    VALUES ($1, $2, $3, 1)
    ON CONFLICT (id) DO UPDATE SET hashtag_count = challenges.hashtag_count + 1
";

const LINK_POST_CHALLENGE: &str = r"
    INSERT INTO posts_challenges (post_id, challenge_id)
    VALUES ($1, $2)
    ON CONFLICT (post_id, challenge_id) DO NOTHING
";

const NEXT_ELEMENT_ID: &str = r"
    SELECT (COALESCE(MAX(element_id), 0) + 1)::INT4
    FROM video_embeddings
    WHERE post_id = $1
";

const UPSERT_EMBEDDING: &str = r"
    INSERT INTO video_embeddings (post_id, element_id, embedding)
    VALUES ($1, $2::INT4, $3)
    ON CONFLICT (post_id, element_id) DO UPDATE SET embedding = EXCLUDED.embedding
";

const REFRESH_POST_TRENDS: &str = "REFRESH MATERIALIZED VIEW post_trends";

const REFRESH_AUTHOR_TRENDS: &str = "REFRESH MATERIALIZED VIEW author_trends";

/// Classify a driver error, keeping integrity violations distinct
fn pg_error(e: tokio_postgres::Error) -> StorageError {
    match e.code() {
        Some(code)
            if *code == SqlState::UNIQUE_VIOLATION
                || *code == SqlState::FOREIGN_KEY_VIOLATION
                || *code == SqlState::NOT_NULL_VIOLATION =>
        {
            StorageError::Integrity(e.to_string())
        }
        _ => StorageError::PostgresError(e.to_string()),
    }
}

/// Binary pgvector parameter for one embedding
fn embedding_param(vector: &[f32]) -> Vector {
    Vector::from(vector.to_vec())
}

/// Snapshot key: `collected_at` columns are `TIMESTAMP` (naive, UTC)
fn snapshot_time(message: &VideoMetadataMessage) -> NaiveDateTime {
    message.collected_at.naive_utc()
}

/// Next element id for a post: one past the current maximum, 1 when none exist.
///
/// Racy when two transactions append to the same post concurrently.
async fn next_element_id(tx: &Transaction<'_>, post_id: &str) -> StorageResult<i32> {
    let row = tx
        .query_one(NEXT_ELEMENT_ID, &[&post_id])
        .await
        .map_err(pg_error)?;
    Ok(row.get(0))
}

/// `PostgreSQL` store opening one session per operation
pub struct PostgresStore {
    config: PostgresConfig,
    sessions: Arc<Semaphore>,
}

/// An open connection plus its slot in the session bound
struct Session {
    client: Client,
    _permit: OwnedSemaphorePermit,
}

impl PostgresStore {
    #[must_use]
    pub fn new(config: PostgresConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self { config, sessions }
    }

    async fn session(&self) -> StorageResult<Session> {
        let permit = Arc::clone(&self.sessions)
            .acquire_owned()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let (client, connection) = tokio_postgres::connect(&self.config.connection_string(), NoTls)
            .await
            .map_err(pg_error)?;

        // Spawn connection in background; it ends when the client is dropped
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Session {
            client,
            _permit: permit,
        })
    }
}

#[async_trait::async_trait]
impl MetadataStore for PostgresStore {
    async fn active_hashtags(&self) -> StorageResult<Vec<String>> {
        let session = self.session().await?;
        let rows = session
            .client
            .query(SELECT_ACTIVE_HASHTAGS, &[])
            .await
            .map_err(pg_error)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn persist_video_metadata(&self, message: &VideoMetadataMessage) -> StorageResult<()> {
        let mut session = self.session().await?;
        let tx = session.client.transaction().await.map_err(pg_error)?;

        let author = &message.author;
        let collected_at = snapshot_time(message);
        tx.execute(
            INSERT_AUTHOR,
            &[
                &author.id,
                &author.nickname,
                &author.signature,
                &author.unique_id,
                &author.verified,
            ],
        )
        .await
        .map_err(pg_error)?;

        let author_stats = &author.stats;
        tx.execute(
            INSERT_AUTHOR_SNAPSHOT,
            &[
                &author.id,
                &collected_at,
                &author_stats.digg_count,
                &author_stats.follower_count,
                &author_stats.following_count,
                &author_stats.heart_count,
                &author_stats.video_count,
            ],
        )
        .await
        .map_err(pg_error)?;

        let music = &message.music;
        tx.execute(
            INSERT_MUSIC,
            &[
                &music.id,
                &music.author_name,
                &music.title,
                &music.duration,
                &music.original,
            ],
        )
        .await
        .map_err(pg_error)?;

        tx.execute(
            INSERT_POST,
            &[
                &message.post_id,
                &message.created_at,
                &message.description,
                &message.duet_enabled,
                &message.duet_from_id,
                &message.is_ad,
                &message.can_repost,
                &author.id,
                &music.id,
            ],
        )
        .await
        .map_err(pg_error)?;

        let stats = &message.stats;
        tx.execute(
            INSERT_POST_SNAPSHOT,
            &[
                &message.post_id,
                &collected_at,
                &stats.collect_count,
                &stats.comment_count,
                &stats.digg_count,
                &stats.play_count,
                &stats.repost_count,
                &stats.share_count,
            ],
        )
        .await
        .map_err(pg_error)?;

        for challenge in &message.challenges {
            tx.execute(
                UPSERT_CHALLENGE,
                &[&challenge.id, &challenge.title, &challenge.description],
            )
            .await
            .map_err(pg_error)?;
            tx.execute(LINK_POST_CHALLENGE, &[&message.post_id, &challenge.id])
                .await
                .map_err(pg_error)?;
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit().await.map_err(pg_error)?;
        debug!(
            "Stored metadata for post {} ({} challenges)",
            message.post_id,
            message.challenges.len()
        );
        Ok(())
    }

    async fn refresh_post_trends(&self) -> StorageResult<()> {
        let session = self.session().await?;
        session
            .client
            .batch_execute(REFRESH_POST_TRENDS)
            .await
            .map_err(pg_error)
    }

    async fn refresh_author_trends(&self) -> StorageResult<()> {
        let session = self.session().await?;
        session
            .client
            .batch_execute(REFRESH_AUTHOR_TRENDS)
            .await
            .map_err(pg_error)
    }
}

#[async_trait::async_trait]
impl EmbeddingStore for PostgresStore {
    async fn append_embeddings(
        &self,
        post_id: &str,
        vectors: &[Vec<f32>],
    ) -> StorageResult<Vec<i32>> {
        let mut session = self.session().await?;
        let tx = session.client.transaction().await.map_err(pg_error)?;

        let mut element_ids = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let element_id = next_element_id(&tx, post_id).await?;
            tx.execute(
                UPSERT_EMBEDDING,
                &[&post_id, &element_id, &embedding_param(vector)],
            )
            .await
            .map_err(pg_error)?;
            element_ids.push(element_id);
        }

        tx.commit().await.map_err(pg_error)?;
        Ok(element_ids)
    }
}
