//! In-process store
//!
//! Mirrors the relational semantics the consumers depend on:
//! - insert-if-absent rows and `(id, collected_at)` stat snapshots
//! - challenge upserts that increment `hashtag_count` on conflict
//! - embedding rows referencing an existing post (foreign key)
//! - all-or-nothing transactions
//!
//! Failures can be injected at any step to exercise rollback.

use crate::{EmbeddingStore, MetadataStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use svt_common::{AuthorStats, PostStats, VideoMetadataMessage};

/// Statement within the metadata transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataStep {
    Author,
    AuthorSnapshot,
    Music,
    Post,
    PostSnapshot,
    Challenge,
    PostChallenge,
}

/// Where an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ActiveHashtags,
    Metadata(MetadataStep),
    Embeddings,
    RefreshTrends,
    RefreshAuthorTrends,
}

#[derive(Debug, Clone)]
struct ChallengeRow {
    title: String,
    hashtag_count: i64,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    authors: HashSet<String>,
    author_snapshots: HashMap<(String, DateTime<Utc>), AuthorStats>,
    music: HashSet<String>,
    posts: HashSet<String>,
    post_snapshots: HashMap<(String, DateTime<Utc>), PostStats>,
    challenges: HashMap<String, ChallengeRow>,
    post_challenges: HashSet<(String, String)>,
    embeddings: BTreeMap<(String, i32), Vec<f32>>,
}

#[derive(Default)]
struct State {
    tables: Tables,
    active_hashtags: Vec<(String, bool)>,
    failures: HashMap<FailPoint, usize>,
    trend_refreshes: usize,
    author_trend_refreshes: usize,
}

impl State {
    /// Consume one injected failure for `point`, if armed
    fn trip(&mut self, point: FailPoint) -> StorageResult<()> {
        match self.failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StorageError::PostgresError(format!(
                    "injected failure at {point:?}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory store; all operations are serialized
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

/// Not idempotent: a redelivered message counts its challenges again.
fn bump_challenge(tables: &mut Tables, id: &str, title: &str) {
    tables
        .challenges
        .entry(id.to_string())
        .and_modify(|row| row.hashtag_count += 1)
        .or_insert_with(|| ChallengeRow {
            title: title.to_string(),
            hashtag_count: 1,
        });
}

/// One past the current maximum element id, 1 when the post has none
fn next_element_id(tables: &Tables, post_id: &str) -> i32 {
    tables
        .embeddings
        .range((post_id.to_string(), i32::MIN)..=(post_id.to_string(), i32::MAX))
        .map(|((_, id), _)| *id)
        .max()
        .unwrap_or(0)
        + 1
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the hashtag table with `(title, active)` rows
    pub fn set_hashtags(&self, rows: &[(&str, bool)]) {
        self.lock().active_hashtags = rows
            .iter()
            .map(|(title, active)| ((*title).to_string(), *active))
            .collect();
    }

    /// Fail the next `times` operations reaching `point`
    pub fn fail_times(&self, point: FailPoint, times: usize) {
        self.lock().failures.insert(point, times);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    #[must_use]
    pub fn author_count(&self) -> usize {
        self.lock().tables.authors.len()
    }

    #[must_use]
    pub fn music_count(&self) -> usize {
        self.lock().tables.music.len()
    }

    #[must_use]
    pub fn post_count(&self) -> usize {
        self.lock().tables.posts.len()
    }

    /// Author snapshots stored for `(author_id, collected_at)`
    #[must_use]
    pub fn author_snapshot(&self, author_id: &str, at: DateTime<Utc>) -> Option<AuthorStats> {
        self.lock()
            .tables
            .author_snapshots
            .get(&(author_id.to_string(), at))
            .cloned()
    }

    #[must_use]
    pub fn author_snapshot_count(&self) -> usize {
        self.lock().tables.author_snapshots.len()
    }

    /// Post snapshot stored for `(post_id, collected_at)`
    #[must_use]
    pub fn post_snapshot(&self, post_id: &str, at: DateTime<Utc>) -> Option<PostStats> {
        self.lock()
            .tables
            .post_snapshots
            .get(&(post_id.to_string(), at))
            .cloned()
    }

    #[must_use]
    pub fn post_snapshot_count(&self) -> usize {
        self.lock().tables.post_snapshots.len()
    }

    /// Current `hashtag_count` of a challenge
    #[must_use]
    pub fn hashtag_count(&self, challenge_id: &str) -> Option<i64> {
        self.lock()
            .tables
            .challenges
            .get(challenge_id)
            .map(|row| row.hashtag_count)
    }

    #[must_use]
    pub fn challenge_title(&self, challenge_id: &str) -> Option<String> {
        self.lock()
            .tables
            .challenges
            .get(challenge_id)
            .map(|row| row.title.clone())
    }

    #[must_use]
    pub fn post_challenge_count(&self) -> usize {
        self.lock().tables.post_challenges.len()
    }

    /// Stored element ids for a post, ascending
    #[must_use]
    pub fn element_ids(&self, post_id: &str) -> Vec<i32> {
        self.lock()
            .tables
            .embeddings
            .keys()
            .filter(|(post, _)| post == post_id)
            .map(|(_, id)| *id)
            .collect()
    }

    #[must_use]
    pub fn embedding(&self, post_id: &str, element_id: i32) -> Option<Vec<f32>> {
        self.lock()
            .tables
            .embeddings
            .get(&(post_id.to_string(), element_id))
            .cloned()
    }

    #[must_use]
    pub fn trend_refreshes(&self) -> usize {
        self.lock().trend_refreshes
    }

    #[must_use]
    pub fn author_trend_refreshes(&self) -> usize {
        self.lock().author_trend_refreshes
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryStore {
    async fn active_hashtags(&self) -> StorageResult<Vec<String>> {
        let mut state = self.lock();
        state.trip(FailPoint::ActiveHashtags)?;
        Ok(state
            .active_hashtags
            .iter()
            .filter(|(_, active)| *active)
            .map(|(title, _)| title.clone())
            .collect())
    }

    async fn persist_video_metadata(&self, message: &VideoMetadataMessage) -> StorageResult<()> {
        let mut state = self.lock();
        // Work on a copy; it replaces the tables only if every step succeeds
        let mut tx = state.tables.clone();
        let author = &message.author;
        let at = message.collected_at;

        state.trip(FailPoint::Metadata(MetadataStep::Author))?;
        tx.authors.insert(author.id.clone());

        state.trip(FailPoint::Metadata(MetadataStep::AuthorSnapshot))?;
        tx.author_snapshots
            .entry((author.id.clone(), at))
            .or_insert_with(|| author.stats.clone());

        state.trip(FailPoint::Metadata(MetadataStep::Music))?;
        tx.music.insert(message.music.id.clone());

        state.trip(FailPoint::Metadata(MetadataStep::Post))?;
        tx.posts.insert(message.post_id.clone());

        state.trip(FailPoint::Metadata(MetadataStep::PostSnapshot))?;
        tx.post_snapshots
            .entry((message.post_id.clone(), at))
            .or_insert_with(|| message.stats.clone());

        for challenge in &message.challenges {
            state.trip(FailPoint::Metadata(MetadataStep::Challenge))?;
            bump_challenge(&mut tx, &challenge.id, &challenge.title);

            state.trip(FailPoint::Metadata(MetadataStep::PostChallenge))?;
            tx.post_challenges
                .insert((message.post_id.clone(), challenge.id.clone()));
        }

        state.tables = tx;
        Ok(())
    }

    async fn refresh_post_trends(&self) -> StorageResult<()> {
        let mut state = self.lock();
        state.trip(FailPoint::RefreshTrends)?;
        state.trend_refreshes += 1;
        Ok(())
    }

    async fn refresh_author_trends(&self) -> StorageResult<()> {
        let mut state = self.lock();
        state.trip(FailPoint::RefreshAuthorTrends)?;
        state.author_trend_refreshes += 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EmbeddingStore for MemoryStore {
    async fn append_embeddings(
        &self,
        post_id: &str,
        vectors: &[Vec<f32>],
    ) -> StorageResult<Vec<i32>> {
        let mut state = self.lock();
        state.trip(FailPoint::Embeddings)?;
        if !state.tables.posts.contains(post_id) {
            return Err(StorageError::Integrity(format!(
                "video_embeddings.post_id {post_id} references no post"
            )));
        }

        let mut tx = state.tables.clone();
        let mut element_ids = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let element_id = next_element_id(&tx, post_id);
            tx.embeddings
                .insert((post_id.to_string(), element_id), vector.clone());
            element_ids.push(element_id);
        }
        state.tables = tx;
        Ok(element_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use svt_common::{AuthorInfo, ChallengeInfo, MusicInfo};

    fn message(post_id: &str, minute: u32) -> VideoMetadataMessage {
        VideoMetadataMessage {
            post_id: post_id.to_string(),
            description: Some("#harris rally".to_string()),
            created_at: Some(1_727_900_000),
            duet_enabled: Some(true),
            duet_from_id: None,
            is_ad: Some(false),
            can_repost: Some(true),
            author: AuthorInfo {
                id: "a1".to_string(),
                nickname: Some("news".to_string()),
                signature: None,
                unique_id: Some("newsdesk".to_string()),
                verified: Some(true),
                stats: AuthorStats {
                    follower_count: Some(10),
                    ..AuthorStats::default()
                },
            },
            music: MusicInfo {
                id: "m1".to_string(),
                title: Some("original sound".to_string()),
                author_name: Some("newsdesk".to_string()),
                duration: Some(30),
                original: Some(true),
            },
            challenges: vec![
                ChallengeInfo {
                    id: "c1".to_string(),
                    title: "harris".to_string(),
                    description: None,
                },
                ChallengeInfo {
                    id: "c2".to_string(),
                    title: "election".to_string(),
                    description: None,
                },
            ],
            stats: PostStats {
                play_count: Some(1000),
                ..PostStats::default()
            },
            collected_at: Utc.with_ymd_and_hms(2024, 10, 3, 8, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_redelivery_inserts_once_but_counts_twice() {
        let store = MemoryStore::new();
        let msg = message("p1", 1);
        store.persist_video_metadata(&msg).await.unwrap();
        store.persist_video_metadata(&msg).await.unwrap();

        assert_eq!(store.author_count(), 1);
        assert_eq!(store.post_count(), 1);
        assert_eq!(store.music_count(), 1);
        assert_eq!(store.author_snapshot_count(), 1);
        assert_eq!(store.post_snapshot_count(), 1);
        assert_eq!(store.post_challenge_count(), 2);
        assert_eq!(store.hashtag_count("c1"), Some(2));
        assert_eq!(store.challenge_title("c2").as_deref(), Some("election"));
    }

    #[tokio::test]
    async fn test_snapshots_are_keyed_by_collection_time() {
        let store = MemoryStore::new();
        store.persist_video_metadata(&message("p1", 1)).await.unwrap();
        store.persist_video_metadata(&message("p1", 2)).await.unwrap();

        assert_eq!(store.post_count(), 1);
        assert_eq!(store.post_snapshot_count(), 2);
        let at = Utc.with_ymd_and_hms(2024, 10, 3, 8, 2, 0).unwrap();
        assert_eq!(
            store.post_snapshot("p1", at).unwrap().play_count,
            Some(1000)
        );
        assert_eq!(
            store.author_snapshot("a1", at).unwrap().follower_count,
            Some(10)
        );
    }

    #[tokio::test]
    async fn test_failure_mid_transaction_rolls_back() {
        let store = MemoryStore::new();
        store.fail_times(FailPoint::Metadata(MetadataStep::PostChallenge), 1);

        let err = store
            .persist_video_metadata(&message("p1", 1))
            .await
            .unwrap_err();
        assert!(!err.is_integrity());
        assert_eq!(store.author_count(), 0);
        assert_eq!(store.post_count(), 0);
        assert_eq!(store.hashtag_count("c1"), None);

        store.persist_video_metadata(&message("p1", 1)).await.unwrap();
        assert_eq!(store.hashtag_count("c1"), Some(1));
    }

    #[tokio::test]
    async fn test_element_ids_continue_from_max() {
        let store = MemoryStore::new();
        store.persist_video_metadata(&message("p1", 1)).await.unwrap();

        let first = store
            .append_embeddings("p1", &[vec![0.1], vec![0.2]])
            .await
            .unwrap();
        let second = store.append_embeddings("p1", &[vec![0.3]]).await.unwrap();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);
        assert_eq!(store.element_ids("p1"), vec![1, 2, 3]);
        assert_eq!(store.embedding("p1", 3), Some(vec![0.3]));
    }

    #[tokio::test]
    async fn test_embedding_for_unknown_post_is_integrity_error() {
        let store = MemoryStore::new();
        let err = store
            .append_embeddings("missing", &[vec![0.1]])
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert!(store.element_ids("missing").is_empty());
    }

    #[tokio::test]
    async fn test_active_hashtags_filters_inactive() {
        let store = MemoryStore::new();
        store.set_hashtags(&[("harris", true), ("trump", false), ("vote", true)]);
        assert_eq!(
            store.active_hashtags().await.unwrap(),
            vec!["harris".to_string(), "vote".to_string()]
        );

        store.fail_times(FailPoint::ActiveHashtags, 1);
        assert!(store.active_hashtags().await.is_err());
        assert_eq!(store.active_hashtags().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_trend_views_refresh_independently() {
        let store = MemoryStore::new();
        store.fail_times(FailPoint::RefreshAuthorTrends, 1);

        assert!(store.refresh_author_trends().await.is_err());
        store.refresh_post_trends().await.unwrap();
        store.refresh_author_trends().await.unwrap();

        assert_eq!(store.trend_refreshes(), 1);
        assert_eq!(store.author_trend_refreshes(), 1);
    }
}
