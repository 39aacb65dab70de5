//! Message kinds exchanged between pipeline actors

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Request to scrape one hashtag, emitted by the task manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub hashtag: String,
    pub requested_count: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl ScrapeTask {
    /// Time bucket stamped on every metadata message produced by this task.
    ///
    /// Truncated to the minute so a redelivered task lands in the same bucket.
    #[must_use]
    pub fn collected_at(&self) -> DateTime<Utc> {
        truncate_to_minute(self.scheduled_at)
    }
}

/// Author statistics at collection time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorStats {
    pub digg_count: Option<i64>,
    pub follower_count: Option<i64>,
    pub following_count: Option<i64>,
    pub heart_count: Option<i64>,
    pub video_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub id: String,
    pub nickname: Option<String>,
    pub signature: Option<String>,
    pub unique_id: Option<String>,
    pub verified: Option<bool>,
    #[serde(default)]
    pub stats: AuthorStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicInfo {
    pub id: String,
    pub title: Option<String>,
    pub author_name: Option<String>,
    /// Duration in seconds
    pub duration: Option<i32>,
    /// `false` means licensed background music
    pub original: Option<bool>,
}

/// A hashtag attached to a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeInfo {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

/// Post statistics at collection time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostStats {
    pub collect_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub digg_count: Option<i64>,
    pub play_count: Option<i64>,
    pub repost_count: Option<i64>,
    pub share_count: Option<i64>,
}

/// Structured metadata for one scraped video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadataMessage {
    pub post_id: String,
    pub description: Option<String>,
    /// Unix seconds
    pub created_at: Option<i64>,
    pub duet_enabled: Option<bool>,
    pub duet_from_id: Option<String>,
    pub is_ad: Option<bool>,
    pub can_repost: Option<bool>,
    pub author: AuthorInfo,
    pub music: MusicInfo,
    #[serde(default)]
    pub challenges: Vec<ChallengeInfo>,
    #[serde(default)]
    pub stats: PostStats,
    pub collected_at: DateTime<Utc>,
}

/// Raw video payload for one post.
///
/// The post id is not part of the envelope; it travels in the routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoByteMessage {
    pub video: Vec<u8>,
    pub caption: String,
    /// Present only when the post uses original (non-licensed) audio
    #[serde(default)]
    pub audio: Option<Vec<u8>>,
}

/// Ordered embedding vectors for one post, in scene order.
///
/// Serialized as a bare JSON array of float arrays; the post id travels in
/// the routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingMessage {
    pub vectors: Vec<Vec<f32>>,
}

/// Drop seconds and sub-second precision
#[must_use]
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(ts)
}
