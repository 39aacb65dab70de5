//! Video listing items returned by the discovery service
//!
//! The shape follows the platform's own item JSON: camelCase fields, counters
//! that may arrive either as numbers or as strings, and nested objects that
//! may be missing entirely.

use crate::{ScrapeError, ScrapeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use svt_common::{
    AuthorInfo, AuthorStats, ChallengeInfo, MusicInfo, PostStats, VideoMetadataMessage,
};

/// Integer that may be encoded as a JSON string
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Int(i64),
        Float(f64),
        Text(String),
    }

    #[allow(clippy::cast_possible_truncation)]
    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Int(v)) => Some(v),
        Some(Lenient::Float(v)) => Some(v as i64),
        Some(Lenient::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAuthor {
    #[serde(default)]
    pub id: String,
    pub nickname: Option<String>,
    pub signature: Option<String>,
    pub unique_id: Option<String>,
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAuthorStats {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub digg_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub follower_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub following_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub heart_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub video_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMusic {
    #[serde(default)]
    pub id: String,
    pub title: Option<String>,
    pub author_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub duration: Option<i64>,
    pub original: Option<bool>,
    pub play_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemChallenge {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub desc: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStats {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub collect_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub comment_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub digg_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub play_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub repost_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub share_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemVideo {
    pub download_addr: Option<String>,
    pub play_addr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDuetInfo {
    pub duet_from_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemControl {
    pub can_repost: Option<bool>,
}

/// One video from a hashtag listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryItem {
    #[serde(default)]
    pub id: String,
    pub desc: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub author: ItemAuthor,
    #[serde(default)]
    pub author_stats: ItemAuthorStats,
    #[serde(default)]
    pub music: ItemMusic,
    #[serde(default)]
    pub challenges: Vec<ItemChallenge>,
    #[serde(default, rename = "statsV2")]
    pub stats: ItemStats,
    #[serde(default)]
    pub video: ItemVideo,
    pub duet_enabled: Option<bool>,
    #[serde(default)]
    pub duet_info: ItemDuetInfo,
    pub is_ad: Option<bool>,
    #[serde(default, rename = "item_control")]
    pub item_control: ItemControl,
}

impl DiscoveryItem {
    /// Build the metadata message for this item
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError::InvalidItem`] when the item lacks a post, author
    /// or music id.
    pub fn to_metadata(&self, collected_at: DateTime<Utc>) -> ScrapeResult<VideoMetadataMessage> {
        let missing = |what: &str| ScrapeError::InvalidItem(format!("item {:?} has no {what}", self.id));
        if self.id.is_empty() {
            return Err(missing("id"));
        }
        if self.author.id.is_empty() {
            return Err(missing("author id"));
        }
        if self.music.id.is_empty() {
            return Err(missing("music id"));
        }

        Ok(VideoMetadataMessage {
            post_id: self.id.clone(),
            description: self.desc.clone(),
            created_at: self.create_time,
            duet_enabled: self.duet_enabled,
            duet_from_id: self
                .duet_info
                .duet_from_id
                .clone()
                .filter(|id| !id.is_empty() && id != "0"),
            is_ad: self.is_ad,
            can_repost: self.item_control.can_repost,
            author: AuthorInfo {
                id: self.author.id.clone(),
                nickname: self.author.nickname.clone(),
                signature: self.author.signature.clone(),
                unique_id: self.author.unique_id.clone(),
                verified: self.author.verified,
                stats: AuthorStats {
                    digg_count: self.author_stats.digg_count,
                    follower_count: self.author_stats.follower_count,
                    following_count: self.author_stats.following_count,
                    heart_count: self.author_stats.heart_count,
                    video_count: self.author_stats.video_count,
                },
            },
            music: MusicInfo {
                id: self.music.id.clone(),
                title: self.music.title.clone(),
                author_name: self.music.author_name.clone(),
                duration: self.music.duration.and_then(|d| i32::try_from(d).ok()),
                original: self.music.original,
            },
            challenges: self
                .challenges
                .iter()
                .filter(|c| !c.id.is_empty())
                .map(|c| ChallengeInfo {
                    id: c.id.clone(),
                    title: c.title.clone(),
                    description: c.desc.clone().filter(|d| !d.is_empty()),
                })
                .collect(),
            stats: PostStats {
                collect_count: self.stats.collect_count,
                comment_count: self.stats.comment_count,
                digg_count: self.stats.digg_count,
                play_count: self.stats.play_count,
                repost_count: self.stats.repost_count,
                share_count: self.stats.share_count,
            },
            collected_at,
        })
    }

    /// Where to download the video from
    #[must_use]
    pub fn video_url(&self) -> Option<&str> {
        self.video
            .download_addr
            .as_deref()
            .or(self.video.play_addr.as_deref())
            .filter(|url| !url.is_empty())
    }

    /// Audio source, only for original (non-licensed) sounds
    #[must_use]
    pub fn audio_url(&self) -> Option<&str> {
        if self.music.original != Some(true) {
            return None;
        }
        self.music.play_url.as_deref().filter(|url| !url.is_empty())
    }

    #[must_use]
    pub fn caption(&self) -> &str {
        self.desc.as_deref().unwrap_or_default()
    }
}
