//! Video discovery service client
//!
//! The discovery service wraps the platform's web API behind a small
//! session-based HTTP interface:
//! - `POST /sessions` opens a browser session and returns `{"session_id": ..}`
//! - `GET /sessions/{id}/hashtag/{tag}/videos?count=N` returns `{"items": [..]}`
//! - `DELETE /sessions/{id}` closes it
//!
//! Media downloads go straight to the CDN with browser-like headers; the CDN
//! refuses requests that do not look like they come from the web player.

use crate::item::DiscoveryItem;
use crate::{ScrapeError, ScrapeResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RANGE, REFERER, USER_AGENT};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const PLATFORM_REFERER: &str = "https://www.tiktok.com/";

/// Discovery service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub base_url: String,
    /// Platform session token forwarded when opening a session
    pub ms_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("DISCOVERY_API_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            ms_token: std::env::var("DISCOVERY_MS_TOKEN").ok(),
            request_timeout_secs: 300,
        }
    }
}

/// An open discovery session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Session {
    #[serde(rename = "session_id")]
    pub id: String,
}

/// Session-based video discovery
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn open_session(&self) -> ScrapeResult<Session>;

    /// Up to `count` videos tagged with `hashtag`
    async fn hashtag_videos(
        &self,
        session: &Session,
        hashtag: &str,
        count: u32,
    ) -> ScrapeResult<Vec<DiscoveryItem>>;

    /// Fetch a media stream
    async fn download(&self, url: &str) -> ScrapeResult<Vec<u8>>;

    async fn close_session(&self, session: &Session) -> ScrapeResult<()>;
}

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ms_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct VideoListing {
    #[serde(default)]
    items: Vec<DiscoveryItem>,
}

/// Headers the CDN expects from the web player
fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(REFERER, HeaderValue::from_static(PLATFORM_REFERER));
    headers.insert(RANGE, HeaderValue::from_static("bytes=0-"));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers
}

async fn check_status(response: reqwest::Response) -> ScrapeResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ScrapeError::Api {
        status: status.as_u16(),
        body,
    })
}

/// HTTP implementation of [`DiscoveryClient`]
pub struct HttpDiscoveryClient {
    config: DiscoveryConfig,
    api: reqwest::Client,
    media: reqwest::Client,
}

impl HttpDiscoveryClient {
    /// Build the API and media clients
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(config: DiscoveryConfig) -> ScrapeResult<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let api = reqwest::Client::builder().timeout(timeout).build()?;
        let media = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(browser_headers())
            .build()?;
        Ok(Self { config, api, media })
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment
    fn url(&self, segments: &[&str]) -> ScrapeResult<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| ScrapeError::InvalidUrl(format!("{}: {e}", self.config.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| ScrapeError::InvalidUrl(self.config.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscoveryClient {
    async fn open_session(&self) -> ScrapeResult<Session> {
        let response = self
            .api
            .post(self.url(&["sessions"])?)
            .json(&OpenSessionRequest {
                ms_token: self.config.ms_token.as_deref(),
            })
            .send()
            .await?;
        let session: Session = check_status(response).await?.json().await?;
        info!("Opened discovery session {}", session.id);
        Ok(session)
    }

    async fn hashtag_videos(
        &self,
        session: &Session,
        hashtag: &str,
        count: u32,
    ) -> ScrapeResult<Vec<DiscoveryItem>> {
        let response = self
            .api
            .get(self.url(&["sessions", session.id.as_str(), "hashtag", hashtag, "videos"])?)
            .query(&[("count", count)])
            .send()
            .await?;
        let listing: VideoListing = check_status(response).await?.json().await?;
        debug!("#{}: discovery returned {} items", hashtag, listing.items.len());
        Ok(listing.items)
    }

    async fn download(&self, url: &str) -> ScrapeResult<Vec<u8>> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ScrapeError::InvalidItem(format!("unsupported URL: {url}")));
        }
        let response = check_status(self.media.get(url).send().await?).await?;
        let bytes = response.bytes().await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    async fn close_session(&self, session: &Session) -> ScrapeResult<()> {
        let response = self
            .api
            .delete(self.url(&["sessions", session.id.as_str()])?)
            .send()
            .await?;
        check_status(response).await?;
        debug!("Closed discovery session {}", session.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_headers() {
        let headers = browser_headers();
        assert_eq!(headers[REFERER], PLATFORM_REFERER);
        assert_eq!(headers[RANGE], "bytes=0-");
        assert!(headers[USER_AGENT].to_str().unwrap().starts_with("Mozilla/5.0"));
    }

    fn client(base_url: &str) -> HttpDiscoveryClient {
        HttpDiscoveryClient::new(DiscoveryConfig {
            base_url: base_url.to_string(),
            ms_token: None,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_url_joins_base() {
        let root = client("http://discovery:8000/");
        assert_eq!(
            root.url(&["sessions"]).unwrap().as_str(),
            "http://discovery:8000/sessions"
        );

        let prefixed = client("http://discovery:8000/api");
        assert_eq!(
            prefixed.url(&["sessions", "s-1"]).unwrap().as_str(),
            "http://discovery:8000/api/sessions/s-1"
        );
    }

    #[test]
    fn test_hashtag_is_one_encoded_segment() {
        let url = client("http://discovery:8000")
            .url(&["sessions", "s-1", "hashtag", "vote/2024?x#y", "videos"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://discovery:8000/sessions/s-1/hashtag/vote%2F2024%3Fx%23y/videos"
        );
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[test]
    fn test_unparseable_base_url() {
        assert!(matches!(
            client("not a url").url(&["sessions"]),
            Err(ScrapeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_listing_tolerates_missing_items() {
        let listing: VideoListing = serde_json::from_str("{}").unwrap();
        assert!(listing.items.is_empty());
        let session: Session = serde_json::from_str(r#"{"session_id":"s-1"}"#).unwrap();
        assert_eq!(session.id, "s-1");
    }

    #[tokio::test]
    async fn test_download_rejects_non_http_urls() {
        assert!(matches!(
            client("http://localhost:8000").download("file:///etc/passwd").await,
            Err(ScrapeError::InvalidItem(_))
        ));
    }
}
