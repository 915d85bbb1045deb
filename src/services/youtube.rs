//! Video metadata lookups used to decide whether a feed entry is a live broadcast.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{LookupMode, YouTubeConfig};
use crate::error::{AppError, AppResult};

const LOOKUP_TIMEOUT_SECS: u64 = 10;
const PLAYER_RESPONSE_MARKER: &str = "ytInitialPlayerResponse = ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoState {
    Live,
    Upcoming,
    /// A past broadcast.
    Ended,
    /// A regular upload.
    NotLive,
    /// Private, deleted or otherwise not viewable.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub video_id: String,
    pub channel_id: Option<String>,
    pub title: Option<String>,
    pub state: VideoState,
    pub started_at: Option<DateTime<Utc>>,
}

impl VideoInfo {
    fn unavailable(video_id: &str) -> Self {
        VideoInfo {
            video_id: video_id.to_string(),
            channel_id: None,
            title: None,
            state: VideoState::Unavailable,
            started_at: None,
        }
    }
}

#[async_trait]
pub trait VideoLookup: Send + Sync {
    async fn video(&self, video_id: &str) -> AppResult<VideoInfo>;

    /// The channel's current live broadcast, if any.
    async fn live_video(&self, channel_id: &str) -> AppResult<Option<VideoInfo>>;
}

/// Build the lookup selected by `youtube.lookup`.
pub fn build_lookup(config: &YouTubeConfig) -> AppResult<Arc<dyn VideoLookup>> {
    match (config.lookup, config.api_key.as_deref().filter(|k| !k.is_empty())) {
        (LookupMode::Api, Some(key)) => Ok(Arc::new(DataApiLookup::new(
            &config.api_base_url,
            key,
        )?)),
        (LookupMode::Api, None) => {
            tracing::warn!("youtube.lookup is \"api\" but no api_key is set; scraping watch pages");
            Ok(Arc::new(WatchPageLookup::new(&config.watch_base_url)?))
        }
        (LookupMode::Scrape, _) => Ok(Arc::new(WatchPageLookup::new(&config.watch_base_url)?)),
    }
}

fn http_client() -> AppResult<Client> {
    Client::builder()
        .timeout(StdDuration::from_secs(LOOKUP_TIMEOUT_SECS))
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================================
// Watch page scraper
// ============================================================================

pub struct WatchPageLookup {
    client: Client,
    base_url: String,
}

impl WatchPageLookup {
    pub fn new(base_url: &str) -> AppResult<Self> {
        Ok(WatchPageLookup {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(&self, url: &str) -> AppResult<String> {
        let response = self
            .client
            .get(url)
            // Without this YouTube may serve a consent interstitial instead of the player.
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cookie", "CONSENT=YES+1")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::YouTube(format!(
                "Watch page {} returned {}",
                url,
                response.status()
            )));
        }

        Ok(response.text().await?)
    }
}

/// Pull the `ytInitialPlayerResponse` object out of a watch page.
pub fn extract_player_response(html: &str) -> Option<Value> {
    let start = html.find(PLAYER_RESPONSE_MARKER)? + PLAYER_RESPONSE_MARKER.len();
    // The object is followed by `;var ...` or `;</script>`; let the parser find its end.
    serde_json::Deserializer::from_str(&html[start..])
        .into_iter::<Value>()
        .next()?
        .ok()
}

pub fn classify_player_response(video_id: &str, player: &Value) -> VideoInfo {
    let details = &player["videoDetails"];
    if details.is_null() {
        return VideoInfo::unavailable(video_id);
    }

    let broadcast = &player["microformat"]["playerMicroformatRenderer"]["liveBroadcastDetails"];
    let flag = |v: &Value| v.as_bool().unwrap_or(false);

    let state = if flag(&details["isLive"]) || flag(&broadcast["isLiveNow"]) {
        VideoState::Live
    } else if flag(&details["isUpcoming"]) {
        VideoState::Upcoming
    } else if flag(&details["isLiveContent"]) || broadcast["endTimestamp"].is_string() {
        VideoState::Ended
    } else {
        VideoState::NotLive
    };

    VideoInfo {
        video_id: details["videoId"]
            .as_str()
            .unwrap_or(video_id)
            .to_string(),
        channel_id: details["channelId"].as_str().map(str::to_string),
        title: details["title"].as_str().map(str::to_string),
        state,
        started_at: parse_time(broadcast["startTimestamp"].as_str()),
    }
}

#[async_trait]
impl VideoLookup for WatchPageLookup {
    async fn video(&self, video_id: &str) -> AppResult<VideoInfo> {
        let url = format!(
            "{}/watch?v={}",
            self.base_url,
            urlencoding::encode(video_id)
        );
        let html = self.fetch_page(&url).await?;

        match extract_player_response(&html) {
            Some(player) => Ok(classify_player_response(video_id, &player)),
            None => Err(AppError::YouTube(format!(
                "No player response on watch page for {}",
                video_id
            ))),
        }
    }

    async fn live_video(&self, channel_id: &str) -> AppResult<Option<VideoInfo>> {
        let url = format!(
            "{}/channel/{}/live",
            self.base_url,
            urlencoding::encode(channel_id)
        );
        let html = self.fetch_page(&url).await?;

        // An offline channel's /live page has no player for a live video.
        let Some(player) = extract_player_response(&html) else {
            return Ok(None);
        };
        let info = classify_player_response("", &player);
        Ok((info.state == VideoState::Live && !info.video_id.is_empty()).then_some(info))
    }
}

// ============================================================================
// Data API
// ============================================================================

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<ApiVideo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVideo {
    id: String,
    snippet: Option<ApiSnippet>,
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSnippet {
    title: Option<String>,
    channel_id: Option<String>,
    /// `live`, `upcoming` or `none`.
    live_broadcast_content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
    actual_start_time: Option<String>,
    actual_end_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: SearchResultId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultId {
    video_id: Option<String>,
}

pub struct DataApiLookup {
    client: Client,
    base_url: String,
    api_key: String,
}

impl DataApiLookup {
    pub fn new(base_url: &str, api_key: &str) -> AppResult<Self> {
        Ok(DataApiLookup {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> AppResult<T> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, endpoint))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::YouTube(format!(
                "Data API {} returned {}: {}",
                endpoint, status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AppError::YouTube(format!("Failed to parse {} response: {}", endpoint, e)))
    }
}

fn classify_api_video(video: ApiVideo) -> VideoInfo {
    let snippet = video.snippet;
    let details = video.live_streaming_details;

    let content = snippet
        .as_ref()
        .and_then(|s| s.live_broadcast_content.as_deref())
        .unwrap_or("none");
    let ended = details
        .as_ref()
        .map_or(false, |d| d.actual_end_time.is_some());

    let state = match content {
        "live" if !ended => VideoState::Live,
        "upcoming" => VideoState::Upcoming,
        _ if details.is_some() => VideoState::Ended,
        _ => VideoState::NotLive,
    };

    VideoInfo {
        video_id: video.id,
        channel_id: snippet.as_ref().and_then(|s| s.channel_id.clone()),
        title: snippet.and_then(|s| s.title),
        state,
        started_at: parse_time(details.as_ref().and_then(|d| d.actual_start_time.as_deref())),
    }
}

#[async_trait]
impl VideoLookup for DataApiLookup {
    async fn video(&self, video_id: &str) -> AppResult<VideoInfo> {
        let response: VideoListResponse = self
            .get(
                "videos",
                &[("part", "snippet,liveStreamingDetails"), ("id", video_id)],
            )
            .await?;

        Ok(response
            .items
            .into_iter()
            .next()
            .map(classify_api_video)
            .unwrap_or_else(|| VideoInfo::unavailable(video_id)))
    }

    async fn live_video(&self, channel_id: &str) -> AppResult<Option<VideoInfo>> {
        let response: SearchListResponse = self
            .get(
                "search",
                &[
                    ("part", "id"),
                    ("channelId", channel_id),
                    ("eventType", "live"),
                    ("type", "video"),
                ],
            )
            .await?;

        let Some(video_id) = response.items.into_iter().find_map(|r| r.id.video_id) else {
            return Ok(None);
        };

        // Search results lag behind; confirm with videos.list.
        let info = self.video(&video_id).await?;
        Ok((info.state == VideoState::Live).then_some(info))
    }
}
