use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// A roster entry. Persisted as one element of the site's streamers JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Streamer {
    pub id: String,
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub platforms: Platforms,
    #[serde(default)]
    pub status: StreamerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platforms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube: Option<YouTubePlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitch: Option<TwitchPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook: Option<FacebookPlatform>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YouTubePlatform {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Per-channel WebSub secret the hub signs deliveries with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<u64>,
    /// When the hub last confirmed the subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwitchPlatform {
    pub login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_subscription_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacebookPlatform {
    pub page_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStatus {
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub youtube: PlatformStatus,
    #[serde(default)]
    pub twitch: PlatformStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    #[serde(default)]
    pub live: bool,
    /// YouTube video id or Twitch stream id of the current broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl PlatformStatus {
    pub fn offline() -> Self {
        PlatformStatus::default()
    }
}

impl StreamerStatus {
    pub fn set_youtube(&mut self, status: PlatformStatus, now: DateTime<Utc>) {
        self.youtube = status;
        self.touch(now);
    }

    pub fn set_twitch(&mut self, status: PlatformStatus, now: DateTime<Utc>) {
        self.twitch = status;
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.live = self.youtube.live || self.twitch.live;
        self.updated_at = Some(now);
    }
}

impl Streamer {
    pub fn youtube_channel_id(&self) -> Option<&str> {
        self.platforms
            .youtube
            .as_ref()
            .map(|yt| yt.channel_id.as_str())
    }

    pub fn twitch_broadcaster_id(&self) -> Option<&str> {
        self.platforms
            .twitch
            .as_ref()
            .and_then(|tw| tw.broadcaster_id.as_deref())
    }

    /// Copy safe to expose to admin clients: credentials are stripped.
    pub fn without_secrets(&self) -> Streamer {
        let mut copy = self.clone();
        if let Some(yt) = copy.platforms.youtube.as_mut() {
            yt.hub_secret = None;
        }
        copy
    }
}

/// Input for creating a roster entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStreamer {
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub youtube: Option<YouTubeInput>,
    #[serde(default)]
    pub twitch: Option<TwitchInput>,
    #[serde(default)]
    pub facebook: Option<FacebookPlatform>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YouTubeInput {
    pub channel_id: String,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwitchInput {
    pub login: String,
    #[serde(default)]
    pub broadcaster_id: Option<String>,
}

/// Partial update. `Some(None)`-style clearing of a platform is expressed with
/// the `remove_*` flags since JSON `null` and "absent" look the same to serde.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStreamer {
    pub alias: Option<String>,
    pub description: Option<String>,
    pub languages: Option<Vec<String>>,
    pub youtube: Option<YouTubeInput>,
    pub twitch: Option<TwitchInput>,
    pub facebook: Option<FacebookPlatform>,
    #[serde(default)]
    pub remove_youtube: bool,
    #[serde(default)]
    pub remove_twitch: bool,
    #[serde(default)]
    pub remove_facebook: bool,
}

const MAX_ALIAS_CHARS: usize = 64;
const MAX_DESCRIPTION_CHARS: usize = 2000;

pub(crate) fn validate_alias(alias: &str) -> AppResult<()> {
    let alias = alias.trim();
    if alias.is_empty() {
        return Err(AppError::Validation("alias must not be empty".to_string()));
    }
    if alias.chars().count() > MAX_ALIAS_CHARS {
        return Err(AppError::Validation(format!(
            "alias must be at most {} characters",
            MAX_ALIAS_CHARS
        )));
    }
    Ok(())
}

pub(crate) fn validate_description(description: &str) -> AppResult<()> {
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(AppError::Validation(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    Ok(())
}

pub(crate) fn validate_channel_id(channel_id: &str) -> AppResult<()> {
    let channel_id = channel_id.trim();
    if channel_id.is_empty()
        || channel_id.len() > 64
        || !channel_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(format!(
            "invalid YouTube channel id: {}",
            channel_id
        )));
    }
    Ok(())
}

pub(crate) fn validate_twitch_login(login: &str) -> AppResult<()> {
    let login = login.trim();
    if login.is_empty()
        || login.len() > 25
        || !login.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(format!(
            "invalid Twitch login: {}",
            login
        )));
    }
    Ok(())
}

impl CreateStreamer {
    pub fn validate(&self) -> AppResult<()> {
        validate_alias(&self.alias)?;
        validate_description(&self.description)?;
        if let Some(yt) = &self.youtube {
            validate_channel_id(&yt.channel_id)?;
        }
        if let Some(tw) = &self.twitch {
            validate_twitch_login(&tw.login)?;
        }
        Ok(())
    }
}

impl UpdateStreamer {
    pub fn validate(&self) -> AppResult<()> {
        if let Some(alias) = &self.alias {
            validate_alias(alias)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if let Some(yt) = &self.youtube {
            validate_channel_id(&yt.channel_id)?;
        }
        if let Some(tw) = &self.twitch {
            validate_twitch_login(&tw.login)?;
        }
        Ok(())
    }
}

/// Public roster view: no secrets, no subscription bookkeeping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerView {
    pub id: String,
    pub alias: String,
    pub description: String,
    pub languages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube: Option<PublicYouTube>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitch: Option<PublicTwitch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facebook: Option<FacebookPlatform>,
    pub status: StreamerStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicYouTube {
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicTwitch {
    pub login: String,
}

impl From<&Streamer> for StreamerView {
    fn from(s: &Streamer) -> Self {
        StreamerView {
            id: s.id.clone(),
            alias: s.alias.clone(),
            description: s.description.clone(),
            languages: s.languages.clone(),
            youtube: s.platforms.youtube.as_ref().map(|yt| PublicYouTube {
                channel_id: yt.channel_id.clone(),
                handle: yt.handle.clone(),
            }),
            twitch: s.platforms.twitch.as_ref().map(|tw| PublicTwitch {
                login: tw.login.clone(),
            }),
            facebook: s.platforms.facebook.clone(),
            status: s.status.clone(),
        }
    }
}
