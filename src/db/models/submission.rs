use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::streamer::{
    validate_alias, validate_channel_id, validate_description, validate_twitch_login,
    CreateStreamer, FacebookPlatform, TwitchInput, YouTubeInput,
};
use crate::error::{AppError, AppResult};

/// A pending roster entry sent through the public form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitch_login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook_page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmission {
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub languages: Vec<String>,
    pub youtube_channel_id: Option<String>,
    pub youtube_handle: Option<String>,
    pub twitch_login: Option<String>,
    pub facebook_page_id: Option<String>,
    pub contact: Option<String>,
}

impl CreateSubmission {
    pub fn validate(&self) -> AppResult<()> {
        validate_alias(&self.alias)?;
        validate_description(&self.description)?;

        let youtube = non_empty(&self.youtube_channel_id);
        let twitch = non_empty(&self.twitch_login);
        let facebook = non_empty(&self.facebook_page_id);

        if youtube.is_none() && twitch.is_none() && facebook.is_none() {
            return Err(AppError::Validation(
                "at least one platform is required".to_string(),
            ));
        }
        if let Some(channel_id) = youtube {
            validate_channel_id(channel_id)?;
        }
        if let Some(login) = twitch {
            validate_twitch_login(login)?;
        }
        Ok(())
    }

    pub fn into_submission(self) -> Submission {
        Submission {
            id: uuid::Uuid::new_v4().to_string(),
            alias: self.alias.trim().to_string(),
            description: self.description,
            languages: self.languages,
            youtube_channel_id: trimmed(self.youtube_channel_id),
            youtube_handle: trimmed(self.youtube_handle),
            twitch_login: trimmed(self.twitch_login),
            facebook_page_id: trimmed(self.facebook_page_id),
            contact: trimmed(self.contact),
            submitted_at: Utc::now(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Submission {
    /// Roster input an approved submission turns into.
    pub fn to_create_streamer(&self) -> CreateStreamer {
        CreateStreamer {
            alias: self.alias.clone(),
            description: self.description.clone(),
            languages: self.languages.clone(),
            youtube: self.youtube_channel_id.as_ref().map(|id| YouTubeInput {
                channel_id: id.clone(),
                handle: self.youtube_handle.clone(),
            }),
            twitch: self.twitch_login.as_ref().map(|login| TwitchInput {
                login: login.clone(),
                broadcaster_id: None,
            }),
            facebook: self.facebook_page_id.as_ref().map(|page_id| FacebookPlatform {
                page_id: page_id.clone(),
            }),
        }
    }
}
