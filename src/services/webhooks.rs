use std::collections::HashMap;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::db::PlatformStatus;
use crate::error::{AppError, AppResult};
use crate::services::sites::SiteRegistry;
use crate::services::twitch::{SUB_TYPE_STREAM_OFFLINE, SUB_TYPE_STREAM_ONLINE};

type HmacSha256 = Hmac<Sha256>;

const TWITCH_MESSAGE_ID_HEADER: &str = "twitch-eventsub-message-id";
const TWITCH_MESSAGE_TIMESTAMP_HEADER: &str = "twitch-eventsub-message-timestamp";
const TWITCH_MESSAGE_SIGNATURE_HEADER: &str = "twitch-eventsub-message-signature";
const TWITCH_MESSAGE_TYPE_HEADER: &str = "twitch-eventsub-message-type";

pub const MESSAGE_TYPE_VERIFICATION: &str = "webhook_callback_verification";
pub const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
pub const MESSAGE_TYPE_REVOCATION: &str = "revocation";

/// Messages older than this are rejected, and ids are remembered this long.
const MESSAGE_MAX_AGE_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct EventSubHeaders {
    pub message_id: String,
    pub timestamp: String,
    pub signature: String,
    pub message_type: String,
}

#[derive(Debug, Deserialize)]
pub struct EventSubSubscription {
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub status: String,
    #[serde(default)]
    pub condition: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct EventSubPayload {
    pub subscription: EventSubSubscription,
    pub challenge: Option<String>,
    pub event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct StreamOnlineEvent {
    /// Stream id.
    pub id: String,
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub started_at: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamOfflineEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
}

/// Message ids seen recently; Twitch redelivers on timeouts.
#[derive(Default)]
pub struct RecentMessages {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RecentMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message_id`; false if it was already seen.
    pub async fn first_delivery(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(message_id) {
            return false;
        }
        seen.insert(message_id.to_string(), now);
        true
    }

    /// Drop `message_id` so a redelivery is processed again.
    pub async fn forget(&self, message_id: &str) {
        self.seen.lock().await.remove(message_id);
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(MESSAGE_MAX_AGE_MINUTES);
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, at| *at > cutoff);
        before - seen.len()
    }
}

pub struct WebhookService;

impl WebhookService {
    /// Extract required headers from request
    pub fn extract_headers(headers: &HeaderMap) -> AppResult<EventSubHeaders> {
        Ok(EventSubHeaders {
            message_id: Self::get_header(headers, TWITCH_MESSAGE_ID_HEADER)?,
            timestamp: Self::get_header(headers, TWITCH_MESSAGE_TIMESTAMP_HEADER)?,
            signature: Self::get_header(headers, TWITCH_MESSAGE_SIGNATURE_HEADER)?,
            message_type: Self::get_header(headers, TWITCH_MESSAGE_TYPE_HEADER)?,
        })
    }

    fn get_header(headers: &HeaderMap, name: &str) -> AppResult<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::BadRequest(format!("Missing header: {}", name)))
    }

    /// Verify the HMAC-SHA256 over `message_id + timestamp + body`, then
    /// reject messages older than ten minutes.
    pub fn verify_signature(
        secret: &str,
        headers: &EventSubHeaders,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;

        mac.update(headers.message_id.as_bytes());
        mac.update(headers.timestamp.as_bytes());
        mac.update(body);

        let expected_sig = headers
            .signature
            .strip_prefix("sha256=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(AppError::Unauthorized)?;

        mac.verify_slice(&expected_sig)
            .map_err(|_| AppError::Unauthorized)?;

        let msg_time = DateTime::parse_from_rfc3339(&headers.timestamp)
            .map_err(|_| AppError::BadRequest("Invalid message timestamp".to_string()))?;
        if now.signed_duration_since(msg_time).num_minutes().abs() > MESSAGE_MAX_AGE_MINUTES {
            return Err(AppError::BadRequest("Message too old".to_string()));
        }

        Ok(())
    }

    pub fn handle_verification(payload: &EventSubPayload) -> AppResult<String> {
        tracing::info!(
            "Confirming EventSub subscription {} ({})",
            payload.subscription.id,
            payload.subscription.subscription_type
        );
        payload
            .challenge
            .clone()
            .ok_or_else(|| AppError::BadRequest("Missing challenge".to_string()))
    }

    pub async fn handle_notification(sites: &SiteRegistry, payload: &EventSubPayload) -> AppResult<()> {
        let event = payload
            .event
            .clone()
            .ok_or_else(|| AppError::BadRequest("Missing event".to_string()))?;

        match payload.subscription.subscription_type.as_str() {
            SUB_TYPE_STREAM_ONLINE => {
                let event: StreamOnlineEvent = serde_json::from_value(event)
                    .map_err(|e| AppError::BadRequest(format!("Invalid stream.online event: {}", e)))?;
                let status = PlatformStatus {
                    live: true,
                    video_id: Some(event.id),
                    title: None,
                    started_at: DateTime::parse_from_rfc3339(&event.started_at)
                        .ok()
                        .map(|t| t.with_timezone(&Utc)),
                };
                tracing::info!("{} went live on Twitch ({})", event.broadcaster_user_login, event.stream_type);
                Self::set_twitch_status(sites, &event.broadcaster_user_id, status).await
            }
            SUB_TYPE_STREAM_OFFLINE => {
                let event: StreamOfflineEvent = serde_json::from_value(event)
                    .map_err(|e| AppError::BadRequest(format!("Invalid stream.offline event: {}", e)))?;
                tracing::info!("{} went offline on Twitch", event.broadcaster_user_login);
                Self::set_twitch_status(sites, &event.broadcaster_user_id, PlatformStatus::offline())
                    .await
            }
            other => {
                tracing::debug!("Ignoring EventSub notification of type {}", other);
                Ok(())
            }
        }
    }

    async fn set_twitch_status(
        sites: &SiteRegistry,
        broadcaster_id: &str,
        status: PlatformStatus,
    ) -> AppResult<()> {
        let Some((site, streamer)) = sites.find_twitch_broadcaster(broadcaster_id).await? else {
            tracing::warn!("EventSub notification for unknown broadcaster {}", broadcaster_id);
            return Ok(());
        };

        if streamer.status.twitch == status {
            return Ok(());
        }

        let now = Utc::now();
        site.streamers
            .modify(
                &crate::db::StreamerKey::Id(streamer.id.clone()),
                Box::new(move |s| s.status.set_twitch(status, now)),
            )
            .await?;
        Ok(())
    }

    /// Forget a subscription Twitch revoked so it is recreated on the next ensure.
    pub async fn handle_revocation(sites: &SiteRegistry, payload: &EventSubPayload) -> AppResult<()> {
        tracing::warn!(
            "Subscription revoked: id={}, type={}, reason={}",
            payload.subscription.id,
            payload.subscription.subscription_type,
            payload.subscription.status
        );

        let Some(broadcaster_id) = payload
            .subscription
            .condition
            .get("broadcaster_user_id")
            .and_then(|v| v.as_str())
        else {
            return Ok(());
        };

        let Some((site, streamer)) = sites.find_twitch_broadcaster(broadcaster_id).await? else {
            return Ok(());
        };

        let revoked = payload.subscription.id.clone();
        site.streamers
            .modify(
                &crate::db::StreamerKey::Id(streamer.id),
                Box::new(move |s| {
                    if let Some(tw) = s.platforms.twitch.as_mut() {
                        if tw.online_subscription_id.as_deref() == Some(revoked.as_str()) {
                            tw.online_subscription_id = None;
                        }
                        if tw.offline_subscription_id.as_deref() == Some(revoked.as_str()) {
                            tw.offline_subscription_id = None;
                        }
                    }
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sign_eventsub(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{CreateStreamer, StreamerKey, TwitchInput};
    use serde_json::json;

    const SECRET: &str = "eventsub-secret";

    fn headers_for(body: &[u8], timestamp: DateTime<Utc>) -> EventSubHeaders {
        let timestamp = timestamp.to_rfc3339();
        EventSubHeaders {
            message_id: "msg-1".to_string(),
            signature: sign_eventsub(SECRET, "msg-1", &timestamp, body),
            timestamp,
            message_type: MESSAGE_TYPE_NOTIFICATION.to_string(),
        }
    }

    #[test]
    fn extracts_required_headers() {
        let mut map = HeaderMap::new();
        map.insert(TWITCH_MESSAGE_ID_HEADER, "id".parse().unwrap());
        map.insert(TWITCH_MESSAGE_TIMESTAMP_HEADER, "ts".parse().unwrap());
        map.insert(TWITCH_MESSAGE_SIGNATURE_HEADER, "sig".parse().unwrap());
        assert!(matches!(
            WebhookService::extract_headers(&map),
            Err(AppError::BadRequest(_))
        ));

        map.insert(TWITCH_MESSAGE_TYPE_HEADER, "notification".parse().unwrap());
        let headers = WebhookService::extract_headers(&map).unwrap();
        assert_eq!(headers.message_type, "notification");
    }

    #[test]
    fn signature_covers_id_timestamp_and_body() {
        let now = Utc::now();
        let body = br#"{"subscription":{}}"#;
        let headers = headers_for(body, now);
        assert!(WebhookService::verify_signature(SECRET, &headers, body, now).is_ok());

        assert!(matches!(
            WebhookService::verify_signature(SECRET, &headers, b"{\"tampered\":1}", now),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            WebhookService::verify_signature("another-secret", &headers, body, now),
            Err(AppError::Unauthorized)
        ));

        let mut unprefixed = headers.clone();
        unprefixed.signature = unprefixed.signature.trim_start_matches("sha256=").to_string();
        assert!(matches!(
            WebhookService::verify_signature(SECRET, &unprefixed, body, now),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn stale_messages_are_rejected() {
        let now = Utc::now();
        let body = b"{}";
        let headers = headers_for(body, now - Duration::minutes(11));
        assert!(matches!(
            WebhookService::verify_signature(SECRET, &headers, body, now),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_detected() {
        let recent = RecentMessages::new();
        let now = Utc::now();
        assert!(recent.first_delivery("a", now).await);
        assert!(!recent.first_delivery("a", now).await);
        assert!(recent.first_delivery("b", now).await);

        recent.forget("b").await;
        assert!(recent.first_delivery("b", now).await);

        assert_eq!(recent.prune(now + Duration::minutes(11)).await, 2);
        assert!(recent.first_delivery("a", now).await);
    }

    #[tokio::test]
    async fn online_offline_and_revocation_update_the_roster() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.app.data_dir = dir.path().to_path_buf();
        let sites = SiteRegistry::from_config(&config);
        let repo = &sites.default_site().unwrap().streamers;

        let created = repo
            .create(CreateStreamer {
                alias: "Singer".to_string(),
                twitch: Some(TwitchInput {
                    login: "singer".to_string(),
                    broadcaster_id: Some("4242".to_string()),
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        repo.modify(
            &StreamerKey::Id(created.id.clone()),
            Box::new(|s| {
                if let Some(tw) = s.platforms.twitch.as_mut() {
                    tw.online_subscription_id = Some("on-1".to_string());
                }
            }),
        )
        .await
        .unwrap();

        let online: EventSubPayload = serde_json::from_value(json!({
            "subscription": {
                "id": "on-1", "type": "stream.online", "status": "enabled",
                "condition": { "broadcaster_user_id": "4242" }
            },
            "event": {
                "id": "stream-9",
                "broadcaster_user_id": "4242",
                "broadcaster_user_login": "singer",
                "broadcaster_user_name": "Singer",
                "type": "live",
                "started_at": "2024-05-01T18:00:00Z"
            }
        }))
        .unwrap();
        WebhookService::handle_notification(&sites, &online).await.unwrap();

        let stored = repo.find(&StreamerKey::Id(created.id.clone())).await.unwrap().unwrap();
        assert!(stored.status.live);
        assert_eq!(stored.status.twitch.video_id.as_deref(), Some("stream-9"));

        let offline: EventSubPayload = serde_json::from_value(json!({
            "subscription": { "id": "off-1", "type": "stream.offline", "status": "enabled" },
            "event": {
                "broadcaster_user_id": "4242",
                "broadcaster_user_login": "singer",
                "broadcaster_user_name": "Singer"
            }
        }))
        .unwrap();
        WebhookService::handle_notification(&sites, &offline).await.unwrap();
        let stored = repo.find(&StreamerKey::Id(created.id.clone())).await.unwrap().unwrap();
        assert!(!stored.status.live);

        let revoked: EventSubPayload = serde_json::from_value(json!({
            "subscription": {
                "id": "on-1", "type": "stream.online", "status": "authorization_revoked",
                "condition": { "broadcaster_user_id": "4242" }
            }
        }))
        .unwrap();
        WebhookService::handle_revocation(&sites, &revoked).await.unwrap();
        let stored = repo.find(&StreamerKey::Id(created.id)).await.unwrap().unwrap();
        assert_eq!(stored.platforms.twitch.unwrap().online_subscription_id, None);
    }
}
