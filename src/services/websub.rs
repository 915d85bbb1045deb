//! YouTube WebSub (PubSubHubbub) subscriber side: subscription requests to
//! the hub and verification of the hub's intent callbacks.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::{StreamerKey, StreamerRepository};
use crate::error::{AppError, AppResult};
use crate::services::auth::generate_random_string;

const TOPIC_BASE: &str = "https://www.youtube.com/xml/feeds/videos.xml";
const VERIFY_TOKEN_LENGTH: usize = 32;
const HUB_SECRET_LENGTH: usize = 32;
const HUB_TIMEOUT_SECS: u64 = 10;

/// Expectations the hub never answered are dropped after this long.
pub const EXPECTATION_MAX_AGE_SECS: i64 = 3600;

lazy_static! {
    static ref CHALLENGE_RE: Regex = Regex::new(r"^[A-Za-z0-9._~-]{1,200}$").unwrap();
}

pub fn validate_challenge(challenge: &str) -> bool {
    CHALLENGE_RE.is_match(challenge)
}

pub fn topic_url(channel_id: &str) -> String {
    format!(
        "{}?channel_id={}",
        TOPIC_BASE,
        urlencoding::encode(channel_id)
    )
}

pub fn channel_from_topic(topic: &str) -> Option<String> {
    let url = url::Url::parse(topic).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "channel_id")
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubMode::Subscribe => "subscribe",
            HubMode::Unsubscribe => "unsubscribe",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "subscribe" => Some(HubMode::Subscribe),
            "unsubscribe" => Some(HubMode::Unsubscribe),
            _ => None,
        }
    }
}

/// What we told the hub, keyed by the verify token we sent with it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionExpectation {
    pub topic: String,
    pub mode: HubMode,
    pub channel_id: String,
    pub lease_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Pending verify tokens. Each token verifies at most once.
#[derive(Default)]
pub struct ExpectationRegistry {
    entries: Mutex<HashMap<String, SubscriptionExpectation>>,
}

impl ExpectationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the expectation under a fresh verify token and return the token.
    pub async fn register(&self, expectation: SubscriptionExpectation) -> String {
        let token = generate_random_string(VERIFY_TOKEN_LENGTH);
        self.entries
            .lock()
            .await
            .insert(token.clone(), expectation);
        token
    }

    pub async fn consume(&self, token: &str) -> Option<SubscriptionExpectation> {
        self.entries.lock().await.remove(token)
    }

    pub async fn pending_for(&self, channel_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .values()
            .any(|e| e.channel_id == channel_id)
    }

    pub async fn remove_for_topic(&self, topic: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.topic != topic);
        before - entries.len()
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(EXPECTATION_MAX_AGE_SECS);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.created_at > cutoff);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Query parameters of a hub verification request (`GET /alerts`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubVerificationParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.topic")]
    pub topic: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: Option<String>,
    #[serde(rename = "hub.reason")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    /// Echo `challenge` back; the expectation has been consumed.
    Confirmed {
        challenge: String,
        expectation: SubscriptionExpectation,
        lease_seconds: Option<u64>,
    },
    /// The hub refused a subscription.
    Denied { topic: String },
}

pub struct WebSubService {
    client: Client,
    hub_url: String,
    callback_url: String,
    lease_seconds: u64,
    pub expectations: ExpectationRegistry,
}

impl WebSubService {
    pub fn new(config: &Config) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(HUB_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(WebSubService {
            client,
            hub_url: config.youtube.hub_url.clone(),
            callback_url: config.websub_callback_url(),
            lease_seconds: config.youtube.lease_seconds,
            expectations: ExpectationRegistry::new(),
        })
    }

    /// Check a verification request against the registered expectations.
    ///
    /// Malformed requests are `BadRequest` (400); unknown tokens and any
    /// topic/mode/lease mismatch are `NotFound` (404).
    pub async fn verify(&self, params: HubVerificationParams) -> AppResult<VerificationOutcome> {
        let mode = params
            .mode
            .ok_or_else(|| AppError::BadRequest("missing hub.mode".to_string()))?;
        let topic = params
            .topic
            .ok_or_else(|| AppError::BadRequest("missing hub.topic".to_string()))?;

        if mode == "denied" {
            tracing::warn!(
                "Hub denied subscription for {}: {}",
                topic,
                params.reason.as_deref().unwrap_or("no reason given")
            );
            let dropped = self.expectations.remove_for_topic(&topic).await;
            tracing::debug!("Dropped {} pending expectation(s) for {}", dropped, topic);
            return Ok(VerificationOutcome::Denied { topic });
        }

        let challenge = params.challenge.unwrap_or_default();
        if !validate_challenge(&challenge) {
            return Err(AppError::BadRequest("invalid hub.challenge".to_string()));
        }

        let verify_token = params
            .verify_token
            .ok_or_else(|| AppError::BadRequest("missing hub.verify_token".to_string()))?;

        let mode = HubMode::parse(&mode)
            .ok_or_else(|| AppError::BadRequest(format!("unsupported hub.mode: {}", mode)))?;

        let lease_seconds = match (mode, params.lease_seconds.as_deref()) {
            (HubMode::Subscribe, None) => {
                return Err(AppError::BadRequest(
                    "missing hub.lease_seconds".to_string(),
                ))
            }
            (_, Some(raw)) => Some(raw.trim().parse::<u64>().map_err(|_| {
                AppError::BadRequest(format!("invalid hub.lease_seconds: {}", raw))
            })?),
            (HubMode::Unsubscribe, None) => None,
        };

        // Hold the lock across check and removal so a token verifies once.
        let mut entries = self.expectations.entries.lock().await;
        let matches = match entries.get(&verify_token) {
            None => {
                return Err(AppError::NotFound("unknown verify token".to_string()));
            }
            Some(expected) => {
                expected.topic == topic
                    && expected.mode == mode
                    && (mode == HubMode::Unsubscribe
                        || expected.lease_seconds.is_none()
                        || expected.lease_seconds == lease_seconds)
            }
        };
        if !matches {
            tracing::warn!(
                "Verification for {} ({}) does not match the pending request",
                topic,
                mode.as_str()
            );
            return Err(AppError::NotFound(
                "verification does not match a pending request".to_string(),
            ));
        }

        let expectation = entries
            .remove(&verify_token)
            .ok_or_else(|| AppError::NotFound("unknown verify token".to_string()))?;

        Ok(VerificationOutcome::Confirmed {
            challenge,
            expectation,
            lease_seconds,
        })
    }

    /// Ask the hub to (re)subscribe the channel. A missing hub secret is
    /// generated and stored before the request goes out.
    pub async fn subscribe(
        &self,
        streamers: &dyn StreamerRepository,
        channel_id: &str,
    ) -> AppResult<()> {
        let key = StreamerKey::YouTubeChannel(channel_id.to_string());
        let streamer = streamers
            .find(&key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No streamer for channel {}", channel_id)))?;

        let existing = streamer
            .platforms
            .youtube
            .as_ref()
            .and_then(|yt| yt.hub_secret.clone());

        let secret = match existing {
            Some(secret) => secret,
            None => {
                let secret = generate_random_string(HUB_SECRET_LENGTH);
                let stored = secret.clone();
                streamers
                    .modify(
                        &key,
                        Box::new(move |s| {
                            if let Some(yt) = s.platforms.youtube.as_mut() {
                                yt.hub_secret = Some(stored);
                            }
                        }),
                    )
                    .await?;
                secret
            }
        };

        self.send(HubMode::Subscribe, channel_id, Some(&secret)).await
    }

    pub async fn unsubscribe(&self, channel_id: &str, secret: Option<&str>) -> AppResult<()> {
        self.send(HubMode::Unsubscribe, channel_id, secret).await
    }

    async fn send(&self, mode: HubMode, channel_id: &str, secret: Option<&str>) -> AppResult<()> {
        let topic = topic_url(channel_id);
        let lease_seconds = match mode {
            HubMode::Subscribe => Some(self.lease_seconds),
            HubMode::Unsubscribe => None,
        };

        let token = self
            .expectations
            .register(SubscriptionExpectation {
                topic: topic.clone(),
                mode,
                channel_id: channel_id.to_string(),
                lease_seconds,
                created_at: Utc::now(),
            })
            .await;

        let lease = lease_seconds.map(|l| l.to_string());
        let mut form: Vec<(&str, &str)> = vec![
            ("hub.callback", self.callback_url.as_str()),
            ("hub.topic", topic.as_str()),
            ("hub.mode", mode.as_str()),
            ("hub.verify", "async"),
            ("hub.verify_token", token.as_str()),
        ];
        if let Some(secret) = secret {
            form.push(("hub.secret", secret));
        }
        if let Some(lease) = lease.as_deref() {
            form.push(("hub.lease_seconds", lease));
        }

        let response = match self.client.post(&self.hub_url).form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                self.expectations.consume(&token).await;
                return Err(e.into());
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            tracing::info!("Requested WebSub {} for channel {}", mode.as_str(), channel_id);
            return Ok(());
        }

        self.expectations.consume(&token).await;
        let body = response.text().await.unwrap_or_default();
        Err(AppError::YouTube(format!(
            "Hub rejected {} for {} ({}): {}",
            mode.as_str(),
            channel_id,
            status,
            body
        )))
    }
}
