use chrono::{Duration, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{AppError, AppResult};

pub const SUB_TYPE_STREAM_ONLINE: &str = "stream.online";
pub const SUB_TYPE_STREAM_OFFLINE: &str = "stream.offline";

#[derive(Debug, Clone)]
pub struct TwitchService {
    client: Client,
    enabled: bool,
    client_id: String,
    client_secret: String,
    api_base_url: String,
    auth_base_url: String,
    callback_url: String,
    eventsub_secret: String,
    app_access_token: Arc<RwLock<Option<AppAccessToken>>>,
}

#[derive(Debug, Clone)]
pub struct AppAccessToken {
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AppAccessTokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

// ============================================================================
// User Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TwitchUsersResponse {
    pub data: Vec<TwitchUser>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TwitchUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

// ============================================================================
// Stream Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamsResponse {
    pub data: Vec<Stream>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Stream {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub title: String,
    pub started_at: String,
}

// ============================================================================
// EventSub Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CreateEventSubRequest {
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: serde_json::Value,
    pub transport: EventSubTransport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubTransport {
    pub method: String,
    pub callback: String,
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventSubResponse {
    pub data: Vec<EventSubSubscription>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventSubSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: serde_json::Value,
}

impl TwitchService {
    /// Build the client. No request is made here; the app token is fetched
    /// on first use.
    pub fn new(config: &Config) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(15))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            enabled: config.twitch.enabled,
            client_id: config.twitch.client_id.clone(),
            client_secret: config.twitch.client_secret.clone(),
            api_base_url: config.twitch.api_base_url.trim_end_matches('/').to_string(),
            auth_base_url: config.twitch.auth_base_url.trim_end_matches('/').to_string(),
            callback_url: config.eventsub_callback_url(),
            eventsub_secret: config.twitch.eventsub_secret.clone(),
            app_access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn eventsub_secret(&self) -> &str {
        &self.eventsub_secret
    }

    pub fn ensure_enabled(&self) -> AppResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(AppError::ServiceUnavailable(
                "Twitch integration is disabled".to_string(),
            ))
        }
    }

    /// Fetch a new app access token (client credentials) and cache it.
    pub async fn refresh_app_access_token(&self) -> AppResult<()> {
        let response = self
            .send_with_backoff(|| {
                self.client
                    .post(format!("{}/token", self.auth_base_url))
                    .form(&[
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                        ("grant_type", "client_credentials"),
                    ])
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to get app access token: {}",
                error_text
            )));
        }

        let token_response: AppAccessTokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::TwitchApi(format!("Failed to parse token response: {}", e)))?;

        let expires_at = Utc::now() + Duration::seconds(token_response.expires_in);
        let token = AppAccessToken {
            token: token_response.access_token,
            expires_at,
        };

        let mut guard = self.app_access_token.write().await;
        *guard = Some(token);

        tracing::info!(
            "Refreshed Twitch app access token; expires at {}",
            expires_at
        );

        Ok(())
    }

    /// Get a valid app access token, refreshing it if it expires within a minute.
    pub async fn get_valid_app_access_token(&self) -> AppResult<String> {
        const REFRESH_MARGIN_SECS: i64 = 60;

        {
            let guard = self.app_access_token.read().await;
            if let Some(ref t) = *guard {
                if t.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                    return Ok(t.token.clone());
                }
            }
        }

        self.refresh_app_access_token().await?;

        let guard = self.app_access_token.read().await;
        if let Some(ref t) = *guard {
            Ok(t.token.clone())
        } else {
            Err(AppError::TwitchApi(
                "No app access token available".to_string(),
            ))
        }
    }

    // ========================================================================
    // Users & Streams
    // ========================================================================

    pub async fn get_user_by_login(&self, login: &str) -> AppResult<Option<TwitchUser>> {
        self.ensure_enabled()?;

        let users: TwitchUsersResponse = self
            .helix_call(Method::GET, "users", &format!("user {}", login), |req| {
                req.query(&[("login", login)])
            })
            .await?;

        Ok(users.data.into_iter().next())
    }

    /// Current live stream of a broadcaster, `None` when offline.
    pub async fn get_stream(&self, user_id: &str) -> AppResult<Option<Stream>> {
        self.ensure_enabled()?;

        let streams: StreamsResponse = self
            .helix_call(Method::GET, "streams", "stream lookup", |req| {
                req.query(&[("user_id", user_id)])
            })
            .await?;

        Ok(streams.data.into_iter().find(|s| s.stream_type == "live"))
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// A Helix request carrying the app's Client-Id and `token`.
    fn helix(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.api_base_url, path))
            .bearer_auth(token)
            .header("Client-Id", &self.client_id)
    }

    /// Send a Helix request and decode a successful JSON answer. `what` names
    /// the call in error messages.
    async fn helix_call<T, F>(
        &self,
        method: Method,
        path: &str,
        what: &str,
        build: F,
    ) -> AppResult<T>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let response = self
            .send_app_request_with_token(|token| build(self.helix(method.clone(), path, token)))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Twitch {} failed ({}): {}",
                what, status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            AppError::TwitchApi(format!("Failed to parse Twitch {} response: {}", what, e))
        })
    }

    /// Send a request, sleeping and retrying while Twitch answers 429 or 5xx
    /// or the connection fails. Other statuses are left to the caller.
    async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut backoff = Backoff::default();
        loop {
            let delay = match make_request().send().await {
                Ok(response) if !is_transient(response.status()) => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let Some(delay) = backoff.next_delay(retry_after(&response)) else {
                        let error_text = response.text().await.unwrap_or_default();
                        return Err(AppError::TwitchApi(format!(
                            "Twitch answered {} on all {} attempts: {}",
                            status, backoff.attempts, error_text
                        )));
                    };
                    tracing::warn!(
                        "Twitch answered {}; attempt {} in {:?}",
                        status,
                        backoff.attempts,
                        delay
                    );
                    delay
                }
                Err(e) => {
                    let Some(delay) = backoff.next_delay(None) else {
                        return Err(e.into());
                    };
                    tracing::warn!(
                        "Twitch request failed: {}; attempt {} in {:?}",
                        e,
                        backoff.attempts,
                        delay
                    );
                    delay
                }
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Run a request that needs the app token. A 401 refreshes the token and
    /// the request is tried once more.
    async fn send_app_request_with_token<F>(&self, make_request: F) -> AppResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.get_valid_app_access_token().await?;
        let response = self.send_with_backoff(|| make_request(&token)).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!("Twitch rejected the app token; refreshing it");
        self.refresh_app_access_token().await?;
        let token = self.get_valid_app_access_token().await?;
        let response = self.send_with_backoff(|| make_request(&token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Twitch rejected a fresh app token: {}",
                error_text
            )));
        }
        Ok(response)
    }

    // ========================================================================
    // EventSub
    // ========================================================================

    pub async fn create_eventsub_subscription(
        &self,
        subscription_type: &str,
        version: &str,
        condition: serde_json::Value,
    ) -> AppResult<EventSubSubscription> {
        self.ensure_enabled()?;

        let request = CreateEventSubRequest {
            subscription_type: subscription_type.to_string(),
            version: version.to_string(),
            condition,
            transport: EventSubTransport {
                method: "webhook".to_string(),
                callback: self.callback_url.clone(),
                secret: Some(self.eventsub_secret.clone()),
            },
        };

        let created: EventSubResponse = self
            .helix_call(
                Method::POST,
                "eventsub/subscriptions",
                &format!("{} subscription", subscription_type),
                |req| req.json(&request),
            )
            .await?;

        created
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::TwitchApi("No subscription created".to_string()))
    }

    pub async fn delete_eventsub_subscription(&self, subscription_id: &str) -> AppResult<()> {
        self.ensure_enabled()?;

        let response = self
            .send_app_request_with_token(|token| {
                self.helix(Method::DELETE, "eventsub/subscriptions", token)
                    .query(&[("id", subscription_id)])
            })
            .await?;

        // Already gone is as good as deleted.
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(AppError::TwitchApi(format!(
            "Failed to delete EventSub subscription {} ({}): {}",
            subscription_id, status, error_text
        )))
    }

    /// Subscriptions of the app filtered to one broadcaster.
    pub async fn list_eventsub_subscriptions(
        &self,
        broadcaster_id: &str,
    ) -> AppResult<Vec<EventSubSubscription>> {
        self.ensure_enabled()?;

        let listing: EventSubResponse = self
            .helix_call(Method::GET, "eventsub/subscriptions", "subscription listing", |req| {
                req.query(&[("user_id", broadcaster_id)])
            })
            .await?;

        Ok(listing.data)
    }

    pub async fn subscribe_stream_online(
        &self,
        broadcaster_id: &str,
    ) -> AppResult<EventSubSubscription> {
        self.create_eventsub_subscription(
            SUB_TYPE_STREAM_ONLINE,
            "1",
            serde_json::json!({
                "broadcaster_user_id": broadcaster_id
            }),
        )
        .await
    }

    pub async fn subscribe_stream_offline(
        &self,
        broadcaster_id: &str,
    ) -> AppResult<EventSubSubscription> {
        self.create_eventsub_subscription(
            SUB_TYPE_STREAM_OFFLINE,
            "1",
            serde_json::json!({
                "broadcaster_user_id": broadcaster_id
            }),
        )
        .await
    }
}

/// Attempts made per request, the first one included.
const MAX_ATTEMPTS: u32 = 5;
const FIRST_RETRY_DELAY: StdDuration = StdDuration::from_secs(1);
const MAX_RETRY_DELAY: StdDuration = StdDuration::from_secs(60);

/// Doubling retry schedule for one request.
#[derive(Debug)]
struct Backoff {
    attempts: u32,
    next: StdDuration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            attempts: 1,
            next: FIRST_RETRY_DELAY,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, `None` once all attempts are used.
    /// A server-supplied `hint` replaces the schedule for this step.
    fn next_delay(&mut self, hint: Option<StdDuration>) -> Option<StdDuration> {
        if self.attempts >= MAX_ATTEMPTS {
            return None;
        }
        self.attempts += 1;
        let delay = hint.unwrap_or(self.next).min(MAX_RETRY_DELAY);
        self.next = (self.next * 2).min(MAX_RETRY_DELAY);
        Some(delay)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `Retry-After` in seconds; HTTP dates are ignored.
fn retry_after(response: &Response) -> Option<StdDuration> {
    let value = response.headers().get(reqwest::header::RETRY_AFTER)?;
    let seconds = value.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(StdDuration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> TwitchService {
        let mut config = Config::default();
        config.server.public_url = "https://roster.example".to_string();
        config.twitch.enabled = true;
        config.twitch.client_id = "cid".to_string();
        config.twitch.client_secret = "csecret".to_string();
        config.twitch.eventsub_secret = "eventsub-secret".to_string();
        config.twitch.api_base_url = format!("{}/helix", server.uri());
        config.twitch.auth_base_url = format!("{}/oauth2", server.uri());
        TwitchService::new(&config).unwrap()
    }

    async fn mount_token(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": 3600,
                "token_type": "bearer"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn looks_up_user_with_app_token() {
        let server = MockServer::start().await;
        mount_token(&server, "app-token").await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(query_param("login", "singer"))
            .and(header("Authorization", "Bearer app-token"))
            .and(header("Client-Id", "cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "4242", "login": "singer", "display_name": "Singer" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let twitch = service(&server);
        let user = twitch.get_user_by_login("singer").await.unwrap().unwrap();
        assert_eq!(user.id, "4242");
    }

    #[tokio::test]
    async fn creates_subscription_with_configured_callback() {
        let server = MockServer::start().await;
        mount_token(&server, "app-token").await;
        Mock::given(method("POST"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(body_partial_json(json!({
                "type": "stream.online",
                "condition": { "broadcaster_user_id": "4242" },
                "transport": {
                    "method": "webhook",
                    "callback": "https://roster.example/admin/eventsub",
                    "secret": "eventsub-secret"
                }
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "data": [{
                    "id": "sub-1",
                    "status": "webhook_callback_verification_pending",
                    "type": "stream.online",
                    "version": "1",
                    "condition": { "broadcaster_user_id": "4242" }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let twitch = service(&server);
        let sub = twitch.subscribe_stream_online("4242").await.unwrap();
        assert_eq!(sub.id, "sub-1");
    }

    #[tokio::test]
    async fn offline_stream_is_none() {
        let server = MockServer::start().await;
        mount_token(&server, "app-token").await;
        Mock::given(method("GET"))
            .and(path("/helix/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let twitch = service(&server);
        assert!(twitch.get_stream("4242").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limited_request_is_retried_after_the_hinted_delay() {
        let server = MockServer::start().await;
        mount_token(&server, "app-token").await;
        Mock::given(method("GET"))
            .and(path("/helix/streams"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/helix/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "stream-1", "user_id": "4242", "user_login": "singer",
                    "type": "live", "title": "Karaoke", "started_at": "2024-05-01T18:00:00Z"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let twitch = service(&server);
        let stream = twitch.get_stream("4242").await.unwrap().unwrap();
        assert_eq!(stream.id, "stream-1");
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app-token", "expires_in": 3600
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let twitch = service(&server);
        assert!(twitch.get_user_by_login("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_a_missing_subscription_succeeds() {
        let server = MockServer::start().await;
        mount_token(&server, "app-token").await;
        Mock::given(method("DELETE"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(query_param("id", "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let twitch = service(&server);
        assert!(twitch.delete_eventsub_subscription("gone").await.is_ok());
    }

    #[test]
    fn backoff_doubles_honours_hints_and_stops() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(None), Some(StdDuration::from_secs(1)));
        assert_eq!(
            backoff.next_delay(Some(StdDuration::from_secs(600))),
            Some(MAX_RETRY_DELAY)
        );
        assert_eq!(backoff.next_delay(None), Some(StdDuration::from_secs(4)));
        assert_eq!(backoff.next_delay(None), Some(StdDuration::from_secs(8)));
        assert_eq!(backoff.next_delay(None), None);
        assert_eq!(backoff.attempts, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn disabled_client_makes_no_requests() {
        let twitch = TwitchService::new(&Config::default()).unwrap();
        assert!(!twitch.is_enabled());
        assert!(matches!(
            twitch.get_stream("4242").await,
            Err(AppError::ServiceUnavailable(_))
        ));
    }
}
