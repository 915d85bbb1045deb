use serde_json::Value;
use tracing::{info, warn};

use crate::db::{Streamer, StreamerKey, StreamerRepository};
use crate::error::{AppError, AppResult};
use crate::services::twitch::{
    EventSubSubscription, TwitchService, SUB_TYPE_STREAM_OFFLINE, SUB_TYPE_STREAM_ONLINE,
};

pub struct SubscriptionManager;

impl SubscriptionManager {
    /// Make sure the streamer's Twitch channel has `stream.online` and
    /// `stream.offline` subscriptions, resolving the broadcaster id from the
    /// login first if needed. Returns the streamer as stored afterwards.
    pub async fn ensure_for_streamer(
        twitch: &TwitchService,
        streamers: &dyn StreamerRepository,
        streamer: &Streamer,
    ) -> AppResult<Streamer> {
        let Some(platform) = streamer.platforms.twitch.clone() else {
            return Ok(streamer.clone());
        };

        let broadcaster_id = match platform.broadcaster_id.clone() {
            Some(id) => id,
            None => {
                let user = twitch
                    .get_user_by_login(&platform.login)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Twitch user {} not found", platform.login))
                    })?;
                info!(
                    "Resolved Twitch login {} to broadcaster {}",
                    platform.login, user.id
                );
                user.id
            }
        };

        let mut online_id = platform.online_subscription_id.clone();
        let mut offline_id = platform.offline_subscription_id.clone();

        for (sub_type, slot) in [
            (SUB_TYPE_STREAM_ONLINE, &mut online_id),
            (SUB_TYPE_STREAM_OFFLINE, &mut offline_id),
        ] {
            if slot.is_some() {
                continue;
            }

            info!(
                "Creating EventSub {} for {} (broadcaster={})",
                sub_type, streamer.alias, broadcaster_id
            );
            match Self::create(twitch, sub_type, &broadcaster_id).await {
                Ok(sub) => *slot = Some(sub.id),
                Err(e) => {
                    // It may already exist (409); look it up.
                    warn!(
                        "Failed to create EventSub {} for {}: {}. Attempting to discover existing subscription.",
                        sub_type, streamer.alias, e
                    );
                    match twitch.list_eventsub_subscriptions(&broadcaster_id).await {
                        Ok(listing) => {
                            *slot = listing
                                .into_iter()
                                .find(|s| {
                                    s.subscription_type == sub_type
                                        && condition_matches_broadcaster(
                                            &s.condition,
                                            &broadcaster_id,
                                        )
                                })
                                .map(|s| s.id);
                            if slot.is_none() {
                                warn!(
                                    "No matching existing EventSub {} found for broadcaster {}",
                                    sub_type, broadcaster_id
                                );
                            }
                        }
                        Err(list_err) => warn!(
                            "Failed to list EventSub subscriptions for {}: {}",
                            broadcaster_id, list_err
                        ),
                    }
                }
            }
        }

        let login = platform.login.clone();
        let fetched = [online_id.clone(), offline_id.clone()];
        let stored = streamers
            .modify(
                &StreamerKey::Id(streamer.id.clone()),
                Box::new(move |s| {
                    // The login may have been edited while Twitch was being called.
                    if let Some(tw) = s
                        .platforms
                        .twitch
                        .as_mut()
                        .filter(|tw| tw.login == login)
                    {
                        tw.broadcaster_id = Some(broadcaster_id);
                        tw.online_subscription_id = online_id;
                        tw.offline_subscription_id = offline_id;
                    }
                }),
            )
            .await?;

        let still_current = stored
            .as_ref()
            .and_then(|s| s.platforms.twitch.as_ref())
            .map_or(false, |tw| tw.login == platform.login);
        if !still_current {
            warn!(
                "Twitch login {} of {} changed during sync; dropping its subscriptions",
                platform.login, streamer.alias
            );
            for id in fetched.iter().flatten() {
                if let Err(e) = twitch.delete_eventsub_subscription(id).await {
                    warn!("Failed to delete EventSub {}: {}", id, e);
                }
            }
        }

        Ok(stored.unwrap_or_else(|| streamer.clone()))
    }

    /// Delete the streamer's EventSub subscriptions on Twitch.
    pub async fn remove_for_streamer(twitch: &TwitchService, streamer: &Streamer) {
        let Some(platform) = streamer.platforms.twitch.as_ref() else {
            return;
        };

        for id in [
            platform.online_subscription_id.as_deref(),
            platform.offline_subscription_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            match twitch.delete_eventsub_subscription(id).await {
                Ok(()) => info!("Removed EventSub {} for {}", id, streamer.alias),
                Err(e) => warn!(
                    "Failed to delete EventSub {} for {}: {}",
                    id, streamer.alias, e
                ),
            }
        }
    }

    async fn create(
        twitch: &TwitchService,
        sub_type: &str,
        broadcaster_id: &str,
    ) -> AppResult<EventSubSubscription> {
        match sub_type {
            SUB_TYPE_STREAM_ONLINE => twitch.subscribe_stream_online(broadcaster_id).await,
            _ => twitch.subscribe_stream_offline(broadcaster_id).await,
        }
    }
}

/// Check if the EventSub condition object targets the given broadcaster id
fn condition_matches_broadcaster(condition: &Value, broadcaster_id: &str) -> bool {
    condition
        .get("broadcaster_user_id")
        .and_then(Value::as_str)
        .map_or(false, |id| id == broadcaster_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{CreateStreamer, JsonStreamerRepository, TwitchInput, UpdateStreamer};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn twitch(server: &MockServer) -> TwitchService {
        let mut config = Config::default();
        config.twitch.enabled = true;
        config.twitch.client_id = "cid".to_string();
        config.twitch.client_secret = "csecret".to_string();
        config.twitch.eventsub_secret = "eventsub-secret".to_string();
        config.twitch.api_base_url = format!("{}/helix", server.uri());
        config.twitch.auth_base_url = format!("{}/oauth2", server.uri());
        TwitchService::new(&config).unwrap()
    }

    fn subscription(id: &str, sub_type: &str) -> Value {
        json!({
            "id": id,
            "status": "enabled",
            "type": sub_type,
            "version": "1",
            "condition": { "broadcaster_user_id": "4242" }
        })
    }

    #[test]
    fn condition_match() {
        assert!(condition_matches_broadcaster(
            &json!({ "broadcaster_user_id": "1" }),
            "1"
        ));
        assert!(!condition_matches_broadcaster(
            &json!({ "broadcaster_user_id": "2" }),
            "1"
        ));
        assert!(!condition_matches_broadcaster(&json!("1"), "1"));
    }

    #[tokio::test]
    async fn resolves_login_and_stores_subscription_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok", "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(query_param("login", "singer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "4242", "login": "singer", "display_name": "Singer" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(body_partial_json(json!({ "type": "stream.online" })))
            .respond_with(
                ResponseTemplate::new(202)
                    .set_body_json(json!({ "data": [subscription("on-1", "stream.online")] })),
            )
            .mount(&server)
            .await;
        // The offline subscription already exists on Twitch.
        Mock::given(method("POST"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(body_partial_json(json!({ "type": "stream.offline" })))
            .respond_with(ResponseTemplate::new(409).set_body_string("already exists"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/helix/eventsub/subscriptions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": [subscription("off-1", "stream.offline")] })),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStreamerRepository::new(dir.path().join("streamers.json"));
        let streamer = repo
            .create(CreateStreamer {
                alias: "Singer".to_string(),
                twitch: Some(TwitchInput {
                    login: "singer".to_string(),
                    broadcaster_id: None,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let stored = SubscriptionManager::ensure_for_streamer(&twitch(&server), &repo, &streamer)
            .await
            .unwrap();
        let tw = stored.platforms.twitch.unwrap();
        assert_eq!(tw.broadcaster_id.as_deref(), Some("4242"));
        assert_eq!(tw.online_subscription_id.as_deref(), Some("on-1"));
        assert_eq!(tw.offline_subscription_id.as_deref(), Some("off-1"));
    }

    #[tokio::test]
    async fn login_changed_mid_sync_keeps_the_new_login_clean() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok", "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(body_partial_json(json!({ "type": "stream.online" })))
            .respond_with(
                ResponseTemplate::new(202)
                    .set_body_json(json!({ "data": [subscription("on-1", "stream.online")] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(body_partial_json(json!({ "type": "stream.offline" })))
            .respond_with(
                ResponseTemplate::new(202)
                    .set_body_json(json!({ "data": [subscription("off-1", "stream.offline")] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/helix/eventsub/subscriptions"))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStreamerRepository::new(dir.path().join("streamers.json"));
        let snapshot = repo
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
        repo.update(
            &snapshot.id,
            UpdateStreamer {
                twitch: Some(TwitchInput {
                    login: "renamed".to_string(),
                    broadcaster_id: None,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let stored = SubscriptionManager::ensure_for_streamer(&twitch(&server), &repo, &snapshot)
            .await
            .unwrap();
        let tw = stored.platforms.twitch.unwrap();
        assert_eq!(tw.login, "renamed");
        assert_eq!(tw.broadcaster_id, None);
        assert_eq!(tw.online_subscription_id, None);
        assert_eq!(tw.offline_subscription_id, None);
    }
}
