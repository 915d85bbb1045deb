use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{CreateStreamer, PlatformStatus, Streamer, StreamerKey, StreamerView, UpdateStreamer};
use crate::error::{AppError, AppResult};
use crate::routes::auth::AdminUser;
use crate::routes::sites::CurrentSite;
use crate::services::reconciler::refresh_youtube;
use crate::services::sites::Site;
use crate::services::subscriptions::SubscriptionManager;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/streamers",
            get(list_streamers)
                .post(create_streamer)
                .patch(update_streamer)
                .delete(delete_streamer),
        )
        .route("/api/admin/streamers", get(list_admin_streamers))
        .route("/api/admin/streamers/refresh", post(refresh_streamer))
        .route("/api/admin/streamers/subscribe", post(force_subscribe))
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

/// Admin listing entry: the stored record without its hub secret, plus
/// derived lease information.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStreamerView {
    #[serde(flatten)]
    pub streamer: Streamer,
    pub has_hub_secret: bool,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl From<&Streamer> for AdminStreamerView {
    fn from(streamer: &Streamer) -> Self {
        let youtube = streamer.platforms.youtube.as_ref();
        let lease_expires_at = youtube.and_then(|yt| {
            let seconds = i64::try_from(yt.lease_seconds?).ok()?;
            yt.lease_date?.checked_add_signed(Duration::try_seconds(seconds)?)
        });

        AdminStreamerView {
            streamer: streamer.without_secrets(),
            has_hub_secret: youtube.map_or(false, |yt| yt.hub_secret.is_some()),
            lease_expires_at,
        }
    }
}

async fn list_streamers(CurrentSite(site): CurrentSite) -> Json<Vec<StreamerView>> {
    match site.streamers.list().await {
        Ok(streamers) => Json(streamers.iter().map(StreamerView::from).collect()),
        Err(e) => {
            tracing::warn!("Failed to read roster of site {}: {}", site.slug, e);
            Json(Vec::new())
        }
    }
}

async fn list_admin_streamers(
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
) -> AppResult<Json<Vec<AdminStreamerView>>> {
    let streamers = site.streamers.list().await?;
    Ok(Json(streamers.iter().map(AdminStreamerView::from).collect()))
}

async fn create_streamer(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Json(input): Json<CreateStreamer>,
) -> AppResult<(StatusCode, Json<Streamer>)> {
    let streamer = site.streamers.create(input).await?;
    tracing::info!("Created streamer {} in site {}", streamer.alias, site.slug);

    spawn_platform_sync(state, site, None, Some(streamer.clone()));
    Ok((StatusCode::CREATED, Json(streamer.without_secrets())))
}

async fn update_streamer(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Query(query): Query<IdQuery>,
    Json(patch): Json<UpdateStreamer>,
) -> AppResult<Json<Streamer>> {
    let update = site.streamers.update(&query.id, patch).await?;
    tracing::info!("Updated streamer {} in site {}", update.current.alias, site.slug);

    let current = update.current.without_secrets();
    spawn_platform_sync(state, site, Some(update.previous), Some(update.current));
    Ok(Json(current))
}

async fn delete_streamer(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Query(query): Query<IdQuery>,
) -> AppResult<StatusCode> {
    let removed = site.streamers.delete(&query.id).await?;
    tracing::info!("Deleted streamer {} from site {}", removed.alias, site.slug);

    spawn_platform_sync(state, site, Some(removed), None);
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_streamer(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Streamer>> {
    let mut streamer = find_streamer(&site, &query.id).await?;

    if state.config.youtube.enabled && streamer.platforms.youtube.is_some() {
        streamer = refresh_youtube(&site, state.lookup.as_ref(), &streamer).await?;
    }

    if state.twitch.is_enabled() {
        if let Some(broadcaster_id) = streamer.twitch_broadcaster_id().map(str::to_string) {
            let next = match state.twitch.get_stream(&broadcaster_id).await? {
                Some(stream) => PlatformStatus {
                    live: true,
                    video_id: Some(stream.id),
                    title: Some(stream.title),
                    started_at: DateTime::parse_from_rfc3339(&stream.started_at)
                        .ok()
                        .map(|t| t.with_timezone(&Utc)),
                },
                None => PlatformStatus::offline(),
            };

            if next != streamer.status.twitch {
                let now = Utc::now();
                if let Some(updated) = site
                    .streamers
                    .modify(
                        &StreamerKey::Id(streamer.id.clone()),
                        Box::new(move |s| s.status.set_twitch(next, now)),
                    )
                    .await?
                {
                    streamer = updated;
                }
            }
        }
    }

    Ok(Json(streamer.without_secrets()))
}

async fn force_subscribe(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Query(query): Query<IdQuery>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    if !state.config.youtube.enabled {
        return Err(AppError::ServiceUnavailable(
            "YouTube integration is disabled".to_string(),
        ));
    }

    let streamer = find_streamer(&site, &query.id).await?;
    let channel_id = streamer
        .youtube_channel_id()
        .ok_or_else(|| AppError::BadRequest(format!("{} has no YouTube channel", streamer.alias)))?;

    state
        .websub
        .subscribe(site.streamers.as_ref(), channel_id)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "pending", "channelId": channel_id })),
    ))
}

async fn find_streamer(site: &Site, id: &str) -> AppResult<Streamer> {
    site.streamers
        .find(&StreamerKey::Id(id.to_string()))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Streamer {} not found", id)))
}

/// Bring hub and EventSub subscriptions in line with a roster change, in the
/// background. `previous` is `None` for a create, `current` is `None` for a
/// delete. Failures are logged only.
pub(crate) fn spawn_platform_sync(
    state: Arc<AppState>,
    site: Site,
    previous: Option<Streamer>,
    current: Option<Streamer>,
) {
    tokio::spawn(async move {
        if state.config.youtube.enabled {
            sync_youtube(&state, &site, previous.as_ref(), current.as_ref()).await;
        }
        if state.twitch.is_enabled() {
            sync_twitch(&state, &site, previous.as_ref(), current.as_ref()).await;
        }
    });
}

async fn sync_youtube(
    state: &AppState,
    site: &Site,
    previous: Option<&Streamer>,
    current: Option<&Streamer>,
) {
    let old = previous.and_then(|s| s.platforms.youtube.as_ref());
    let new_channel = current.and_then(Streamer::youtube_channel_id);
    if old.map(|yt| yt.channel_id.as_str()) == new_channel {
        return;
    }

    if let Some(old) = old {
        if let Err(e) = state
            .websub
            .unsubscribe(&old.channel_id, old.hub_secret.as_deref())
            .await
        {
            tracing::warn!("Failed to unsubscribe {}: {}", old.channel_id, e);
        }
    }

    if let Some(channel_id) = new_channel {
        if let Err(e) = state
            .websub
            .subscribe(site.streamers.as_ref(), channel_id)
            .await
        {
            tracing::warn!("Failed to subscribe {}: {}", channel_id, e);
        }
    }
}

async fn sync_twitch(
    state: &AppState,
    site: &Site,
    previous: Option<&Streamer>,
    current: Option<&Streamer>,
) {
    let old_login = previous
        .and_then(|s| s.platforms.twitch.as_ref())
        .map(|tw| tw.login.to_lowercase());
    let new_login = current
        .and_then(|s| s.platforms.twitch.as_ref())
        .map(|tw| tw.login.to_lowercase());
    if old_login == new_login {
        return;
    }

    if let Some(previous) = previous {
        SubscriptionManager::remove_for_streamer(&state.twitch, previous).await;
    }

    if let Some(current) = current {
        if let Err(e) =
            SubscriptionManager::ensure_for_streamer(&state.twitch, site.streamers.as_ref(), current)
                .await
        {
            tracing::warn!("Failed to ensure EventSub for {}: {}", current.alias, e);
        }
    }
}
