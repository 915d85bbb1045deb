//! YouTube WebSub callback: hub verification (GET) and feed delivery (POST).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;

use crate::db::StreamerKey;
use crate::error::{AppError, AppResult};
use crate::services::feed::parse_feed;
use crate::services::reconciler::Reconciler;
use crate::services::websub::{
    channel_from_topic, HubMode, HubVerificationParams, SubscriptionExpectation,
    VerificationOutcome,
};
use crate::AppState;

/// Largest feed body accepted on POST /alerts.
pub const MAX_FEED_BYTES: usize = 1024 * 1024;

const SIGNATURE_HEADER: &str = "x-hub-signature";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/alerts",
        get(verify_subscription)
            .post(receive_feed)
            .layer(DefaultBodyLimit::max(MAX_FEED_BYTES)),
    )
}

async fn verify_subscription(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HubVerificationParams>,
) -> AppResult<Response> {
    match state.websub.verify(params).await? {
        VerificationOutcome::Confirmed {
            challenge,
            expectation,
            lease_seconds,
        } => {
            tracing::info!(
                "Hub confirmed {} for {} (lease {:?}s)",
                expectation.mode.as_str(),
                expectation.channel_id,
                lease_seconds
            );
            if let Err(e) = record_lease(&state, &expectation, lease_seconds).await {
                // The hub still gets its challenge; the lease is re-checked later.
                tracing::warn!(
                    "Failed to record lease for {}: {}",
                    expectation.channel_id,
                    e
                );
            }
            Ok(([(header::CONTENT_TYPE, "text/plain")], challenge).into_response())
        }
        VerificationOutcome::Denied { topic } => {
            if let Some(channel_id) = channel_from_topic(&topic) {
                tracing::warn!("Hub will not deliver updates for channel {}", channel_id);
            }
            Ok(StatusCode::OK.into_response())
        }
    }
}

async fn record_lease(
    state: &AppState,
    expectation: &SubscriptionExpectation,
    lease_seconds: Option<u64>,
) -> AppResult<()> {
    let Some((site, _)) = state
        .sites
        .find_youtube_channel(&expectation.channel_id)
        .await?
    else {
        return Ok(());
    };

    let subscribed = expectation.mode == HubMode::Subscribe;
    let now = Utc::now();
    site.streamers
        .modify(
            &StreamerKey::YouTubeChannel(expectation.channel_id.clone()),
            Box::new(move |s| {
                if let Some(yt) = s.platforms.youtube.as_mut() {
                    if subscribed {
                        yt.lease_seconds = lease_seconds;
                        yt.lease_date = Some(now);
                    } else {
                        yt.lease_seconds = None;
                        yt.lease_date = None;
                    }
                }
            }),
        )
        .await?;
    Ok(())
}

async fn receive_feed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<StatusCode> {
    let body = body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => AppError::PayloadTooLarge,
        _ => AppError::BadRequest(rejection.body_text()),
    })?;
    let xml = std::str::from_utf8(&body)
        .map_err(|_| AppError::BadRequest("feed is not valid UTF-8".to_string()))?;
    let feed = parse_feed(xml).map_err(|e| AppError::BadRequest(e.to_string()))?;

    tracing::debug!(
        "WebSub delivery: {} entries, {} deleted, channels {:?}",
        feed.entries.len(),
        feed.deleted.len(),
        feed.channel_ids()
    );

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let report = Reconciler::new(&state.sites, state.lookup.as_ref())
        .reconcile(&feed, signature, &body)
        .await;

    if report.lookup_failures > 0 {
        Ok(StatusCode::ACCEPTED)
    } else {
        Ok(StatusCode::NO_CONTENT)
    }
}
