use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::Utc;

use crate::error::AppError;
use crate::services::webhooks::{
    EventSubPayload, WebhookService, MESSAGE_TYPE_NOTIFICATION, MESSAGE_TYPE_REVOCATION,
    MESSAGE_TYPE_VERIFICATION,
};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/admin/eventsub", post(handle_twitch_webhook))
}

async fn handle_twitch_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    state.twitch.ensure_enabled()?;

    let eventsub = WebhookService::extract_headers(&headers)?;
    let now = Utc::now();
    WebhookService::verify_signature(state.twitch.eventsub_secret(), &eventsub, &body, now)?;

    if !state
        .eventsub_messages
        .first_delivery(&eventsub.message_id, now)
        .await
    {
        tracing::debug!("Duplicate EventSub message {}", eventsub.message_id);
        return Ok((StatusCode::OK, "OK").into_response());
    }

    let result = dispatch(&state, &eventsub.message_type, &body).await;
    if result.is_err() {
        // Twitch redelivers failed messages with the same id.
        state.eventsub_messages.forget(&eventsub.message_id).await;
    }
    result
}

async fn dispatch(
    state: &AppState,
    message_type: &str,
    body: &[u8],
) -> Result<Response, AppError> {
    let payload: EventSubPayload = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {}", e)))?;

    tracing::info!(
        "Received EventSub webhook: message_type={}, subscription_type={}, subscription_id={}",
        message_type,
        payload.subscription.subscription_type,
        payload.subscription.id
    );

    match message_type {
        MESSAGE_TYPE_VERIFICATION => {
            let challenge = WebhookService::handle_verification(&payload)?;
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response())
        }
        MESSAGE_TYPE_NOTIFICATION => {
            WebhookService::handle_notification(&state.sites, &payload).await?;
            Ok((StatusCode::OK, "OK").into_response())
        }
        MESSAGE_TYPE_REVOCATION => {
            WebhookService::handle_revocation(&state.sites, &payload).await?;
            Ok((StatusCode::OK, "OK").into_response())
        }
        other => {
            tracing::warn!("Unknown message type: {}", other);
            Ok((StatusCode::OK, "OK").into_response())
        }
    }
}
