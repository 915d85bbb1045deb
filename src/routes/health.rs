use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub sites: usize,
    pub youtube_enabled: bool,
    pub twitch_enabled: bool,
    pub pending_verifications: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        sites: state.sites.all().len(),
        youtube_enabled: state.config.youtube.enabled,
        twitch_enabled: state.twitch.is_enabled(),
        pending_verifications: state.websub.expectations.len().await,
    };

    (StatusCode::OK, Json(response))
}
