use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::db::{CreateSubmission, Streamer, Submission};
use crate::error::{AppError, AppResult};
use crate::routes::auth::AdminUser;
use crate::routes::sites::CurrentSite;
use crate::routes::streamers::spawn_platform_sync;
use crate::AppState;

/// The public, rate-limited submission endpoint.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new().route("/api/submissions", post(submit))
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/submissions", get(list_submissions))
        .route("/api/admin/submissions/:id/approve", post(approve))
        .route("/api/admin/submissions/:id/reject", post(reject))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionReceipt {
    id: String,
    site: String,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    CurrentSite(site): CurrentSite,
    Json(input): Json<CreateSubmission>,
) -> AppResult<(StatusCode, Json<SubmissionReceipt>)> {
    if !state.config.app.submissions_enabled {
        return Err(AppError::Forbidden);
    }

    input.validate()?;
    let submission = site.submissions.add(input.into_submission()).await?;
    tracing::info!(
        "New submission {} ({}) for site {}",
        submission.id,
        submission.alias,
        site.slug
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmissionReceipt {
            id: submission.id,
            site: site.slug,
        }),
    ))
}

async fn list_submissions(
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
) -> AppResult<Json<Vec<Submission>>> {
    Ok(Json(site.submissions.list().await?))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Path(id): Path<String>,
) -> AppResult<(StatusCode, Json<Streamer>)> {
    let submission = site
        .submissions
        .find(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Submission {} not found", id)))?;

    // A conflicting alias leaves the submission queued.
    if let Some(existing) = site.streamers.find_by_alias(submission.alias.trim()).await? {
        return Err(AppError::Conflict(format!(
            "Alias '{}' is already used by streamer {}",
            existing.alias, existing.id
        )));
    }
    let streamer = site
        .streamers
        .create(submission.to_create_streamer())
        .await?;
    site.submissions.take(&id).await?;
    tracing::info!(
        "Approved submission {} as streamer {} in site {}",
        id,
        streamer.alias,
        site.slug
    );

    let view = streamer.without_secrets();
    spawn_platform_sync(state, site, None, Some(streamer));
    Ok((StatusCode::CREATED, Json(view)))
}

async fn reject(
    _admin: AdminUser,
    CurrentSite(site): CurrentSite,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let removed = site.submissions.take(&id).await?;
    tracing::info!("Rejected submission {} ({})", removed.id, removed.alias);
    Ok(StatusCode::NO_CONTENT)
}
