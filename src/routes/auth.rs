use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, StatusCode},
    routing::post,
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::services::auth::{AdminToken, AuthService};
use crate::AppState;

/// Cookie carrying the admin token for browser sessions.
pub const ADMIN_COOKIE: &str = "roster_admin";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/admin/login", post(login))
}

/// Logout needs no rate limit and is mounted with the admin routes.
pub fn logout_router() -> Router<Arc<AppState>> {
    Router::new().route("/api/admin/logout", post(logout))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> AppResult<(CookieJar, Json<AdminToken>)> {
    if !AuthService::verify_credentials(&state.config.admin, &req.username, &req.password) {
        tracing::warn!("Rejected admin login for '{}'", req.username);
        return Err(AppError::Unauthorized);
    }

    let issued = state.tokens.issue().await;
    tracing::info!("Admin '{}' logged in", req.username);

    let max_age = time::Duration::seconds(state.tokens.ttl().num_seconds().max(0));
    let cookie = Cookie::build((ADMIN_COOKIE, issued.token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(state.config.server.public_url.starts_with("https://"))
        .max_age(max_age);

    Ok((jar.add(cookie), Json(issued)))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    admin: AdminUser,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    state.tokens.revoke(&admin.token).await;
    let jar = jar.remove(Cookie::build(ADMIN_COOKIE).path("/"));
    (jar, StatusCode::NO_CONTENT)
}

/// An authenticated admin. Accepts `Authorization: Bearer <token>` or the
/// admin cookie.
pub struct AdminUser {
    pub token: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());

        let token = match bearer {
            Some(token) => token,
            None => CookieJar::from_headers(&parts.headers)
                .get(ADMIN_COOKIE)
                .map(|cookie| cookie.value().to_string())
                .ok_or(AppError::Unauthorized)?,
        };

        if token.is_empty() || !state.tokens.validate(&token).await {
            return Err(AppError::Unauthorized);
        }

        Ok(AdminUser { token })
    }
}
