pub mod alerts;
pub mod auth;
pub mod health;
pub mod sites;
pub mod streamers;
pub mod submissions;
pub mod webhooks;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::middleware::csp;
use crate::AppState;

type StateRouter = Router<Arc<AppState>>;

/// Assemble the application. `limit_webhooks` wraps the WebSub and EventSub
/// callbacks, `limit_public` wraps login and the public submission form;
/// main uses them to attach the per-IP rate limiters.
pub fn build_router<W, P>(state: Arc<AppState>, limit_webhooks: W, limit_public: P) -> Router
where
    W: FnOnce(StateRouter) -> StateRouter,
    P: FnOnce(StateRouter) -> StateRouter,
{
    let callbacks = limit_webhooks(
        Router::new()
            .merge(alerts::router())
            .merge(webhooks::router()),
    );
    let public = limit_public(
        Router::new()
            .merge(auth::router())
            .merge(submissions::public_router()),
    );

    Router::new()
        .route("/health", get(health::health_check))
        .merge(callbacks)
        .merge(public)
        .merge(auth::logout_router())
        .merge(streamers::router())
        .merge(submissions::admin_router())
        .merge(sites::router())
        .with_state(state)
        .layer(axum::middleware::from_fn(csp::security_headers))
        .layer(TraceLayer::new_for_http())
}
