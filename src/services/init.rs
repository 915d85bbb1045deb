//! Initialization helpers for the application:
//! building the shared state and spawning the maintenance worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::services::auth::TokenStore;
use crate::services::lease;
use crate::services::sites::SiteRegistry;
use crate::services::subscriptions::SubscriptionManager;
use crate::services::twitch::TwitchService;
use crate::services::webhooks::RecentMessages;
use crate::services::websub::WebSubService;
use crate::services::youtube;
use crate::AppState;

/// EventSub subscriptions are re-checked this often.
const TWITCH_SYNC_INTERVAL_SECS: u64 = 60 * 60;

/// Used when `admin.token_ttl_hours` does not fit a duration.
const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365 * 100;

pub fn build_state(config: Config) -> Result<Arc<AppState>> {
    let sites = SiteRegistry::from_config(&config);
    for site in sites.all() {
        tracing::info!("Serving site '{}' ({})", site.slug, site.name);
    }

    let lookup = youtube::build_lookup(&config.youtube)?;
    let websub = WebSubService::new(&config)?;
    let twitch = TwitchService::new(&config)?;
    let tokens = TokenStore::new(token_ttl(config.admin.token_ttl_hours));

    if config.admin.password.is_empty() {
        tracing::warn!("admin.password is not set; admin login is disabled");
    }

    Ok(Arc::new(AppState {
        config,
        sites,
        lookup,
        websub,
        twitch,
        tokens,
        eventsub_messages: RecentMessages::new(),
    }))
}

fn token_ttl(hours: i64) -> chrono::Duration {
    chrono::Duration::try_hours(hours).unwrap_or_else(|| {
        tracing::warn!(
            "admin.token_ttl_hours = {} is out of range; using {} hours",
            hours,
            MAX_TOKEN_TTL_HOURS
        );
        chrono::Duration::hours(MAX_TOKEN_TTL_HOURS)
    })
}

/// One maintenance pass: prune in-memory caches and renew due WebSub leases.
pub async fn run_maintenance(state: &AppState) {
    let now = Utc::now();

    let tokens = state.tokens.prune().await;
    let expectations = state.websub.expectations.prune(now).await;
    let messages = state.eventsub_messages.prune(now).await;
    if tokens + expectations + messages > 0 {
        tracing::debug!(
            "Pruned {} admin token(s), {} expectation(s), {} EventSub id(s)",
            tokens,
            expectations,
            messages
        );
    }

    if state.config.youtube.enabled {
        let report = lease::renew_due_leases(&state.sites, &state.websub, now).await;
        if report.renewed + report.failed > 0 {
            tracing::info!(?report, "WebSub lease check finished");
        }
    }
}

/// Create missing EventSub subscriptions for every streamer with a Twitch login.
pub async fn sync_twitch_subscriptions(state: &AppState) {
    for site in state.sites.all() {
        let streamers = match site.streamers.list().await {
            Ok(streamers) => streamers,
            Err(e) => {
                tracing::warn!("Failed to list streamers of site {}: {}", site.slug, e);
                continue;
            }
        };

        for streamer in streamers {
            let Some(tw) = streamer.platforms.twitch.as_ref() else {
                continue;
            };
            if tw.online_subscription_id.is_some() && tw.offline_subscription_id.is_some() {
                continue;
            }

            if let Err(e) = SubscriptionManager::ensure_for_streamer(
                &state.twitch,
                site.streamers.as_ref(),
                &streamer,
            )
            .await
            {
                tracing::warn!("Failed to sync EventSub for {}: {}", streamer.alias, e);
            }
        }
    }
}

pub fn spawn_background_workers(
    state: Arc<AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let interval_secs = state.config.youtube.monitor_interval_seconds.max(1);
            let twitch_every = (TWITCH_SYNC_INTERVAL_SECS / interval_secs).max(1);
            let mut tick: u64 = 0;

            loop {
                run_maintenance(&state).await;

                if state.twitch.is_enabled() && tick % twitch_every == 0 {
                    tracing::info!("Starting periodic EventSub synchronization");
                    sync_twitch_subscriptions(&state).await;
                }
                tick = tick.wrapping_add(1);

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Maintenance worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                }
            }
        }));
    }

    handles
}
