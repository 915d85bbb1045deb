use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use http::HeaderValue;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod services;

use config::{Config, LogFormat};
use middleware::rate_limit::{rate_limit_error, spawn_limiter_cleaner};
use services::auth::TokenStore;
use services::init;
use services::sites::SiteRegistry;
use services::twitch::TwitchService;
use services::webhooks::RecentMessages;
use services::websub::WebSubService;
use services::youtube::VideoLookup;

pub struct AppState {
    pub config: Config,
    pub sites: SiteRegistry,
    pub lookup: Arc<dyn VideoLookup>,
    pub websub: WebSubService,
    pub twitch: TwitchService,
    pub tokens: TokenStore,
    pub eventsub_messages: RecentMessages,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "streamer_roster=debug,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;
    init_tracing(config.server.log_format);

    tracing::info!("Starting Streamer Roster Service");

    let app_state = init::build_state(config.clone())?;

    // Create shutdown notifier for background workers and std threads
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Per-IP limiter for the public POST endpoints (login, submissions)
    let mut public_builder = GovernorConfigBuilder::default();
    public_builder.per_second(config.rate_limit.public_per_second.into());
    public_builder.burst_size(config.rate_limit.public_burst);
    let mut public_builder = public_builder.key_extractor(SmartIpKeyExtractor);
    public_builder.error_handler(rate_limit_error);
    let public_gov_conf = Arc::new(
        public_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build public governor config"))?,
    );
    let public_cleaner = {
        let limiter = public_gov_conf.limiter().clone();
        spawn_limiter_cleaner("Public", thread_shutdown.clone(), move || {
            limiter.retain_recent();
            limiter.len()
        })
    };

    // Webhook callbacks limiter
    let mut webhooks_builder = GovernorConfigBuilder::default();
    webhooks_builder.per_second(config.rate_limit.webhook_per_second.into());
    webhooks_builder.burst_size(config.rate_limit.webhook_burst);
    let mut webhooks_builder = webhooks_builder.key_extractor(SmartIpKeyExtractor);
    webhooks_builder.error_handler(rate_limit_error);
    let webhooks_gov_conf = Arc::new(
        webhooks_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build webhooks governor config"))?,
    );
    let webhooks_cleaner = {
        let limiter = webhooks_gov_conf.limiter().clone();
        spawn_limiter_cleaner("Webhooks", thread_shutdown.clone(), move || {
            limiter.retain_recent();
            limiter.len()
        })
    };

    let mut app = routes::build_router(
        app_state.clone(),
        |router| {
            router.layer(GovernorLayer {
                config: webhooks_gov_conf.clone(),
            })
        },
        |router| {
            router.layer(GovernorLayer {
                config: public_gov_conf.clone(),
            })
        },
    );

    if let Some(origin) = config.server.cors_origin.as_deref() {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin.parse::<HeaderValue>()?)
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                    http::Method::PATCH,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                ])
                .allow_credentials(true),
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    // Select between the server and the signal listener. On a signal the
    // server future is dropped (no new connections) and workers are notified.
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let shutdown_tx_clone = shutdown_tx.clone();
    let thread_shutdown_clone = thread_shutdown.clone();

    let signal_fut = async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {},
                        _ = term.recv() => {},
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to bind SIGTERM: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Shutdown signal received, notifying background workers and threads");
        let _ = shutdown_tx_clone.send(());
        thread_shutdown_clone.store(true, Ordering::SeqCst);
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server stopped accepting connections");
        }
    }

    // The server may also stop on its own; make sure everything is told.
    let _ = shutdown_tx.send(());
    thread_shutdown.store(true, Ordering::SeqCst);

    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time");
    }

    // Cleaner threads poll the flag once a second.
    for (name, handle) in [("public", public_cleaner), ("webhooks", webhooks_cleaner)] {
        if handle.join().is_err() {
            tracing::warn!("The {} rate limiter cleanup thread panicked", name);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
