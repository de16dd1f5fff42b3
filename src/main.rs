use std::{net::SocketAddr, sync::Arc, time::Duration};

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unverify::api::{self, middleware::rate_limit::RevokeRateLimiter, AppState};
use unverify::config::Config;
use unverify::db::{self, PgRecordStore, RecordStore};
use unverify::jobs::UnverifyLoop;
use unverify::services::{
    discord::DiscordGateway, gateway::GuildGateway, restorer::Restorer, revoker::Revoker,
};

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unverify=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting unverify service...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        marker_roles = config.engine.marker_role_ids.len(),
        "Configuration loaded successfully"
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool));
    let gateway: Arc<dyn GuildGateway> = Arc::new(DiscordGateway::new(
        &config.discord_api_url,
        config.discord_bot_token.clone(),
    )?);

    let revoker = Arc::new(Revoker::new(
        store.clone(),
        gateway.clone(),
        config.engine.clone(),
    ));
    let restorer = Arc::new(Restorer::new(
        store.clone(),
        gateway.clone(),
        config.engine.clone(),
    ));
    let unverify_loop = Arc::new(UnverifyLoop::new(
        store.clone(),
        restorer,
        config.engine.clone(),
    ));

    // Start the restoration loop once the guild API answers
    let scheduler_task = tokio::spawn(unverify_loop.start(gateway.clone()));

    let limiter = Arc::new(RevokeRateLimiter::new(
        config.rate_limit_requests,
        Duration::from_secs(config.rate_limit_period_secs),
    ));

    // Prune refilled rate limit buckets so one-off members don't accumulate
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let remaining = limiter.cleanup();
                tracing::debug!(remaining, "Rate limiter buckets pruned");
            }
        });
    }

    // Build application state
    let state = AppState {
        store,
        gateway,
        revoker,
        limiter,
        api_token: config.api_token.clone(),
    };

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight restorations are left to finish on their own; anything
    // interrupted stays waiting and is picked up after restart
    if scheduler_task.is_finished() {
        match scheduler_task.await? {
            Ok(mut scheduler) => scheduler.shutdown().await?,
            Err(e) => tracing::error!(error = %e, "Unverify loop failed to start"),
        }
    } else {
        scheduler_task.abort();
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
