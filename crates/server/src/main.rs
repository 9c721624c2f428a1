use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use coedit_server::{
    api,
    app,
    auth::jwt::AccessTokenService,
    config::ServerConfig,
    db::pool::{check_pool_health, create_pg_pool, PoolConfig},
    engine::DocRegistry,
    metrics::{self, ServerMetrics},
    presence::PresenceRegistry,
    store::DocumentStore,
    ws,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set COEDIT_JWT_SECRET in production");
    }

    metrics::set_global_metrics(Arc::new(ServerMetrics::default()));

    let store = match &config.database_url {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize PostgreSQL pool")?;
            check_pool_health(&pool).await.context("PostgreSQL health check failed")?;
            DocumentStore::Postgres(pool)
        }
        None => {
            warn!("COEDIT_DATABASE_URL is not set; documents live in process memory only");
            DocumentStore::in_memory()
        }
    };
    store.ensure_schema().await.context("failed to ensure the document schema")?;

    let jwt_service =
        Arc::new(AccessTokenService::new(&config.jwt_secret).context("invalid JWT secret")?);
    let registry = Arc::new(DocRegistry::new(store, config.engine_config()));
    let presence = Arc::new(PresenceRegistry::new(config.presence_ttl));

    let collab_state = ws::CollabState {
        sessions: ws::SessionStore::default(),
        registry: Arc::clone(&registry),
        presence: Arc::clone(&presence),
        jwt_service: Arc::clone(&jwt_service),
    };

    // Idle write-back and presence reaping share one maintenance loop.
    {
        let registry = Arc::clone(&registry);
        let presence = Arc::clone(&presence);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tick.tick().await;
                registry.flush_dirty(false).await;
                presence.purge_expired().await;
            }
        });
    }

    let router =
        app::build_router(collab_state, api::build_router(jwt_service, Arc::clone(&registry)));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting coedit server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;

    let flushed = registry.flush_dirty(true).await;
    info!(flushed, "flushed dirty documents on shutdown");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
