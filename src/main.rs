use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use libram::api::{self, AppState};
use libram::auth::Authenticator;
use libram::config;
use libram::download::{Registry, WorkerPool, sweeper};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();
    color_eyre::install()?;

    let config = Arc::new(config::config());

    // staging and ingest directories must exist before the first download
    for dir in [&config.tmp_dir, &config.ingest_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            tracing::info!("created directory {}", dir.display());
        }
    }

    let registry = Arc::new(Registry::new(config.status_timeout()));

    let auth = Authenticator::connect(config.cwa_db_path.as_deref()).await?;
    if auth.is_disabled() {
        tracing::warn!("no credential database configured, authentication disabled");
    }

    let pool = WorkerPool::start(config.clone(), registry.clone());

    let sweeper_stop = CancellationToken::new();
    tokio::spawn(sweeper::run(
        registry.clone(),
        sweeper::SWEEP_INTERVAL,
        sweeper_stop.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        auth,
    });
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.host).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // workers drain their current items; queued work is not persisted
    tracing::info!("shutting down");
    sweeper_stop.cancel();
    pool.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
