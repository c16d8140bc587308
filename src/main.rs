//! tus Server
//!
//! Resumable upload server implementing tus 1.0.0 with the creation,
//! creation-defer-length, termination, checksum and expiration extensions.

use anyhow::Context;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tus_server::config::Config;
use tus_server::routes;
use tus_server::state::AppState;
use tus_server::upload::{UploadEvent, UploadProtocolEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tus_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting tus server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Base path: {}", config.tus.base_path);

    let addr = config.bind_addr();
    let sweep_interval = config.tus.sweep_interval();

    // Upload directory, database and engine
    let app_state = AppState::from_config(config)
        .await
        .context("Failed to initialize server")?;
    let engine = app_state.engine().clone();
    let db_pool = app_state.db().cloned();

    // Background tasks
    let sweeper = engine.start_expiry_sweeper(sweep_interval);
    let event_logger = spawn_event_logger(&engine);

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("tus server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    event_logger.abort();
    if let Some(pool) = db_pool {
        pool.close().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Log upload lifecycle events
fn spawn_event_logger(engine: &UploadProtocolEngine) -> tokio::task::JoinHandle<()> {
    let mut events = engine.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UploadEvent::Finished(record)) => {
                    tracing::info!(
                        upload_id = %record.id,
                        length = record.offset,
                        filename = ?record.filename,
                        "Upload complete"
                    );
                }
                Ok(UploadEvent::Terminated(id)) => {
                    tracing::debug!(upload_id = %id, "Upload terminated by client");
                }
                Ok(UploadEvent::Expired(id)) => {
                    tracing::debug!(upload_id = %id, "Upload expired");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
