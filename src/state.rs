//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::{self, SqliteUploadRepository};
use crate::error::{AppError, Result};
use crate::upload::{LocalBlobStore, UploadProtocolEngine};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    engine: UploadProtocolEngine,
    db: Option<SqlitePool>,
}

impl AppState {
    /// Create a new application state
    ///
    /// `db` is only used for readiness checks; pass `None` when the engine
    /// runs on a non-SQL repository.
    pub fn new(config: Config, engine: UploadProtocolEngine, db: Option<SqlitePool>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, engine, db }),
        }
    }

    /// Build the production stack: upload directory, SQLite records and
    /// the engine on top of them
    pub async fn from_config(config: Config) -> Result<Self> {
        validate(&config)?;

        let blobs = LocalBlobStore::new(&config.tus.upload_dir).await?;
        tracing::info!("Upload directory: {}", blobs.root().display());

        let pool = db::create_pool(&config.database.url).await?;
        tracing::info!("Database initialized at {}", config.database.url);

        let engine = UploadProtocolEngine::new(
            Arc::new(SqliteUploadRepository::new(pool.clone())),
            Arc::new(blobs),
            config.tus.engine_settings(),
        );

        Ok(Self::new(config, engine, Some(pool)))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload engine
    pub fn engine(&self) -> &UploadProtocolEngine {
        &self.inner.engine
    }

    /// Get the database pool
    pub fn db(&self) -> Option<&SqlitePool> {
        self.inner.db.as_ref()
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.tus.max_file_size == 0 {
        return Err(AppError::Config("TUS_MAX_FILE_SIZE must be greater than zero".to_string()));
    }
    if config.tus.write_timeout_secs == 0 {
        return Err(AppError::Config("TUS_WRITE_TIMEOUT_SECS must be greater than zero".to_string()));
    }
    Ok(())
}
