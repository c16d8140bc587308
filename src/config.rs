//! Configuration management for the tus server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::upload::{EngineSettings, DEFAULT_FILENAME_FIELD, DEFAULT_MAX_FILE_SIZE};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub tus: TusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TusConfig {
    /// Blob root directory
    pub upload_dir: PathBuf,
    /// Mount point of the tus routes; also the prefix of `Location`
    pub base_path: String,
    pub max_file_size: u64,
    /// Upload lifetime in seconds, 0 = never expire
    pub upload_expires_secs: u64,
    pub sweep_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub response_body_enabled: bool,
    pub filename_metadata_field: String,
}

impl Default for TusConfig {
    fn default() -> Self {
        TusConfig {
            upload_dir: PathBuf::from("./uploads"),
            base_path: "/files".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            upload_expires_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
            write_timeout_secs: 60,
            response_body_enabled: false,
            filename_metadata_field: DEFAULT_FILENAME_FIELD.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./tus.db".to_string(),
            },
            tus: TusConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %value, "Ignoring unparsable environment value");
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Normalize to a leading slash and no trailing slash
fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/files".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env_or("SERVER_PORT", defaults.server.port),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            tus: TusConfig {
                upload_dir: env::var("TUS_UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.tus.upload_dir),
                base_path: normalize_base_path(
                    &env::var("TUS_BASE_PATH").unwrap_or(defaults.tus.base_path),
                ),
                max_file_size: env_or("TUS_MAX_FILE_SIZE", defaults.tus.max_file_size)
                    .min(i64::MAX as u64),
                upload_expires_secs: env_or("TUS_UPLOAD_EXPIRES_SECS", defaults.tus.upload_expires_secs),
                sweep_interval_secs: env_or("TUS_SWEEP_INTERVAL_SECS", defaults.tus.sweep_interval_secs)
                    .max(1),
                write_timeout_secs: env_or("TUS_WRITE_TIMEOUT_SECS", defaults.tus.write_timeout_secs)
                    .max(1),
                response_body_enabled: env_flag(
                    "TUS_RESPONSE_BODY_ENABLED",
                    defaults.tus.response_body_enabled,
                ),
                filename_metadata_field: env::var("TUS_FILENAME_METADATA_FIELD")
                    .unwrap_or(defaults.tus.filename_metadata_field),
            },
        })
    }

    /// Listen address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl TusConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Settings for the protocol engine
    pub fn engine_settings(&self) -> EngineSettings {
        let expiration = match self.upload_expires_secs {
            0 => None,
            secs => Some(chrono::Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64)),
        };

        EngineSettings {
            max_size: self.max_file_size,
            expiration,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            filename_field: self.filename_metadata_field.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:3000");
        assert_eq!(config.tus.base_path, "/files");

        let settings = config.tus.engine_settings();
        assert_eq!(settings.max_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(settings.expiration, Some(chrono::Duration::hours(24)));
        assert_eq!(settings.filename_field, "filename");
    }

    #[test]
    fn test_zero_expiry_disables_expiration() {
        let tus = TusConfig {
            upload_expires_secs: 0,
            ..TusConfig::default()
        };
        assert!(tus.engine_settings().expiration.is_none());
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path("files/"), "/files");
        assert_eq!(normalize_base_path("/api/uploads/"), "/api/uploads");
        assert_eq!(normalize_base_path("/"), "/files");
    }
}
