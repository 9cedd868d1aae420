use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub worker: WorkerSettings,
    pub review: ReviewConfig,
    pub default_currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding uploaded receipt files
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Run the parse step before extraction
    pub parse_step: bool,
    /// Where request payloads are staged; system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub poll_interval_secs: u64,
    pub batch_size: i64,
    pub concurrency: usize,
    /// Failed runs after which a receipt waits for a manual retry
    pub max_failures: u32,
    pub retry_delays_secs: Vec<u64>,
    pub stale_claim_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Extractions below this confidence go to review
    pub min_confidence: Option<f64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/receipts".to_string(),
                max_connections: 20,
                acquire_timeout_secs: 10,
            },
            storage: StorageConfig {
                root: PathBuf::from("data/receipts"),
            },
            extraction: ExtractionConfig {
                base_url: "http://127.0.0.1:9000".to_string(),
                api_key: None,
                request_timeout_secs: 60,
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 8_000,
                parse_step: true,
                staging_dir: None,
            },
            worker: WorkerSettings {
                poll_interval_secs: 5,
                batch_size: 10,
                concurrency: 2,
                max_failures: 3,
                retry_delays_secs: vec![10, 60, 600],
                stale_claim_secs: 900,
            },
            review: ReviewConfig::default(),
            default_currency: "EUR".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then `config/receipt-ingest.*`, then `RECEIPTS__SECTION__KEY` env vars.
    /// `DATABASE_URL` wins over everything for the database url.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/receipt-ingest").required(false))
            .add_source(
                Environment::with_prefix("RECEIPTS")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("worker.retry_delays_secs")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        Ok(config)
    }
}

impl ExtractionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_config_builder() {
        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.extraction.max_attempts, 3);
        assert_eq!(config.worker.retry_delays_secs, vec![10, 60, 600]);
        assert!(config.review.min_confidence.is_none());
    }
}
