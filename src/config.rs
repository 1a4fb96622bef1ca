use std::net::SocketAddr;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::ResultExt as _;

use crate::database::DatabaseConfig;
use crate::error::{ApplicationError, ConfigLoadSnafu};
use crate::ingest::IngestConfig;
use crate::predict::PredictConfig;
use crate::source::YouTubeConfig;

/// Settings that are not tied to a single component.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host_address")]
    pub host_address: SocketAddr,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_host_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_log_dir() -> PathBuf {
    "logs".into()
}

/// Every section is read from environment variables sharing its prefix, e.g. `SURREAL_URL`
/// or `YOUTUBE_API_KEYS`.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub surreal: DatabaseConfig,
    pub youtube: YouTubeConfig,
    pub ingest: IngestConfig,
    pub predict: PredictConfig,
}

impl Config {
    /// Read `.env` if present, then the process environment.
    pub fn load() -> Result<Config, ApplicationError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: Vec<(String, String)>) -> Result<Config, ApplicationError> {
        Ok(Config {
            server: section("", &vars)?,
            surreal: section("SURREAL_", &vars)?,
            youtube: section("YOUTUBE_", &vars)?,
            ingest: section("INGEST_", &vars)?,
            predict: section("PREDICT_", &vars)?,
        })
    }
}

fn section<T: DeserializeOwned>(
    prefix: &'static str, vars: &[(String, String)],
) -> Result<T, ApplicationError> {
    envy::prefixed(prefix)
        .from_iter(vars.iter().cloned())
        .context(ConfigLoadSnafu { prefix })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn reads_prefixed_sections() {
        let config = Config::from_vars(vars(&[
            ("HOST_ADDRESS", "0.0.0.0:3000"),
            ("SURREAL_URL", "ws://localhost:8000"),
            ("SURREAL_NAMESPACE", "trends"),
            ("YOUTUBE_API_KEYS", "key-a,key-b"),
            ("YOUTUBE_TIMEOUT", "5s"),
            ("INGEST_SEEDS", "UCabc,UCdef"),
            ("INGEST_INTERVAL", "30m"),
            ("PREDICT_MODEL_DIR", "/srv/models"),
        ]))
        .unwrap();

        assert_eq!(config.server.host_address.port(), 3000);
        assert_eq!(config.surreal.namespace, "trends");
        assert_eq!(config.surreal.database, "viewtrends");
        assert_eq!(config.youtube.api_keys, vec!["key-a", "key-b"]);
        assert_eq!(*config.youtube.timeout, Duration::from_secs(5));
        assert_eq!(config.youtube.daily_quota, 10_000);
        assert_eq!(config.ingest.seeds.len(), 2);
        assert_eq!(*config.ingest.interval, Duration::from_secs(30 * 60));
        assert_eq!(config.ingest.failure_threshold, 0.5);
        assert_eq!(config.predict.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.predict.utc_offset_minutes, 330);
    }

    #[test]
    fn missing_database_url_names_the_section() {
        let error = Config::from_vars(vars(&[("YOUTUBE_API_KEYS", "key")])).unwrap_err();
        assert!(error.to_string().contains("SURREAL_"), "{error}");
    }

    #[test]
    fn rejects_malformed_durations() {
        let error = Config::from_vars(vars(&[
            ("SURREAL_URL", "mem://"),
            ("YOUTUBE_API_KEYS", "key"),
            ("INGEST_INTERVAL", "soon"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("INGEST_"), "{error}");
    }
}
