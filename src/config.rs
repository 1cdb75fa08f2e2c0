//! Application configuration
//!
//! One flat YAML document; every field is optional and falls back to the
//! component defaults. Command-line flags and environment variables are
//! applied on top by the binary.
//!
//! ```yaml
//! api_base_url: http://localhost:8000/api
//! api_timeout_ms: 10000
//! queue_sync_interval_ms: 10000
//! visit_rate_limit_ms: 30000
//! state_dir: /var/lib/pagetrail
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::RemoteConfig;
use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::history::MergerConfig;
use crate::limiter::RateLimiterConfig;
use crate::observer::ObserverConfig;
use crate::router::RouterConfig;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_timeout_ms: u64,
    pub queue_sync_interval_ms: u64,
    pub visit_rate_limit_ms: u64,
    pub rate_limit_cleanup_ms: u64,
    pub request_timeout_ms: u64,
    pub history_page_size: u32,
    pub state_dir: PathBuf,
    pub metrics_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            api_timeout_ms: 10_000,
            queue_sync_interval_ms: 10_000,
            visit_rate_limit_ms: 30_000,
            rate_limit_cleanup_ms: 60_000,
            request_timeout_ms: 5_000,
            history_page_size: 10,
            state_dir: PathBuf::from(".pagetrail"),
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(Error::Config("api_base_url must not be empty".into()));
        }
        if self.queue_sync_interval_ms == 0 || self.rate_limit_cleanup_ms == 0 {
            return Err(Error::Config("timer intervals must be positive".into()));
        }
        if self.history_page_size == 0 {
            return Err(Error::Config("history_page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn remote(&self) -> RemoteConfig {
        RemoteConfig {
            api_base_url: self.api_base_url.clone(),
            timeout: Duration::from_millis(self.api_timeout_ms),
        }
    }

    pub fn limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            window: Duration::from_millis(self.visit_rate_limit_ms),
            cleanup_interval: Duration::from_millis(self.rate_limit_cleanup_ms),
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_millis(self.queue_sync_interval_ms),
        }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..Default::default()
        }
    }

    pub fn merger(&self) -> MergerConfig {
        MergerConfig {
            page_size: self.history_page_size,
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
    }

    pub fn observer(&self) -> ObserverConfig {
        ObserverConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_match_components() {
        let config = AppConfig::default();

        assert_eq!(config.remote().timeout, RemoteConfig::default().timeout);
        assert_eq!(config.limiter().window, RateLimiterConfig::default().window);
        assert_eq!(config.sync().interval, SyncConfig::default().interval);
        assert_eq!(config.merger().page_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml_str(
            "api_base_url: https://visits.example/api\nvisit_rate_limit_ms: 1000\n",
        )
        .unwrap();

        assert_eq!(config.api_base_url, "https://visits.example/api");
        assert_eq!(config.limiter().window, Duration::from_millis(1000));
        assert_eq!(config.queue_sync_interval_ms, 10_000);
    }

    #[test]
    fn test_invalid_values() {
        assert_matches!(AppConfig::from_yaml_str("api_timeout_ms: soon"), Err(Error::Config(_)));

        let config = AppConfig {
            history_page_size: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagetrail.yaml");
        tokio::fs::write(&path, "queue_sync_interval_ms: 2500\n")
            .await
            .unwrap();

        let config = AppConfig::from_yaml_file(&path).await.unwrap();
        assert_eq!(config.sync().interval, Duration::from_millis(2500));

        let missing = AppConfig::from_yaml_file(dir.path().join("nope.yaml")).await;
        assert_matches!(missing, Err(Error::Config(_)));
    }
}
