//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

use lifetrack_common::{Domain, Error, Result};

use crate::breaker::BreakerConfig;
use crate::conflict::ConflictStrategy;
use crate::queue::QueueConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::state::StalenessThresholds;

/// Environment variable overriding [`SyncConfig::base_url`].
pub const BASE_URL_ENV: &str = "LIFETRACK_BASE_URL";

/// Environment variable overriding [`SyncConfig::api_key`].
pub const API_KEY_ENV: &str = "LIFETRACK_API_KEY";

/// Configuration for the sync engine.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backend base URL.
    pub base_url: String,
    /// Static API credential, sent as `X-API-Key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-attempt request timeout.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub staleness: StalenessThresholds,
    pub conflict_strategy: ConflictStrategy,
    /// Fields whose local value survives a merge under
    /// [`ConflictStrategy::MergeFields`].
    pub client_owned_fields: Vec<String>,
    /// Domain syncs allowed in flight at once during a sync-all.
    pub max_concurrent_syncs: usize,
    /// Longest a caller waits for a bounded sync-all.
    pub sync_all_timeout: Duration,
    /// Read endpoint overrides per domain.
    pub endpoints: BTreeMap<Domain, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::new(3),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            queue: QueueConfig::default(),
            staleness: StalenessThresholds::default(),
            conflict_strategy: ConflictStrategy::ServerWins,
            client_owned_fields: Vec::new(),
            max_concurrent_syncs: 4,
            sync_all_timeout: Duration::from_secs(20),
            endpoints: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Load a JSON config file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&text).map_err(|e| {
            Error::Serialization(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Override the base URL and API key from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Override the base URL and API key from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            debug!("Base URL overridden from {}", BASE_URL_ENV);
            self.base_url = url.trim().to_string();
        }
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.api_key = Some(key);
        }
    }

    /// Read endpoint for `domain`.
    pub fn endpoint_for(&self, domain: Domain) -> String {
        self.endpoints
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| domain.default_endpoint())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", self.base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "Base URL must be http or https: {}",
                self.base_url
            )));
        }

        let positive = [
            ("retry.max_attempts", self.retry.max_attempts as usize),
            ("breaker.failure_threshold", self.breaker.failure_threshold as usize),
            ("breaker.success_threshold", self.breaker.success_threshold as usize),
            ("rate_limit.burst", self.rate_limit.burst as usize),
            ("queue.max_retries", self.queue.max_retries as usize),
            ("max_concurrent_syncs", self.max_concurrent_syncs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidInput(format!("{} must be greater than zero", name)));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::InvalidInput("request_timeout must be non-zero".to_string()));
        }
        if self.staleness.fresh > self.staleness.aging {
            return Err(Error::InvalidInput(
                "staleness.fresh must not exceed staleness.aging".to_string(),
            ));
        }
        if let Some((domain, path)) = self.endpoints.iter().find(|(_, p)| !p.starts_with('/')) {
            return Err(Error::InvalidInput(format!(
                "Endpoint for {} must start with '/': {}",
                domain, path
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"base_url": "https://api.example.com", "endpoints": {{"finance": "/api/v2/finance"}}}}"#
        )
        .unwrap();

        let config = SyncConfig::load(file.path()).unwrap();

        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.endpoint_for(Domain::Finance), "/api/v2/finance");
        assert_eq!(config.endpoint_for(Domain::Health), "/api/v1/health");
        assert_eq!(config.max_concurrent_syncs, 4);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = SyncConfig::load("/nonexistent/lifetrack.json");
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = SyncConfig::default();
        config.apply_overrides(|name| match name {
            BASE_URL_ENV => Some(" https://staging.example.com ".to_string()),
            API_KEY_ENV => Some("secret".to_string()),
            _ => None,
        });

        assert_eq!(config.base_url, "https://staging.example.com");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_url = SyncConfig {
            base_url: "ftp://example.com".to_string(),
            ..SyncConfig::default()
        };
        assert!(bad_url.validate().is_err());

        let mut zero_threshold = SyncConfig::default();
        zero_threshold.breaker.failure_threshold = 0;
        assert!(zero_threshold.validate().is_err());

        let mut bad_endpoint = SyncConfig::default();
        bad_endpoint
            .endpoints
            .insert(Domain::Calendar, "calendar".to_string());
        assert!(bad_endpoint.validate().is_err());
    }
}
