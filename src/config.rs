//! Configuration loading.
//!
//! Configuration is read once at startup from TOML with the following
//! resolution order:
//! 1. explicit path (`--config <path>`)
//! 2. `~/.resilio/config.toml` (user)
//! 3. `/etc/resilio/config.toml` (system)
//!
//! Every section and field is optional; missing values take the dashboard
//! defaults. A `[rate_limit.routes]` table replaces the default route table
//! rather than merging into it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::pool::PoolConfig;
use crate::ratelimit::RateLimitConfig;
use crate::retry::{CallKind, RetryPolicy};
use crate::{ResilioError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfigs,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

/// Retry presets per call kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfigs {
    #[serde(default = "RetryPolicy::ai")]
    pub ai: RetryPolicy,
    #[serde(default = "RetryPolicy::database")]
    pub database: RetryPolicy,
    #[serde(default)]
    pub default: RetryPolicy,
}

impl Default for RetryConfigs {
    fn default() -> Self {
        Self {
            ai: RetryPolicy::ai(),
            database: RetryPolicy::database(),
            default: RetryPolicy::default(),
        }
    }
}

impl RetryConfigs {
    pub fn policy(&self, kind: CallKind) -> &RetryPolicy {
        match kind {
            CallKind::Ai => &self.ai,
            CallKind::Database => &self.database,
            CallKind::Default => &self.default,
        }
    }
}

/// External AI service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-request timeout (default: 60).
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key (default: `RESILIO_API_KEY`).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_inference_timeout(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key from the configured environment variable, if set.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }
}

fn default_inference_timeout() -> u64 {
    60
}

fn default_api_key_env() -> String {
    "RESILIO_API_KEY".to_string()
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.resilio/config.toml`
    /// 3. `/etc/resilio/config.toml`
    ///
    /// The loaded configuration is validated.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?
            .ok_or_else(|| {
                ResilioError::Configuration(
                    "No config file found. Create ~/.resilio/config.toml or /etc/resilio/config.toml"
                        .to_string(),
                )
            })?;
        Self::load_from_file(&path)
    }

    /// Like [`load`](Self::load), but falls back to the defaults when no
    /// file exists in any standard location. An explicit path that does not
    /// exist is still an error.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => {
                tracing::debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ResilioError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ResilioError::Configuration(format!("Failed to render config: {e}")))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ResilioError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            ResilioError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the config file path. `Ok(None)` when no standard location
    /// has a file.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(ResilioError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".resilio").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/resilio/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ResilioError::Configuration(msg));

        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be at least 1".into());
        }
        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs must be at least 1".into());
        }
        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1".into());
        }
        if self.pool.min_idle > self.pool.max_size {
            return invalid(format!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.pool.min_idle, self.pool.max_size
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs must be at least 1".into());
        }
        if self.rate_limit.global_limit == Some(0) || self.rate_limit.default_limit == Some(0) {
            return invalid("rate limits must be at least 1".into());
        }
        if self.rate_limit.max_tracked_windows == 0 {
            return invalid("rate_limit.max_tracked_windows must be at least 1".into());
        }
        if let Some((route, _)) = self.rate_limit.routes.iter().find(|(_, limit)| **limit == 0) {
            return invalid(format!("rate_limit.routes.\"{route}\" must be at least 1"));
        }
        for kind in [CallKind::Ai, CallKind::Database, CallKind::Default] {
            let policy = self.retry.policy(kind);
            let name = kind.as_str();
            if policy.max_attempts == 0 {
                return invalid(format!("retry.{name}.max_attempts must be at least 1"));
            }
            if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
                return invalid(format!("retry.{name}.backoff_multiplier must be >= 1.0"));
            }
            if policy.max_delay_ms < policy.base_delay_ms {
                return invalid(format!(
                    "retry.{name}.max_delay_ms is below base_delay_ms"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.retry.database.max_attempts, 3);
        assert_eq!(config.inference.timeout_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [cache]
            ttl_secs = 5
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.cache.ttl_secs, 5);
        // Defaults preserved
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.retry.ai, RetryPolicy::ai());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [cache]
            ttl_secs = 600
            max_entries = 500
            sweep_interval_secs = 0

            [pool]
            min_idle = 2
            max_size = 20
            acquire_timeout_ms = 250

            [rate_limit]
            window_secs = 30
            default_limit = 100

            [rate_limit.routes]
            "/analisar_logs" = 5

            [retry.ai]
            max_attempts = 4
            base_delay_ms = 100
            backoff_multiplier = 3.0
            max_delay_ms = 2000
            jitter = false

            [inference]
            base_url = "http://localhost:8080"
            timeout_secs = 10

            [logging]
            level = "debug"
            format = "json"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.cache.sweep_interval_duration(), None);
        assert_eq!(config.pool.acquire_timeout_duration(), Duration::from_millis(250));
        assert_eq!(config.rate_limit.routes.len(), 1);
        assert_eq!(config.rate_limit.default_limit, Some(100));
        assert_eq!(config.retry.ai.max_attempts, 4);
        assert!(!config.retry.ai.jitter);
        assert_eq!(config.retry.database, RetryPolicy::database());
        assert_eq!(
            config.inference.base_url.as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn rejects_invalid_values() {
        for toml in [
            "[cache]\nmax_entries = 0",
            "[pool]\nmin_idle = 5\nmax_size = 2",
            "[rate_limit]\nwindow_secs = 0",
            "[rate_limit.routes]\n\"/\" = 0",
            "[rate_limit]\nmax_tracked_windows = 0",
            "[retry.database]\nmax_attempts = 0",
            "[retry.ai]\nbackoff_multiplier = 0.5",
            "[retry.default]\nbase_delay_ms = 2000\nmax_delay_ms = 100",
        ] {
            let err = Config::from_toml_str(toml).unwrap_err();
            assert!(
                matches!(err, ResilioError::Configuration(_)),
                "{toml}: {err}"
            );
        }
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Config file not found"));

        let result = Config::load_or_default(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn defaults_render_and_parse_back() {
        let rendered = Config::default().to_toml_string().unwrap();
        assert!(rendered.contains("[rate_limit.routes]"));
        let parsed = Config::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
