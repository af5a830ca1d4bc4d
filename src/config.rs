//! Service configuration, loaded from TOML.
//! Every field has a default so a missing file or a partial file is fine.
//! The Claude API key is never stored here; it comes from `ANTHROPIC_API_KEY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Environment variable holding the Claude API key.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub throttle: ThrottleConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub translation: TranslationConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

/// Claude Messages API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub anthropic_version: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".into(),
            model: "claude-3-5-haiku-latest".into(),
            max_tokens: 4096,
            timeout_secs: 60,
            anthropic_version: "2023-06-01".into(),
        }
    }
}

/// Sliding-window limit on outbound API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_calls: usize,
    pub period_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_calls: 50,
            period_secs: 60,
        }
    }
}

impl ThrottleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Per-call retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Wait before retry number `attempt`. A server hint replaces the
    /// backoff but never exceeds `max_backoff_ms`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(Duration::from_millis(self.max_backoff_ms)),
            None => self.backoff(attempt),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub default_max_attempts: u32,
    pub retry_delay_secs: u64,
    pub default_priority: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            batch_size: 2,
            default_max_attempts: 3,
            retry_delay_secs: 60,
            default_priority: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Languages used when a request names none.
    pub target_languages: Vec<String>,
    /// Fallback source language when a post carries none.
    pub source_language: Option<String>,
    /// Status given to newly created translated posts.
    pub publish_status: String,
    pub glossary_path: Option<PathBuf>,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    /// How long finished progress records stay pollable.
    pub progress_ttl_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_languages: vec!["fr".into(), "de".into(), "es".into()],
            source_language: None,
            publish_status: "draft".into(),
            glossary_path: None,
            cache_capacity: 1024,
            cache_ttl_secs: 3600,
            progress_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Log entries older than this are pruned when the server starts; 0 keeps everything.
    pub log_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("polyglot-press.db"),
            log_retention_days: 90,
        }
    }
}

impl Config {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            info!(path = %path.display(), "config loaded");
            config
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.throttle.max_calls == 0 {
            return Err(ConfigError::Invalid("throttle.max_calls must be > 0".into()));
        }
        if self.throttle.period_secs == 0 {
            return Err(ConfigError::Invalid("throttle.period_secs must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.queue.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue.default_max_attempts must be > 0".into(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be > 0".into()));
        }
        if !(1..=9).contains(&self.queue.default_priority) {
            return Err(ConfigError::Invalid(
                "queue.default_priority must be between 1 and 9".into(),
            ));
        }
        if self.translation.target_languages.is_empty() {
            return Err(ConfigError::Invalid(
                "translation.target_languages must not be empty".into(),
            ));
        }
        if self.translation.cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "translation.cache_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [throttle]
            max_calls = 5

            [translation]
            target_languages = ["ja"]
            "#,
        )
        .unwrap();
        assert_eq!(config.throttle.max_calls, 5);
        assert_eq!(config.throttle.period_secs, 60);
        assert_eq!(config.translation.target_languages, vec!["ja".to_string()]);
        assert_eq!(config.queue.batch_size, 2);
    }

    #[test]
    fn test_rejects_bad_priority() {
        let mut config = Config::default();
        config.queue.default_priority = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_empty_languages() {
        let mut config = Config::default();
        config.translation.target_languages.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_server_hint_is_capped() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
        };
        assert_eq!(
            retry.delay_for(1, Some(Duration::from_millis(2_000))),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            retry.delay_for(1, Some(Duration::from_millis(u64::MAX))),
            Duration::from_millis(5_000)
        );
        assert_eq!(retry.delay_for(2, None), Duration::from_millis(200));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8787");
    }

    #[test]
    fn test_round_trips_through_toml() {
        let text = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.api.model, Config::default().api.model);
    }
}
