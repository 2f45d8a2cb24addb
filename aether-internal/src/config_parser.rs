use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, ErrorDetails};
use crate::insight::InsightCategory;
use crate::tier::TierPolicy;

/// Top-level gateway configuration, loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tiers: TierPolicy,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub cooldowns: CooldownsConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Failed to read config file `{}`: {e}",
                    path.to_string_lossy()
                ),
            })
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Failed to parse config file `{}`: {e}",
                    path.to_string_lossy()
                ),
            })
        })?;
        config.verify()?;
        Ok(config)
    }

    fn verify(&self) -> Result<(), Error> {
        if self.usage.response_period_days == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "usage.response_period_days must be at least 1".to_string(),
            }));
        }
        if self.cooldowns.default_minutes == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "cooldowns.default_minutes must be at least 1".to_string(),
            }));
        }
        if self.generator.attempt_timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "generator.attempt_timeout_ms must be at least 1".to_string(),
            }));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfig {
    /// Socket address to bind to; defaults to 0.0.0.0:3000 when unset
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

/// Usage counter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    /// Length of the rolling window for general responses, in days
    #[serde(default = "default_response_period_days")]
    pub response_period_days: u32,

    /// Epoch the rolling window is anchored to. Shared by all instances, so
    /// every process computes identical bucket boundaries.
    #[serde(default = "default_epoch")]
    pub epoch: NaiveDate,

    /// TTL for cached usage snapshots (read path only), in milliseconds
    #[serde(default = "default_usage_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Maximum number of entries in the usage snapshot cache
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Whether to allow (true) or deny (false) consumption when the store
    /// is unreachable. Denying is the safe default: failing open would let
    /// requests bypass quota during an outage.
    #[serde(default)]
    pub fail_open: bool,
}

fn default_response_period_days() -> u32 {
    14
}

fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn default_usage_cache_ttl_ms() -> u64 {
    2000
}

fn default_max_cache_size() -> u64 {
    10_000
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            response_period_days: default_response_period_days(),
            epoch: default_epoch(),
            cache_ttl_ms: default_usage_cache_ttl_ms(),
            max_cache_size: default_max_cache_size(),
            fail_open: false,
        }
    }
}

/// Insight cooldown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CooldownsConfig {
    /// Cooldown applied to every category without an override, in minutes
    #[serde(default = "default_cooldown_minutes")]
    pub default_minutes: u64,

    /// Per-category overrides, in minutes
    #[serde(default)]
    pub per_category: HashMap<InsightCategory, u64>,
}

fn default_cooldown_minutes() -> u64 {
    30
}

impl Default for CooldownsConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_cooldown_minutes(),
            per_category: HashMap::new(),
        }
    }
}

impl CooldownsConfig {
    pub fn duration_for(&self, category: InsightCategory) -> Duration {
        let minutes = self
            .per_category
            .get(&category)
            .copied()
            .unwrap_or(self.default_minutes);
        Duration::minutes(minutes as i64)
    }
}

/// Insight generator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// Base URL of the chat-completions API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Deadline for a single generation attempt, in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff delay, doubled per retry, in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_api_base() -> String {
    "https://openrouter.ai/api/v1/".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> usize {
    2
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    256
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Redis configuration. When `url` is unset the gateway runs on in-memory
/// stores, which is only suitable for a single instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,

    /// Timeout for individual Redis operations, in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_timeout_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.usage.response_period_days, 14);
        assert_eq!(
            config.usage.epoch,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
        assert!(!config.usage.fail_open);
        assert_eq!(config.cooldowns.default_minutes, 30);
        assert_eq!(config.generator.max_retries, 2);
        assert!(config.redis.url.is_none());
    }

    #[test]
    fn test_cooldown_override() {
        let config: CooldownsConfig = toml::from_str(
            r#"
            default_minutes = 30

            [per_category]
            personality = 60
            "#,
        )
        .unwrap();
        assert_eq!(
            config.duration_for(InsightCategory::Personality),
            Duration::minutes(60)
        );
        assert_eq!(
            config.duration_for(InsightCategory::Communication),
            Duration::minutes(30)
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [gateway]
            bind_address = "127.0.0.1:8080"

            [tiers.standard]
            responses_per_period = 100
            premium_calls_per_month = 5

            [usage]
            response_period_days = 7
            epoch = "2024-06-01"

            [generator]
            model = "anthropic/claude-3-haiku"
            max_retries = 3

            [redis]
            url = "redis://localhost:6379"
            "#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(
            config.gateway.bind_address,
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(config.tiers.standard.responses_per_period, Some(100));
        assert_eq!(config.usage.response_period_days, 7);
        assert_eq!(config.generator.model, "anthropic/claude-3-haiku");
        assert_eq!(config.redis.url.as_deref(), Some("redis://localhost:6379"));
        // Unconfigured sections keep their defaults
        assert_eq!(config.cooldowns.default_minutes, 30);
    }

    #[test]
    fn test_invalid_period_length_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [usage]
            response_period_days = 0
            "#
        )
        .unwrap();

        assert!(Config::load_from_path(file.path()).is_err());
    }
}
