use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: &'static str, message: String },
}

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:147.0) Gecko/20100101 Firefox/147.0";

/// Crawler configuration loaded from a JSON file.
///
/// Every field has a default, so a partial config file only overrides the
/// keys it mentions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search term driving video discovery.
    pub keyword: String,
    /// Workers per pipeline stage.
    pub n_threads: usize,
    /// Search pages each discovery worker fetches.
    pub pages_per_thread: usize,
    /// Politeness jitter bounds, in seconds.
    pub delay_min: f64,
    pub delay_max: f64,
    /// Hydrate dedup sets and comment checkpoints from the record store.
    pub resume: bool,
    /// Re-enqueue MIDs left in `pending_mids.txt` by a previous run.
    pub resume_pending_mids: bool,
    /// Path to the credential (cookie) pool file.
    pub cookie_config_path: String,
    /// Token bucket parameters shared by every outbound request.
    pub rate_limit_rate: f64,
    pub rate_limit_capacity: f64,
    pub user_agent: String,
    /// Directory holding the emitted-ID files and comment checkpoints.
    pub record_dir: String,
    pub api_base_url: String,
    pub portal_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keyword: String::new(),
            n_threads: 3,
            pages_per_thread: 2,
            delay_min: 2.0,
            delay_max: 4.0,
            resume: true,
            resume_pending_mids: true,
            cookie_config_path: "cookies.json".to_string(),
            rate_limit_rate: 2.0,
            rate_limit_capacity: 5.0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            record_dir: "sent_records".to_string(),
            api_base_url: "https://api.bilibili.com".to_string(),
            portal_url: "https://www.bilibili.com".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, applying defaults for any
    /// missing keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would make the crawler misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_threads == 0 {
            return Err(ConfigError::InvalidValue {
                name: "n_threads",
                message: "must be at least 1".to_string(),
            });
        }
        if self.pages_per_thread == 0 {
            return Err(ConfigError::InvalidValue {
                name: "pages_per_thread",
                message: "must be at least 1".to_string(),
            });
        }
        if self.delay_min < 0.0 || self.delay_max < self.delay_min {
            return Err(ConfigError::InvalidValue {
                name: "delay_min/delay_max",
                message: format!(
                    "bounds must satisfy 0 <= delay_min <= delay_max, got {} / {}",
                    self.delay_min, self.delay_max
                ),
            });
        }
        if self.rate_limit_rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "rate_limit_rate",
                message: "must be positive".to_string(),
            });
        }
        if self.rate_limit_capacity <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "rate_limit_capacity",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Configuration suitable for tests: single worker, no jitter, a rate
    /// limit high enough to never throttle.
    pub fn for_testing() -> Self {
        Self {
            keyword: "rust".to_string(),
            n_threads: 1,
            pages_per_thread: 1,
            delay_min: 0.0,
            delay_max: 0.0,
            resume: false,
            resume_pending_mids: false,
            rate_limit_rate: 10_000.0,
            rate_limit_capacity: 10_000.0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = Config::default();
        assert_eq!(config.n_threads, 3);
        assert_eq!(config.pages_per_thread, 2);
        assert!(config.resume);
        assert!(config.resume_pending_mids);
        assert_eq!(config.cookie_config_path, "cookies.json");
        assert_eq!(config.rate_limit_rate, 2.0);
        assert_eq!(config.rate_limit_capacity, 5.0);
        assert_eq!(config.record_dir, "sent_records");
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_keys() {
        let config: Config =
            serde_json::from_str(r#"{"keyword": "cats", "n_threads": 5}"#).unwrap();
        assert_eq!(config.keyword, "cats");
        assert_eq!(config.n_threads, 5);
        assert_eq!(config.pages_per_thread, 2);
        assert_eq!(config.delay_min, 2.0);
        assert!(config.resume);
    }

    #[test]
    fn validate_rejects_zero_threads() {
        let config = Config {
            n_threads: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_delay_bounds() {
        let config = Config {
            delay_min: 5.0,
            delay_max: 1.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_positive_rate() {
        let config = Config {
            rate_limit_rate: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
