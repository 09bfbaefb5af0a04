//! Configuration settings loaded from environment variables
//!
//! [`QueueSettings`] turns a handful of `QUEUE_*` variables into a
//! [`DriverConfig`] and a [`WorkerConfig`], so a deployment can pick its
//! backend without code changes.
//!
//! | variable | default |
//! |----------|---------|
//! | `QUEUE_DRIVER` | `memory` (`memory`, `file`, `sync`, `redis`) |
//! | `QUEUE_FILE_PATH` | required for `file` |
//! | `QUEUE_DLQ_PATH` | `$QUEUE_FILE_PATH/dead` |
//! | `QUEUE_MAX_JOBS` | `10000` (`0` = unlimited) |
//! | `REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `QUEUE_REDIS_PREFIX` | `jobwell` |
//! | `QUEUE_NAME` | `default` |
//! | `QUEUE_VISIBILITY_TIMEOUT_SECS` | `60` |
//! | `QUEUE_POLL_INTERVAL_MS` | `1000` |
//! | `QUEUE_LOG_LEVEL` | `info` |

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::config::{DriverConfig, FileConfig, MemoryConfig};
use crate::error::{QueueError, Result};
use crate::processing::WorkerConfig;

/// Queue settings loaded from environment variables
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Storage backend
    pub driver: DriverConfig,
    /// Worker loop settings
    pub worker: WorkerConfig,
    /// Log level passed to [`init_tracing`](crate::telemetry::init_tracing)
    pub log_level: String,
}

impl QueueSettings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from the process environment, falling back to a `.env`
    /// file in the working directory for unset variables.
    pub fn from_env_with_dotenv() -> Result<Self> {
        let file_values = load_dotenv(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok().or_else(|| file_values.get(key).cloned()))
    }

    /// Load settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Helper function to get env var with a default
        let get_or = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        // Helper function to parse numeric env var
        fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| QueueError::ConfigurationError {
                message: format!("Invalid numeric value for {}: {}", key, value),
            })
        }

        let driver_name = get_or("QUEUE_DRIVER", "memory").to_lowercase();
        let driver = match driver_name.as_str() {
            "memory" => {
                let max_jobs: usize =
                    parse_num("QUEUE_MAX_JOBS", &get_or("QUEUE_MAX_JOBS", "10000"))?;
                let config = if max_jobs == 0 {
                    MemoryConfig::new().unlimited()
                } else {
                    MemoryConfig::new().with_max_jobs(max_jobs)
                };
                DriverConfig::Memory(config)
            }
            "file" => {
                let path = lookup("QUEUE_FILE_PATH")
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| QueueError::ConfigurationError {
                        message: "QUEUE_FILE_PATH must be set for the file driver".to_string(),
                    })?;
                let mut config = FileConfig::new(path.trim());
                if let Some(dlq) = lookup("QUEUE_DLQ_PATH").filter(|v| !v.trim().is_empty()) {
                    config = config.with_dead_letter_path(dlq.trim());
                }
                DriverConfig::File(config)
            }
            "sync" => DriverConfig::Sync,
            #[cfg(feature = "redis")]
            "redis" => {
                let config = super::config::RedisConfig::new()
                    .with_url(get_or("REDIS_URL", "redis://127.0.0.1:6379"))
                    .with_key_prefix(get_or("QUEUE_REDIS_PREFIX", "jobwell"));
                DriverConfig::Redis(config)
            }
            #[cfg(not(feature = "redis"))]
            "redis" => {
                return Err(QueueError::ConfigurationError {
                    message: "QUEUE_DRIVER=redis requires the `redis` feature".to_string(),
                });
            }
            other => {
                return Err(QueueError::ConfigurationError {
                    message: format!("Unknown QUEUE_DRIVER: {}", other),
                });
            }
        };

        let visibility_secs: u64 = parse_num(
            "QUEUE_VISIBILITY_TIMEOUT_SECS",
            &get_or("QUEUE_VISIBILITY_TIMEOUT_SECS", "60"),
        )?;
        if visibility_secs == 0 {
            return Err(QueueError::ConfigurationError {
                message: "QUEUE_VISIBILITY_TIMEOUT_SECS must be greater than zero".to_string(),
            });
        }
        let poll_ms: u64 = parse_num(
            "QUEUE_POLL_INTERVAL_MS",
            &get_or("QUEUE_POLL_INTERVAL_MS", "1000"),
        )?;

        let worker = WorkerConfig::default()
            .queue(get_or("QUEUE_NAME", "default"))
            .visibility_timeout(Duration::from_secs(visibility_secs))
            .poll_interval(Duration::from_millis(poll_ms));

        Ok(QueueSettings {
            driver,
            worker,
            log_level: get_or("QUEUE_LOG_LEVEL", "info"),
        })
    }
}

/// Read KEY=VALUE pairs from a dotenv file; a missing file yields nothing.
fn load_dotenv(path: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return values;
    };

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();

            // Remove quotes if present
            let value = if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                &value[1..value.len() - 1]
            } else {
                value
            };

            values.insert(key.trim().to_string(), value.to_string());
        }
    }
    values
}
