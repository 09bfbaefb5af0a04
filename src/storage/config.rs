use serde::{Deserialize, Serialize};
use std::path::PathBuf;
#[cfg(feature = "redis")]
use std::time::Duration;

/// Configuration for storage drivers
///
/// ```rust
/// use jobwell::storage::DriverConfig;
///
/// let config: DriverConfig =
///     serde_json::from_str(r#"{"driver": "file", "path": "/tmp/jobs"}"#).unwrap();
/// assert_eq!(config.name(), "file");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DriverConfig {
    /// In-process memory driver
    Memory(MemoryConfig),
    /// JSON Lines file driver
    File(FileConfig),
    /// Inline execution, nothing is stored
    Sync,
    /// Redis driver
    #[cfg(feature = "redis")]
    Redis(RedisConfig),
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl DriverConfig {
    /// Name the driver registers under
    pub fn name(&self) -> &'static str {
        match self {
            DriverConfig::Memory(_) => "memory",
            DriverConfig::File(_) => "file",
            DriverConfig::Sync => "sync",
            #[cfg(feature = "redis")]
            DriverConfig::Redis(_) => "redis",
        }
    }
}

/// Configuration for the memory driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of pending and reserved jobs held at once
    pub max_jobs: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_jobs: Some(10_000),
        }
    }
}

impl MemoryConfig {
    /// Create a new memory config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of jobs to keep in memory
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    /// Disable job limit (unlimited jobs in memory)
    pub fn unlimited(mut self) -> Self {
        self.max_jobs = None;
        self
    }
}

/// Configuration for the file driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Directory holding one `<queue>.jsonl` file per queue
    pub path: PathBuf,
    /// Directory for dead-letter files (default: `<path>/dead`)
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,
}

impl FileConfig {
    /// Create a file config rooted at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dead_letter_path: None,
        }
    }

    /// Store dead-letter entries in a separate directory
    pub fn with_dead_letter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letter_path = Some(path.into());
        self
    }

    /// Resolved dead-letter directory
    pub fn dead_letter_dir(&self) -> PathBuf {
        self.dead_letter_path
            .clone()
            .unwrap_or_else(|| self.path.join("dead"))
    }
}

/// Configuration for the Redis driver
#[cfg(feature = "redis")]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://localhost:6379)
    pub url: String,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Command timeout
    pub command_timeout: Duration,
    /// Key prefix for all queue keys
    pub key_prefix: String,
    /// Database number (0-15 for standard Redis)
    pub database: Option<u8>,
    /// Username for authentication (Redis 6.0+)
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
}

#[cfg(feature = "redis")]
impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            key_prefix: "jobwell".to_string(),
            database: None,
            username: std::env::var("REDIS_USERNAME")
                .ok()
                .filter(|s| !s.is_empty()),
            password: std::env::var("REDIS_PASSWORD")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

#[cfg(feature = "redis")]
impl RedisConfig {
    /// Create a new Redis config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Redis connection URL
    pub fn with_url<S: Into<String>>(mut self, url: S) -> Self {
        self.url = url.into();
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the key prefix
    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the Redis database number
    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Set authentication credentials
    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set password for authentication (username will be empty)
    pub fn with_password<P: Into<String>>(mut self, password: P) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Generate the full Redis URL including credentials and database
    pub fn full_url(&self) -> String {
        let mut url = self.url.clone();

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            url = url.replace("redis://", &format!("redis://{}:{}@", username, password));
        } else if let Some(password) = &self.password {
            url = url.replace("redis://", &format!("redis://:{}@", password));
        }

        if let Some(db) = self.database {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(&db.to_string());
        }

        url
    }
}
