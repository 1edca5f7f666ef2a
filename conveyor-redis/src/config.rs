//! Redis connection configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::{RedisError, Result};

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Connection timeout.
    #[serde(with = "secs", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Database number (0-15).
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Use TLS.
    #[serde(default)]
    pub tls: bool,
    /// Connection name (for CLIENT SETNAME).
    pub connection_name: Option<String>,
    /// Reconnect attempts per command before an error is surfaced.
    /// `None` retries forever.
    #[serde(default)]
    pub max_retries: Option<usize>,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: default_connection_timeout(),
            database: None,
            username: None,
            password: None,
            tls: false,
            connection_name: None,
            max_retries: None,
        }
    }
}

impl RedisConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        let mut builder = RedisConfigBuilder::new();

        if let Ok(url) = std::env::var("REDIS_URL") {
            builder = builder.url(url);
        }

        if let Ok(db) = std::env::var("REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Ok(username) = std::env::var("REDIS_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            builder = builder.password(password);
        }

        if let Ok(name) = std::env::var("REDIS_CONNECTION_NAME") {
            builder = builder.connection_name(name);
        }

        if std::env::var("REDIS_TLS").is_ok() {
            builder = builder.tls(true);
        }

        builder
    }

    /// Get the full Redis URL with auth and database applied.
    pub fn connection_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| RedisError::Config(format!("invalid Redis URL '{}': {}", self.url, e)))?;

        if let Some(password) = &self.password {
            if let Some(username) = &self.username {
                url.set_username(username)
                    .map_err(|_| RedisError::Config("URL cannot carry a username".to_string()))?;
            }
            url.set_password(Some(password))
                .map_err(|_| RedisError::Config("URL cannot carry a password".to_string()))?;
        }

        // An explicit database in the URL path wins over the config field.
        if let Some(db) = self.database
            && url.path().trim_start_matches('/').is_empty()
        {
            url.set_path(&format!("/{}", db));
        }

        Ok(url.to_string())
    }
}

/// Builder for Redis configuration.
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        if self.config.tls && self.config.url.starts_with("redis://") {
            self.config.url = self.config.url.replacen("redis://", "rediss://", 1);
        }
        self
    }

    /// Point at a host and port instead of a full URL.
    pub fn host(self, host: &str, port: u16) -> Self {
        let scheme = if self.config.tls { "rediss" } else { "redis" };
        self.url(format!("{}://{}:{}", scheme, host, port))
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Enable TLS.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        if enabled && self.config.url.starts_with("redis://") {
            self.config.url = self.config.url.replacen("redis://", "rediss://", 1);
        }
        self
    }

    /// Set the connection name.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection_name = Some(name.into());
        self
    }

    /// Limit reconnect attempts per command.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = Some(retries);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
