//! Manager configuration.

use conveyor_redis::RedisConfig;
use std::env;
use std::fmt;
use std::sync::Arc;

use crate::backend::QueueBackend;
use crate::error::{QueueError, QueueResult};
use crate::job::{Backoff, BackoffKind, JobOptions};

/// Default key prefix for queues and workers.
pub const DEFAULT_PREFIX: &str = "conveyor";

/// Where the shared connection comes from.
#[derive(Clone)]
pub enum ConnectionSource {
    /// Duplicate a handle the caller already owns.
    Existing(Arc<dyn QueueBackend>),
    /// Open a new Redis connection.
    Redis(RedisConfig),
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSource::Existing(backend) => {
                f.debug_tuple("Existing").field(&backend.kind()).finish()
            }
            ConnectionSource::Redis(config) => f.debug_tuple("Redis").field(&config.url).finish(),
        }
    }
}

impl From<RedisConfig> for ConnectionSource {
    fn from(config: RedisConfig) -> Self {
        ConnectionSource::Redis(config)
    }
}

impl From<Arc<dyn QueueBackend>> for ConnectionSource {
    fn from(backend: Arc<dyn QueueBackend>) -> Self {
        ConnectionSource::Existing(backend)
    }
}

/// Queue manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Shared connection source; required.
    pub connection: Option<ConnectionSource>,

    /// Key prefix applied to queues and workers created without one.
    pub prefix: String,

    /// Options every submission starts from.
    pub default_job_options: JobOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connection: None,
            prefix: DEFAULT_PREFIX.to_string(),
            default_job_options: JobOptions::default(),
        }
    }
}

impl ManagerConfig {
    /// Configuration using `connection`.
    pub fn new(connection: impl Into<ConnectionSource>) -> Self {
        Self {
            connection: Some(connection.into()),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `CONVEYOR_PREFIX`, `CONVEYOR_DEFAULT_ATTEMPTS`,
    /// `CONVEYOR_DEFAULT_BACKOFF` (`fixed` or `exponential`) and
    /// `CONVEYOR_DEFAULT_BACKOFF_DELAY_MS`; the connection comes from
    /// [`RedisConfig::from_env`].
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::new(RedisConfig::from_env().build());

        if let Ok(prefix) = env::var("CONVEYOR_PREFIX") {
            config.prefix = prefix;
        }

        if let Ok(attempts) = env::var("CONVEYOR_DEFAULT_ATTEMPTS") {
            let attempts = attempts.parse().map_err(|_| {
                QueueError::Config(format!("invalid CONVEYOR_DEFAULT_ATTEMPTS: {}", attempts))
            })?;
            config.default_job_options.attempts = Some(attempts);
        }

        if let Ok(kind) = env::var("CONVEYOR_DEFAULT_BACKOFF") {
            let kind = match kind.to_lowercase().as_str() {
                "fixed" => BackoffKind::Fixed,
                "exponential" => BackoffKind::Exponential,
                other => {
                    return Err(QueueError::Config(format!(
                        "invalid CONVEYOR_DEFAULT_BACKOFF: {}",
                        other
                    )));
                }
            };
            let delay = match env::var("CONVEYOR_DEFAULT_BACKOFF_DELAY_MS") {
                Ok(delay) => delay.parse().map_err(|_| {
                    QueueError::Config(format!(
                        "invalid CONVEYOR_DEFAULT_BACKOFF_DELAY_MS: {}",
                        delay
                    ))
                })?,
                Err(_) => 1000,
            };
            config.default_job_options.backoff = Some(Backoff { kind, delay });
        }

        Ok(config)
    }

    /// Check the configuration before a manager is built from it.
    pub fn validate(&self) -> QueueResult<()> {
        if self.connection.is_none() {
            return Err(QueueError::Config(
                "a connection or connection parameters are required".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(QueueError::Config("prefix must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    connection: Option<ConnectionSource>,
    prefix: Option<String>,
    default_job_options: Option<JobOptions>,
}

impl ManagerConfigBuilder {
    /// Duplicate an existing engine handle.
    pub fn connection(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.connection = Some(ConnectionSource::Existing(backend));
        self
    }

    /// Open a Redis connection.
    pub fn redis(mut self, config: RedisConfig) -> Self {
        self.connection = Some(ConnectionSource::Redis(config));
        self
    }

    /// Set the key prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the default job options.
    pub fn default_job_options(mut self, options: JobOptions) -> Self {
        self.default_job_options = Some(options);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            connection: self.connection,
            prefix: self.prefix.unwrap_or(defaults.prefix),
            default_job_options: self
                .default_job_options
                .unwrap_or(defaults.default_job_options),
        }
    }
}
