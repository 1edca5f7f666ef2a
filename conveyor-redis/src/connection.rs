//! Shared Redis connection.
//!
//! A [`SharedConnection`] is the single transport used by every queue and
//! worker of one manager. It connects lazily on first use, reconnects
//! through [`ConnectionManager`], and moves from open to closed exactly
//! once.

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{RedisConfig, RedisError, Result};

#[derive(Debug, Clone)]
struct Settings {
    url: String,
    connection_timeout: Duration,
    max_retries: Option<usize>,
    connection_name: Option<String>,
}

/// Lazily connecting, closable Redis connection.
pub struct SharedConnection {
    client: Client,
    settings: Settings,
    manager: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
}

impl SharedConnection {
    /// Build a connection from configuration.
    ///
    /// No I/O happens here; an unreachable server is reported by the first
    /// call to [`SharedConnection::get`].
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let url = config.connection_url()?;
        let client =
            Client::open(url.as_str()).map_err(|e| RedisError::Config(e.to_string()))?;

        debug!(url = %config.url, "Redis connection configured");

        Ok(Self::with_settings(
            client,
            Settings {
                url: config.url.clone(),
                connection_timeout: config.connection_timeout,
                max_retries: config.max_retries,
                connection_name: config.connection_name.clone(),
            },
        ))
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        let defaults = RedisConfig::default();
        Self::with_settings(
            client,
            Settings {
                url: "redis (external client)".to_string(),
                connection_timeout: defaults.connection_timeout,
                max_retries: None,
                connection_name: None,
            },
        )
    }

    fn with_settings(client: Client, settings: Settings) -> Self {
        Self {
            client,
            settings,
            manager: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Create an independent handle to the same server.
    ///
    /// The duplicate has its own lifecycle, so closing it leaves `self`
    /// usable, and it retries reconnects without limit.
    pub fn duplicate(&self) -> Self {
        Self::with_settings(
            self.client.clone(),
            Settings {
                max_retries: None,
                ..self.settings.clone()
            },
        )
    }

    /// The configured server URL, without credentials.
    pub fn url(&self) -> &str {
        &self.settings.url
    }

    /// Get the multiplexed connection, connecting if needed.
    pub async fn get(&self) -> Result<ConnectionManager> {
        if self.is_closed() {
            return Err(RedisError::Closed);
        }

        let mut slot = self.manager.lock().await;
        if self.is_closed() {
            return Err(RedisError::Closed);
        }
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }

        let retries = self.settings.max_retries.unwrap_or(usize::MAX);
        let config = ConnectionManagerConfig::new().set_number_of_retries(retries);

        let mut manager = tokio::time::timeout(
            self.settings.connection_timeout,
            ConnectionManager::new_with_config(self.client.clone(), config),
        )
        .await
        .map_err(|_| {
            RedisError::Connection(format!(
                "timed out connecting to {} after {:?}",
                self.settings.url, self.settings.connection_timeout
            ))
        })?
        .map_err(|e| RedisError::Connection(e.to_string()))?;

        if let Some(name) = &self.settings.connection_name {
            let set_name: redis::RedisResult<()> = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(name)
                .query_async(&mut manager)
                .await;
            if let Err(e) = set_name {
                warn!(error = %e, name = %name, "Failed to set Redis connection name");
            }
        }

        info!(url = %self.settings.url, "Redis connection established");
        *slot = Some(manager.clone());
        Ok(manager)
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Close the connection. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous = self.manager.lock().await.take();
        if previous.is_some() {
            info!(url = %self.settings.url, "Redis connection closed");
        } else {
            debug!(url = %self.settings.url, "Redis connection closed before first use");
        }
    }

    /// Whether [`SharedConnection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnection")
            .field("url", &self.settings.url)
            .field("max_retries", &self.settings.max_retries)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_does_not_connect() {
        // Nothing listens on this port; construction must still succeed.
        let config = RedisConfig::new("redis://127.0.0.1:1");
        let conn = SharedConnection::new(&config).unwrap();
        assert!(!conn.is_closed());
        assert_eq!(conn.url(), "redis://127.0.0.1:1");
    }

    #[test]
    fn test_invalid_url_fails_at_construction() {
        let config = RedisConfig::new("::nonsense::");
        assert!(matches!(
            SharedConnection::new(&config),
            Err(RedisError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_at_first_use() {
        let config = RedisConfig::builder()
            .url("redis://127.0.0.1:1")
            .connection_timeout(Duration::from_millis(200))
            .max_retries(0)
            .build();
        let conn = SharedConnection::new(&config).unwrap();

        match conn.get().await {
            Err(err) => assert!(err.is_connection_error()),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let conn = SharedConnection::new(&RedisConfig::default()).unwrap();
        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(matches!(conn.get().await, Err(RedisError::Closed)));
    }

    #[tokio::test]
    async fn test_duplicate_has_independent_lifecycle() {
        let config = RedisConfig::builder().max_retries(2).build();
        let original = SharedConnection::new(&config).unwrap();
        let duplicate = original.duplicate();

        duplicate.close().await;

        assert!(duplicate.is_closed());
        assert!(!original.is_closed());
        assert_eq!(duplicate.settings.max_retries, None);
        assert_eq!(original.settings.max_retries, Some(2));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_health_check() {
        let conn = SharedConnection::new(&RedisConfig::default()).unwrap();
        conn.health_check().await.unwrap();
        conn.close().await;
    }
}
