//! # Conveyor Redis
//!
//! The Redis transport shared by a Conveyor queue manager.
//!
//! ## Features
//!
//! - **Lazy connection**: nothing is dialed until the first command
//! - **Duplication**: independent handles to the same server, each with
//!   its own open/closed lifecycle
//! - **Reconnects**: backed by [`redis::aio::ConnectionManager`]
//! - **Environment config**: `REDIS_URL`, `REDIS_PASSWORD`, ...
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor_redis::{RedisConfig, SharedConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .host("localhost", 6379)
//!         .database(1)
//!         .build();
//!
//!     let conn = SharedConnection::new(&config)?;
//!     conn.health_check().await?;
//!
//!     let mut redis = conn.get().await?;
//!     let _: () = redis::cmd("SET").arg("key").arg("value").query_async(&mut redis).await?;
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use connection::SharedConnection;
pub use error::{RedisError, Result};

// Re-export redis crate for convenience
pub use redis;
pub use redis::AsyncCommands;

/// Prelude for common imports.
///
/// ```
/// use conveyor_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::connection::SharedConnection;
    pub use crate::error::{RedisError, Result};
    pub use redis::AsyncCommands;
}
