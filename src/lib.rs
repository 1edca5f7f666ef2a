// Conveyor - queue and worker orchestration for Rust
//
// This library manages named queues and workers over one shared Redis
// connection and lets job processors redirect work to other queues.

// Re-export the queue manager
pub use conveyor_queue::*;

// Re-export the Redis transport
pub use conveyor_redis;
pub use conveyor_redis::{RedisConfig, RedisConfigBuilder, RedisError, SharedConnection};

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use serde_json;

// Prelude for common imports
pub mod prelude {
    pub use conveyor_queue::prelude::*;
    pub use conveyor_redis::RedisConfig;

    pub use async_trait::async_trait;
    pub use serde_json::json;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_facade_exposes_manager() {
        let config = ManagerConfig::builder()
            .connection(Arc::new(MemoryBackend::new()))
            .build();
        let manager = QueueManager::new(config).unwrap();

        manager.create_queue("emails", None).unwrap();
        let job = manager
            .add_job("emails", json!({"to": "user@example.com"}), None)
            .await
            .unwrap();

        assert_eq!(job.id, "1");
        manager.close_all().await.unwrap();
    }
}
