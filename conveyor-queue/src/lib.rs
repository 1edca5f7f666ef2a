//! Queue and worker orchestration for Conveyor.
//!
//! Provides:
//! - 📦 Named queues and workers over one shared connection
//! - 🔁 Job redirection: a processor can defer a job onto any registered
//!   queue with a new delay
//! - ⭐ Job priorities, delays, retries with fixed or exponential backoff
//! - 📣 Lifecycle events (`queueCreated`, `workerRemoved`, ...)
//! - 🧪 An in-memory engine for tests
//!
//! ## Job Options
//!
//! ```
//! use conveyor_queue::{Backoff, JobOptions};
//!
//! let defaults = JobOptions::new()
//!     .with_attempts(3)
//!     .with_backoff(Backoff::exponential(2000));
//! let submitted = JobOptions::new().with_priority(1);
//!
//! let effective = defaults.merged_with(&submitted);
//! assert_eq!(effective.attempts, Some(3));
//! assert_eq!(effective.priority, Some(1));
//! ```
//!
//! ## Redirecting a Job
//!
//! ```
//! use conveyor_queue::{processor_fn, JobResult};
//!
//! // Run again in five seconds on the "retry-later" queue.
//! let processor = processor_fn(|_job| async move {
//!     Ok(JobResult::failed("rate limited").move_to_queue("retry-later", 5000))
//! });
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use conveyor_queue::prelude::*;
//! use conveyor_redis::RedisConfig;
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     conveyor_queue::logging::init();
//!
//!     let manager = QueueManager::new(ManagerConfig::new(RedisConfig::default()))?;
//!     manager.create_queue("emails", None)?;
//!     manager.create_worker(
//!         "emails",
//!         processor_fn(|job| async move { Ok(JobResult::ok(job.data)) }),
//!         None,
//!     )?;
//!
//!     manager
//!         .add_job("emails", serde_json::json!({"to": "user@example.com"}), None)
//!         .await?;
//!
//!     manager.close_all().await
//! }
//! ```

pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod result;
pub mod worker;

pub use adapter::RedirectingProcessor;
pub use backend::{JobCounts, MemoryBackend, QueueBackend, RedisBackend};
pub use config::{ConnectionSource, DEFAULT_PREFIX, ManagerConfig, ManagerConfigBuilder};
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, EventBusConfig, EventKind, Listener, ManagerEvent, listener};
pub use job::{
    Backoff, BackoffKind, Job, JobData, JobId, JobOptions, JobState, KeepJobs, MAX_PRIORITY,
};
pub use manager::QueueManager;
pub use processor::{FnProcessor, JobProcessor, processor_fn};
pub use queue::{QueueHandle, QueueOptions, QueueRegistry};
pub use result::{JobResult, MoveToDelay, Redirected};
pub use worker::{WorkerHandle, WorkerOptions, WorkerRegistry};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{JobCounts, MemoryBackend, QueueBackend, RedisBackend};
    pub use crate::config::{ConnectionSource, ManagerConfig};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::events::{EventKind, Listener, ManagerEvent, listener};
    pub use crate::job::{Backoff, Job, JobData, JobId, JobOptions, JobState, KeepJobs};
    pub use crate::manager::QueueManager;
    pub use crate::processor::{JobProcessor, processor_fn};
    pub use crate::queue::{QueueHandle, QueueOptions};
    pub use crate::result::JobResult;
    pub use crate::worker::{WorkerHandle, WorkerOptions};
}
