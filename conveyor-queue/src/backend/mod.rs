//! Job-queue engine clients.
//!
//! The manager never touches storage directly; every queue and worker it
//! creates talks to one [`QueueBackend`]. Two engines ship with the crate:
//!
//! - [`RedisBackend`]: durable, shared between processes
//! - [`MemoryBackend`]: in-process, for tests and embedding

mod memory;
mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::ConnectionSource;
use crate::error::QueueResult;
use crate::job::{Job, JobData, JobId, JobOptions};

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    /// Jobs not yet picked up.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed
    }
}

/// Client of a job-queue engine.
///
/// Queues are addressed by `(prefix, queue)`. Implementations must be safe
/// to call concurrently from every queue and worker of a manager.
#[async_trait]
pub trait QueueBackend: Send + Sync + fmt::Debug + 'static {
    /// Short engine name for logs.
    fn kind(&self) -> &'static str;

    /// Independent handle on the same engine session. Closing the
    /// duplicate leaves `self` open.
    fn duplicate(&self) -> Arc<dyn QueueBackend>;

    /// Whether [`QueueBackend::close`] was called.
    fn is_closed(&self) -> bool;

    /// Release the connection. Closing twice is a no-op.
    async fn close(&self) -> QueueResult<()>;

    /// Store a new job and make it available after its delay.
    async fn enqueue(
        &self,
        prefix: &str,
        queue: &str,
        name: &str,
        data: JobData,
        options: JobOptions,
    ) -> QueueResult<Job>;

    /// Promote due delayed jobs, then take the next waiting job and mark
    /// it active.
    async fn fetch_next(&self, prefix: &str, queue: &str) -> QueueResult<Option<Job>>;

    /// Report an active job as completed with `return_value`.
    async fn complete(&self, prefix: &str, job: &Job, return_value: JobData) -> QueueResult<()>;

    /// Report a failed attempt; the job is retried with backoff while
    /// attempts remain.
    async fn fail(&self, prefix: &str, job: &Job, reason: &str) -> QueueResult<()>;

    /// Load a job record.
    async fn get_job(&self, prefix: &str, queue: &str, id: &str) -> QueueResult<Option<Job>>;

    /// Append a line to a job's log.
    async fn append_log(&self, prefix: &str, queue: &str, id: &str, line: &str)
    -> QueueResult<()>;

    /// Read a job's log.
    async fn job_logs(&self, prefix: &str, queue: &str, id: &str) -> QueueResult<Vec<String>>;

    /// Count jobs per state.
    async fn counts(&self, prefix: &str, queue: &str) -> QueueResult<JobCounts>;
}

/// Open the shared connection described by `source`.
///
/// An existing handle is duplicated rather than adopted, so closing the
/// manager never closes a handle someone else still holds.
pub fn connect(source: &ConnectionSource) -> QueueResult<Arc<dyn QueueBackend>> {
    match source {
        ConnectionSource::Existing(backend) => Ok(backend.duplicate()),
        ConnectionSource::Redis(config) => Ok(Arc::new(RedisBackend::new(config)?)),
    }
}

/// Identity of a job record that reused a pinned id.
pub(crate) fn active_member(id: &JobId, seq: u64) -> String {
    format!("{}#{}", id, seq)
}
