//! The job processing capability supplied by callers.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::QueueResult;
use crate::job::Job;
use crate::result::JobResult;

/// Processes one job.
///
/// Returning `Err` reports the attempt as failed, so the engine's
/// attempts and backoff decide what happens next. Returning `Ok` completes
/// the job with the given result, or redirects it when the result carries
/// a `move_to_delay` request.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use conveyor_queue::{Job, JobProcessor, JobResult, QueueResult};
/// use serde_json::json;
///
/// struct EmailProcessor;
///
/// #[async_trait]
/// impl JobProcessor for EmailProcessor {
///     async fn process(&self, job: &Job, _token: Option<&str>) -> QueueResult<JobResult> {
///         Ok(JobResult::ok(json!({ "messageId": format!("email_{}", job.id) })))
///     }
/// }
/// ```
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Process `job`. `token` identifies this delivery to the engine.
    async fn process(&self, job: &Job, token: Option<&str>) -> QueueResult<JobResult>;
}

#[async_trait]
impl<P: JobProcessor + ?Sized> JobProcessor for Arc<P> {
    async fn process(&self, job: &Job, token: Option<&str>) -> QueueResult<JobResult> {
        (**self).process(job, token).await
    }
}

/// Processor built from an async closure. See [`processor_fn`].
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap an async closure as a [`JobProcessor`].
///
/// ```
/// use conveyor_queue::{processor_fn, JobResult};
///
/// let processor = processor_fn(|job| async move {
///     Ok(JobResult::ok(job.data))
/// });
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<JobResult>> + Send + 'static,
{
    FnProcessor { f }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<JobResult>> + Send + 'static,
{
    async fn process(&self, job: &Job, _token: Option<&str>) -> QueueResult<JobResult> {
        (self.f)(job.clone()).await
    }
}
