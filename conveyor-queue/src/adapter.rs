//! Processor adapter implementing job redirection.
//!
//! Every processor handed to a worker is wrapped in a
//! [`RedirectingProcessor`]. When the processor's result carries a
//! `move_to_delay` request, the adapter enqueues a copy of the job on the
//! target queue with the requested delay, records the hop in the original
//! job's log, and reports the original job as successfully redirected.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backend::QueueBackend;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::processor::JobProcessor;
use crate::queue::QueueRegistry;
use crate::result::{JobResult, MoveToDelay, Redirected};

/// Wraps a user processor with the redirection protocol.
pub struct RedirectingProcessor {
    inner: Arc<dyn JobProcessor>,
    queues: Arc<QueueRegistry>,
    backend: Arc<dyn QueueBackend>,
    prefix: String,
}

impl RedirectingProcessor {
    /// Wrap `inner`. Redirect targets are resolved in `queues`; audit lines
    /// for jobs read under `prefix` are written through `backend`.
    pub fn new(
        inner: Arc<dyn JobProcessor>,
        queues: Arc<QueueRegistry>,
        backend: Arc<dyn QueueBackend>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            queues,
            backend,
            prefix: prefix.into(),
        }
    }

    async fn redirect(
        &self,
        job: &Job,
        request: &MoveToDelay,
        result: JobResult,
    ) -> QueueResult<JobResult> {
        let target_name = request.queue_name.as_deref().unwrap_or(&job.queue);
        let target = self
            .queues
            .get(target_name)
            .ok_or_else(|| QueueError::RedirectTargetNotFound(target_name.to_string()))?;

        // A pinned id travels with the cloned options.
        let mut options = job.options.clone();
        options.delay = Some(request.delay);

        let moved = target.add(&job.name, job.data.clone(), options).await?;

        let line = format!(
            "Job {} moved to queue {} with delay {}ms (new job {})",
            job.id,
            target.name(),
            request.delay,
            moved.id
        );
        if let Err(e) = self
            .backend
            .append_log(&self.prefix, &job.queue, &job.id, &line)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to record redirect in job log");
        }

        info!(
            job_id = %job.id,
            queue = %job.queue,
            target_queue = %target.name(),
            new_job_id = %moved.id,
            delay_ms = request.delay,
            "Job redirected"
        );

        let payload = Redirected {
            moved_to_delay: true,
            target_queue: target.name().to_string(),
            delay: request.delay,
            original_result: result.data,
        };
        let data = serde_json::to_value(payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        Ok(JobResult::ok(data))
    }
}

#[async_trait]
impl JobProcessor for RedirectingProcessor {
    async fn process(&self, job: &Job, token: Option<&str>) -> QueueResult<JobResult> {
        let result = match self.inner.process(job, token).await {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %job.id, queue = %job.queue, error = %e, "Job processing failed");
                return Err(e);
            }
        };

        let Some(request) = result.move_to_delay.clone() else {
            debug!(job_id = %job.id, queue = %job.queue, success = result.success, "Job processed");
            return Ok(result);
        };

        self.redirect(job, &request, result).await.inspect_err(|e| {
            error!(job_id = %job.id, queue = %job.queue, error = %e, "Job redirection failed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::events::EventBus;
    use crate::job::{JobOptions, JobState};
    use crate::processor::processor_fn;
    use crate::queue::QueueOptions;
    use serde_json::json;

    struct Fixture {
        backend: Arc<dyn QueueBackend>,
        queues: Arc<QueueRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
            let queues = Arc::new(QueueRegistry::new(backend.clone(), "test", EventBus::new()));
            queues.create("A", QueueOptions::new()).unwrap();
            Self { backend, queues }
        }

        fn adapter(&self, result: QueueResult<JobResult>) -> RedirectingProcessor {
            let result = Arc::new(parking_lot::Mutex::new(Some(result)));
            let inner = processor_fn(move |_job| {
                let result = result.clone();
                async move {
                    result
                        .lock()
                        .take()
                        .unwrap_or_else(|| Err(QueueError::processing("called twice")))
                }
            });
            RedirectingProcessor::new(
                Arc::new(inner),
                self.queues.clone(),
                self.backend.clone(),
                "test",
            )
        }

        async fn job(&self, options: JobOptions) -> Job {
            let queue = self.queues.get("A").unwrap();
            queue.add("A", json!({"to": "x"}), options).await.unwrap();
            self.backend.fetch_next("test", "A").await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_plain_result_passes_through() {
        let fixture = Fixture::new();
        let job = fixture.job(JobOptions::default()).await;
        let adapter = fixture.adapter(Ok(JobResult::ok(json!({"sent": true}))));

        let result = adapter.process(&job, None).await.unwrap();
        assert_eq!(result, JobResult::ok(json!({"sent": true})));
        assert_eq!(fixture.queues.get("A").unwrap().counts().await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_error_is_propagated_unchanged() {
        let fixture = Fixture::new();
        let job = fixture.job(JobOptions::default()).await;
        let adapter = fixture.adapter(Err(QueueError::processing("smtp down")));

        let err = adapter.process(&job, None).await.unwrap_err();
        assert!(matches!(err, QueueError::Processing(msg) if msg == "smtp down"));
    }

    #[tokio::test]
    async fn test_self_redirect_overrides_success() {
        let fixture = Fixture::new();
        let options = JobOptions::new().with_attempts(3).with_priority(2);
        let job = fixture.job(options).await;
        let adapter = fixture.adapter(Ok(JobResult::failed("later").move_to_delay(5000)));

        let result = adapter.process(&job, None).await.unwrap();

        assert!(result.success);
        assert_eq!(
            result.data,
            Some(json!({"movedToDelay": true, "targetQueue": "A", "delay": 5000}))
        );

        let queue = fixture.queues.get("A").unwrap();
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        let moved = queue.get_job("2").await.unwrap().unwrap();
        assert_eq!(moved.state, JobState::Delayed);
        assert_eq!(moved.data, json!({"to": "x"}));
        assert_eq!(moved.options.delay, Some(5000));
        assert_eq!(moved.options.attempts, Some(3));
        assert_eq!(moved.options.priority, Some(2));

        let logs = queue.job_logs(&job.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("moved to queue A with delay 5000ms"));
    }

    #[tokio::test]
    async fn test_redirect_to_other_queue_keeps_original_data() {
        let fixture = Fixture::new();
        fixture.queues.create("B", QueueOptions::new()).unwrap();
        let job = fixture.job(JobOptions::default()).await;
        let adapter = fixture.adapter(Ok(
            JobResult::ok(json!({"partial": 1})).move_to_queue("B", 1000)
        ));

        let result = adapter.process(&job, None).await.unwrap();

        assert_eq!(
            result.data,
            Some(json!({
                "movedToDelay": true,
                "targetQueue": "B",
                "delay": 1000,
                "originalResult": {"partial": 1}
            }))
        );
        let target = fixture.queues.get("B").unwrap();
        assert_eq!(target.counts().await.unwrap().delayed, 1);
        assert_eq!(fixture.queues.get("A").unwrap().counts().await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_redirect_to_unknown_queue_fails() {
        let fixture = Fixture::new();
        let job = fixture.job(JobOptions::default()).await;
        let adapter = fixture.adapter(Ok(JobResult::done().move_to_queue("B", 1000)));

        let err = adapter.process(&job, None).await.unwrap_err();
        assert!(matches!(err, QueueError::RedirectTargetNotFound(name) if name == "B"));
        assert!(fixture.queues.get("B").is_none());
    }

    #[tokio::test]
    async fn test_redirect_carries_pinned_id() {
        let fixture = Fixture::new();
        let job = fixture.job(JobOptions::new().with_job_id("order-7")).await;
        let adapter = fixture.adapter(Ok(JobResult::done().move_to_delay(60_000)));

        adapter.process(&job, None).await.unwrap();

        let moved = fixture.queues.get("A").unwrap().get_job("order-7").await.unwrap().unwrap();
        assert_eq!(moved.options.job_id.as_deref(), Some("order-7"));
        assert_eq!(moved.state, JobState::Delayed);
        assert!(moved.seq > job.seq);
    }
}
