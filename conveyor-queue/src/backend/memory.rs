//! In-process engine.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use super::{JobCounts, QueueBackend, active_member};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobId, JobOptions, JobState, KeepJobs};

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    next_seq: u64,
    jobs: HashMap<JobId, Job>,
    /// (priority rank, seq) -> id
    waiting: BTreeMap<(u64, u64), JobId>,
    /// (ready at ms, seq) -> id
    delayed: BTreeMap<(i64, u64), JobId>,
    active: HashSet<String>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    logs: HashMap<JobId, Vec<String>>,
}

impl QueueState {
    /// Drop every index entry for `id` except the active marker.
    fn unlink(&mut self, id: &str) {
        self.waiting.retain(|_, v| v != id);
        self.delayed.retain(|_, v| v != id);
        self.completed.retain(|v| v != id);
        self.failed.retain(|v| v != id);
    }

    fn schedule(&mut self, job: &Job, delay_ms: u64) {
        if delay_ms > 0 {
            let ready_at = Utc::now()
                .timestamp_millis()
                .saturating_add(delay_ms.min(i64::MAX as u64) as i64);
            self.delayed.insert((ready_at, job.seq), job.id.clone());
        } else {
            self.waiting
                .insert((job.options.priority_rank(), job.seq), job.id.clone());
        }
    }

    fn promote_delayed(&mut self) {
        let now = Utc::now().timestamp_millis();
        let due: Vec<(i64, u64)> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        for key in due {
            if let Some(id) = self.delayed.remove(&key)
                && let Some(job) = self.jobs.get_mut(&id)
            {
                job.state = JobState::Waiting;
                self.waiting
                    .insert((job.options.priority_rank(), job.seq), id);
            }
        }
    }

    /// Record a finished job in `list` and apply the retention policy.
    fn retain_finished(&mut self, id: &JobId, keep: Option<KeepJobs>, completed: bool) {
        let evicted: Vec<JobId> = match keep {
            Some(KeepJobs::Remove(true)) => vec![id.clone()],
            Some(KeepJobs::KeepLast(n)) => {
                let list = if completed {
                    &mut self.completed
                } else {
                    &mut self.failed
                };
                list.push_front(id.clone());
                let n = usize::try_from(n).unwrap_or(usize::MAX);
                if list.len() > n {
                    list.split_off(n).into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            _ => {
                if completed {
                    self.completed.push_front(id.clone());
                } else {
                    self.failed.push_front(id.clone());
                }
                Vec::new()
            }
        };

        for id in evicted {
            self.jobs.remove(&id);
            self.logs.remove(&id);
        }
    }

    /// Clear the active marker; returns the stored record when `job` is
    /// still the current record for its id.
    fn finish_active(&mut self, job: &Job) -> Option<&mut Job> {
        self.active.remove(&active_member(&job.id, job.seq));
        match self.jobs.get_mut(&job.id) {
            Some(stored) if stored.seq == job.seq => Some(stored),
            _ => {
                debug!(job_id = %job.id, queue = %job.queue, "Job record superseded, skipping report");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    queues: Mutex<HashMap<String, QueueState>>,
    connections: AtomicUsize,
}

/// In-process engine.
///
/// Duplicates share storage and each own their closed flag.
#[derive(Debug)]
pub struct MemoryBackend {
    store: Arc<Store>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::default()))
    }

    fn with_store(store: Arc<Store>) -> Self {
        store.connections.fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of handles ever opened on this storage.
    pub fn connection_count(&self) -> usize {
        self.store.connections.load(Ordering::SeqCst)
    }

    fn with_queue<T>(
        &self,
        prefix: &str,
        queue: &str,
        f: impl FnOnce(&mut QueueState) -> T,
    ) -> QueueResult<T> {
        if self.is_closed() {
            return Err(QueueError::ConnectionClosed);
        }
        let mut queues = self.store.queues.lock();
        let state = queues.entry(format!("{}:{}", prefix, queue)).or_default();
        Ok(f(state))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn duplicate(&self) -> Arc<dyn QueueBackend> {
        Arc::new(Self::with_store(self.store.clone()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> QueueResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory backend closed");
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        prefix: &str,
        queue: &str,
        name: &str,
        data: JobData,
        options: JobOptions,
    ) -> QueueResult<Job> {
        self.with_queue(prefix, queue, |state| {
            let id = match &options.job_id {
                Some(id) => {
                    state.unlink(id);
                    id.clone()
                }
                None => {
                    state.next_id += 1;
                    state.next_id.to_string()
                }
            };
            state.next_seq += 1;

            let delay = options.delay.unwrap_or(0);
            let job = Job::new(id, queue, name, data, options).with_seq(state.next_seq);
            state.schedule(&job, delay);
            state.jobs.insert(job.id.clone(), job.clone());
            job
        })
    }

    async fn fetch_next(&self, prefix: &str, queue: &str) -> QueueResult<Option<Job>> {
        self.with_queue(prefix, queue, |state| {
            state.promote_delayed();

            while let Some((_, id)) = state.waiting.pop_first() {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.start_processing();
                    let job = job.clone();
                    state.active.insert(active_member(&job.id, job.seq));
                    return Some(job);
                }
            }
            None
        })
    }

    async fn complete(&self, prefix: &str, job: &Job, return_value: JobData) -> QueueResult<()> {
        self.with_queue(prefix, &job.queue, |state| {
            let Some(stored) = state.finish_active(job) else {
                return;
            };
            stored.complete(return_value);
            let keep = stored.options.remove_on_complete;
            state.retain_finished(&job.id, keep, true);
        })
    }

    async fn fail(&self, prefix: &str, job: &Job, reason: &str) -> QueueResult<()> {
        self.with_queue(prefix, &job.queue, |state| {
            let Some(stored) = state.finish_active(job) else {
                return;
            };
            match stored.fail(reason) {
                Some(delay) => {
                    let stored = stored.clone();
                    state.schedule(&stored, delay);
                }
                None => {
                    let keep = stored.options.remove_on_fail;
                    state.retain_finished(&job.id, keep, false);
                }
            }
        })
    }

    async fn get_job(&self, prefix: &str, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        self.with_queue(prefix, queue, |state| state.jobs.get(id).cloned())
    }

    async fn append_log(
        &self,
        prefix: &str,
        queue: &str,
        id: &str,
        line: &str,
    ) -> QueueResult<()> {
        self.with_queue(prefix, queue, |state| {
            state
                .logs
                .entry(id.to_string())
                .or_default()
                .push(line.to_string());
        })
    }

    async fn job_logs(&self, prefix: &str, queue: &str, id: &str) -> QueueResult<Vec<String>> {
        self.with_queue(prefix, queue, |state| {
            state.logs.get(id).cloned().unwrap_or_default()
        })
    }

    async fn counts(&self, prefix: &str, queue: &str) -> QueueResult<JobCounts> {
        self.with_queue(prefix, queue, |state| JobCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Backoff;
    use serde_json::json;

    const P: &str = "test";

    #[tokio::test]
    async fn test_ids_are_sequential_per_queue() {
        let backend = MemoryBackend::new();
        let a = backend.enqueue(P, "q", "q", json!({}), JobOptions::default()).await.unwrap();
        let b = backend.enqueue(P, "q", "q", json!({}), JobOptions::default()).await.unwrap();
        let other = backend.enqueue(P, "r", "r", json!({}), JobOptions::default()).await.unwrap();

        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
        assert_eq!(other.id, "1");
    }

    #[tokio::test]
    async fn test_fetch_respects_priority_then_fifo() {
        let backend = MemoryBackend::new();
        for (name, options) in [
            ("plain-1", JobOptions::default()),
            ("low", JobOptions::new().with_priority(10)),
            ("plain-2", JobOptions::default()),
            ("high", JobOptions::new().with_priority(1)),
        ] {
            backend.enqueue(P, "q", name, json!({}), options).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(job) = backend.fetch_next(P, "q").await.unwrap() {
            order.push(job.name);
        }
        assert_eq!(order, vec!["high", "low", "plain-1", "plain-2"]);
    }

    #[tokio::test]
    async fn test_delayed_job_is_not_fetched_early() {
        let backend = MemoryBackend::new();
        backend
            .enqueue(P, "q", "q", json!({}), JobOptions::new().with_delay(60_000))
            .await
            .unwrap();

        assert!(backend.fetch_next(P, "q").await.unwrap().is_none());
        assert_eq!(backend.counts(P, "q").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_maximum_delay_stays_delayed() {
        let backend = MemoryBackend::new();
        let job = backend
            .enqueue(P, "q", "q", json!({}), JobOptions::new().with_delay(u64::MAX))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Delayed);
        assert!(backend.fetch_next(P, "q").await.unwrap().is_none());
        assert_eq!(backend.counts(P, "q").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_available() {
        let backend = MemoryBackend::new();
        backend
            .enqueue(P, "q", "q", json!({}), JobOptions::new().with_delay(20))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        let job = backend.fetch_next(P, "q").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_complete_and_retention() {
        let backend = MemoryBackend::new();
        let options = JobOptions::new().with_remove_on_complete(KeepJobs::KeepLast(1));
        for _ in 0..2 {
            backend.enqueue(P, "q", "q", json!({}), options.clone()).await.unwrap();
        }

        for _ in 0..2 {
            let job = backend.fetch_next(P, "q").await.unwrap().unwrap();
            backend.complete(P, &job, json!({"success": true})).await.unwrap();
        }

        let counts = backend.counts(P, "q").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
        assert!(backend.get_job(P, "q", "1").await.unwrap().is_none());

        let kept = backend.get_job(P, "q", "2").await.unwrap().unwrap();
        assert_eq!(kept.state, JobState::Completed);
        assert_eq!(kept.return_value, Some(json!({"success": true})));
    }

    #[tokio::test]
    async fn test_fail_retries_then_fails() {
        let backend = MemoryBackend::new();
        backend
            .enqueue(P, "q", "q", json!({}), JobOptions::new().with_attempts(2))
            .await
            .unwrap();

        let job = backend.fetch_next(P, "q").await.unwrap().unwrap();
        backend.fail(P, &job, "first").await.unwrap();
        assert_eq!(backend.counts(P, "q").await.unwrap().waiting, 1);

        let job = backend.fetch_next(P, "q").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        backend.fail(P, &job, "second").await.unwrap();

        let stored = backend.get_job(P, "q", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some("second"));
        assert_eq!(backend.counts(P, "q").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_fail_with_backoff_delays_retry() {
        let backend = MemoryBackend::new();
        let options = JobOptions::new()
            .with_attempts(3)
            .with_backoff(Backoff::fixed(60_000));
        backend.enqueue(P, "q", "q", json!({}), options).await.unwrap();

        let job = backend.fetch_next(P, "q").await.unwrap().unwrap();
        backend.fail(P, &job, "boom").await.unwrap();

        let counts = backend.counts(P, "q").await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_pinned_id_supersedes_active_record() {
        let backend = MemoryBackend::new();
        let pinned = JobOptions::new().with_job_id("order-1");
        backend.enqueue(P, "q", "q", json!({"v": 1}), pinned.clone()).await.unwrap();

        let active = backend.fetch_next(P, "q").await.unwrap().unwrap();
        backend
            .enqueue(P, "q", "q", json!({"v": 1}), pinned.with_delay(60_000))
            .await
            .unwrap();
        backend.complete(P, &active, json!({})).await.unwrap();

        let stored = backend.get_job(P, "q", "order-1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        let counts = backend.counts(P, "q").await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.completed, 0);
    }

    #[tokio::test]
    async fn test_logs() {
        let backend = MemoryBackend::new();
        backend.append_log(P, "q", "1", "first").await.unwrap();
        backend.append_log(P, "q", "1", "second").await.unwrap();

        assert_eq!(backend.job_logs(P, "q", "1").await.unwrap(), vec!["first", "second"]);
        assert!(backend.job_logs(P, "q", "2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_shares_storage_not_lifecycle() {
        let backend = MemoryBackend::new();
        let duplicate = backend.duplicate();

        duplicate.enqueue(P, "q", "q", json!({}), JobOptions::default()).await.unwrap();
        duplicate.close().await.unwrap();

        assert_eq!(backend.counts(P, "q").await.unwrap().waiting, 1);
        assert_eq!(backend.connection_count(), 2);
        assert!(matches!(
            duplicate.counts(P, "q").await,
            Err(QueueError::ConnectionClosed)
        ));
    }
}
