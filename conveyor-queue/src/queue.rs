//! Queue handles and the queue registry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::backend::{JobCounts, QueueBackend};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, ManagerEvent};
use crate::job::{Job, JobData, JobOptions};

/// Queue creation options.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Key prefix; the manager's prefix when unset.
    pub prefix: Option<String>,

    /// Maximum number of pending (waiting plus delayed) jobs; unlimited
    /// when unset.
    pub max_size: Option<usize>,
}

impl QueueOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the maximum number of pending jobs.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// A named queue bound to the shared connection.
#[derive(Debug)]
pub struct QueueHandle {
    name: String,
    prefix: String,
    max_size: Option<usize>,
    backend: Arc<dyn QueueBackend>,
    closed: AtomicBool,
}

impl QueueHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        max_size: Option<usize>,
        backend: Arc<dyn QueueBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            max_size,
            backend,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether [`QueueHandle::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue a job named `name` with exactly `options`.
    pub async fn add(
        &self,
        name: &str,
        data: JobData,
        options: JobOptions,
    ) -> QueueResult<Job> {
        if self.is_closed() {
            return Err(QueueError::QueueClosed(self.name.clone()));
        }

        if let Some(max_size) = self.max_size {
            let pending = self.counts().await?.pending();
            if pending >= max_size {
                return Err(QueueError::QueueFull(self.name.clone()));
            }
        }

        let job = self
            .backend
            .enqueue(&self.prefix, &self.name, name, data, options)
            .await?;

        debug!(queue = %self.name, job_id = %job.id, name = %name, "Job added");
        Ok(job)
    }

    /// Load a job record.
    pub async fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        self.backend.get_job(&self.prefix, &self.name, id).await
    }

    /// Read a job's log.
    pub async fn job_logs(&self, id: &str) -> QueueResult<Vec<String>> {
        self.backend.job_logs(&self.prefix, &self.name, id).await
    }

    /// Count jobs per state.
    pub async fn counts(&self) -> QueueResult<JobCounts> {
        self.backend.counts(&self.prefix, &self.name).await
    }

    /// Stop accepting submissions. Closing twice is a no-op.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.name, "Queue closed");
        }
    }
}

/// Name-keyed set of queue handles.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: DashMap<String, Arc<QueueHandle>>,
    backend: Arc<dyn QueueBackend>,
    prefix: String,
    events: EventBus,
}

impl QueueRegistry {
    pub(crate) fn new(backend: Arc<dyn QueueBackend>, prefix: impl Into<String>, events: EventBus) -> Self {
        Self {
            queues: DashMap::new(),
            backend,
            prefix: prefix.into(),
            events,
        }
    }

    /// Return the queue named `name`, creating it on first use.
    ///
    /// Options of a repeated call are ignored.
    pub fn create(&self, name: &str, options: QueueOptions) -> QueueResult<Arc<QueueHandle>> {
        if self.backend.is_closed() {
            return Err(QueueError::ConnectionClosed);
        }

        let queue = match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                warn!(queue = %name, "Queue already exists, returning existing handle");
                return Ok(entry.get().clone());
            }
            Entry::Vacant(entry) => {
                let prefix = options.prefix.unwrap_or_else(|| self.prefix.clone());
                let queue = Arc::new(QueueHandle::new(
                    name,
                    prefix,
                    options.max_size,
                    self.backend.clone(),
                ));
                entry.insert(queue.clone());
                queue
            }
        };

        info!(queue = %name, prefix = %queue.prefix(), "Queue created");
        self.events.publish(ManagerEvent::QueueCreated(queue.clone()));
        Ok(queue)
    }

    /// Look up a queue.
    pub fn get(&self, name: &str) -> Option<Arc<QueueHandle>> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    /// Every registered queue, in no particular order.
    pub fn all(&self) -> Vec<Arc<QueueHandle>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Names of every registered queue.
    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no queue is registered.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Close and unregister `name`. Returns `false` when another call got
    /// there first or the queue never existed.
    pub async fn close(&self, name: &str) -> bool {
        let Some(queue) = self.get(name) else {
            return false;
        };

        queue.close().await;

        let removed = self
            .queues
            .remove_if(name, |_, current| Arc::ptr_eq(current, &queue))
            .is_some();
        if removed {
            info!(queue = %name, "Queue removed");
            self.events.publish(ManagerEvent::QueueRemoved(queue));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::events::{EventKind, listener};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> (QueueRegistry, EventBus) {
        let events = EventBus::new();
        let registry = QueueRegistry::new(Arc::new(MemoryBackend::new()), "test", events.clone());
        (registry, events)
    }

    fn count(events: &EventBus, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        events.subscribe(
            kind,
            listener(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn test_create_is_idempotent() {
        let (registry, events) = registry();
        let created = count(&events, EventKind::QueueCreated);

        let first = registry.create("emails", QueueOptions::new()).unwrap();
        let second = registry
            .create("emails", QueueOptions::new().with_prefix("other"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.prefix(), "test");
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_explicit_prefix_overrides_default() {
        let (registry, _) = registry();
        let queue = registry
            .create("emails", QueueOptions::new().with_prefix("custom"))
            .unwrap();
        assert_eq!(queue.prefix(), "custom");
    }

    #[tokio::test]
    async fn test_close_removes_and_emits_once() {
        let (registry, events) = registry();
        let removed = count(&events, EventKind::QueueRemoved);
        let queue = registry.create("emails", QueueOptions::new()).unwrap();

        assert!(registry.close("emails").await);
        assert!(!registry.close("emails").await);
        assert!(!registry.close("missing").await);

        assert!(queue.is_closed());
        assert!(registry.get("emails").is_none());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_jobs() {
        let (registry, _) = registry();
        let queue = registry.create("emails", QueueOptions::new()).unwrap();
        queue.close().await;

        let result = queue.add("emails", json!({}), JobOptions::default()).await;
        assert!(matches!(result, Err(QueueError::QueueClosed(name)) if name == "emails"));
    }

    #[tokio::test]
    async fn test_max_size() {
        let (registry, _) = registry();
        let queue = registry
            .create("emails", QueueOptions::new().with_max_size(1))
            .unwrap();

        queue.add("emails", json!({}), JobOptions::default()).await.unwrap();
        let result = queue.add("emails", json!({}), JobOptions::default()).await;
        assert!(matches!(result, Err(QueueError::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_create_after_backend_closed() {
        let (registry, _) = registry();
        registry.backend.close().await.unwrap();
        assert!(matches!(
            registry.create("emails", QueueOptions::new()),
            Err(QueueError::ConnectionClosed)
        ));
    }
}
