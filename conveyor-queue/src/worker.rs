//! Workers and the worker registry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::RedirectingProcessor;
use crate::backend::QueueBackend;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, ManagerEvent};
use crate::job::Job;
use crate::processor::JobProcessor;
use crate::queue::QueueRegistry;

/// Worker options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Key prefix; the manager's prefix when unset.
    pub prefix: Option<String>,

    /// Number of jobs processed at the same time
    pub concurrency: usize,

    /// Wait between polls of an empty queue
    pub poll_interval: Duration,

    /// Start consuming as soon as the worker is created
    pub autorun: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            autorun: true,
        }
    }
}

impl WorkerOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set whether the worker starts immediately.
    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }
}

/// State shared by the consume loops of one worker.
struct Consumer {
    queue_name: String,
    prefix: String,
    worker_id: String,
    processor: Arc<dyn JobProcessor>,
    backend: Arc<dyn QueueBackend>,
    poll_interval: Duration,
    deliveries: AtomicU64,
}

impl Consumer {
    async fn consume(self: Arc<Self>, slot: usize, mut stop: watch::Receiver<bool>) {
        debug!(queue = %self.queue_name, worker_id = %self.worker_id, slot, "Consume loop started");

        loop {
            let stopped = *stop.borrow();
            if stopped {
                break;
            }

            match self.backend.fetch_next(&self.prefix, &self.queue_name).await {
                Ok(Some(job)) => {
                    self.dispatch(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(QueueError::ConnectionClosed) => {
                    debug!(queue = %self.queue_name, slot, "Connection closed, stopping consume loop");
                    break;
                }
                Err(e) => {
                    warn!(queue = %self.queue_name, slot, error = %e, "Failed to fetch next job");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(queue = %self.queue_name, worker_id = %self.worker_id, slot, "Consume loop stopped");
    }

    async fn dispatch(&self, job: Job) {
        let delivery = self.deliveries.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("{}:{}", self.worker_id, delivery);

        debug!(queue = %self.queue_name, job_id = %job.id, attempt = job.attempts_made, "Processing job");

        let outcome = AssertUnwindSafe(self.processor.process(&job, Some(&token)))
            .catch_unwind()
            .await;

        let reported = match outcome {
            Ok(Ok(result)) => match serde_json::to_value(&result) {
                Ok(value) => self.backend.complete(&self.prefix, &job, value).await,
                Err(e) => self.backend.fail(&self.prefix, &job, &e.to_string()).await,
            },
            Ok(Err(e)) => self.backend.fail(&self.prefix, &job, &e.to_string()).await,
            Err(_) => {
                error!(queue = %self.queue_name, job_id = %job.id, "Job processor panicked");
                self.backend
                    .fail(&self.prefix, &job, "job processor panicked")
                    .await
            }
        };

        if let Err(e) = reported {
            error!(queue = %self.queue_name, job_id = %job.id, error = %e, "Failed to report job outcome");
        }
    }
}

fn runtime_handle() -> QueueResult<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|e| QueueError::Config(format!("workers need a Tokio runtime: {}", e)))
}

/// A worker consuming one queue.
pub struct WorkerHandle {
    consumer: Arc<Consumer>,
    concurrency: usize,
    running: AtomicBool,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        queue_name: impl Into<String>,
        prefix: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
        backend: Arc<dyn QueueBackend>,
        options: &WorkerOptions,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            consumer: Arc::new(Consumer {
                queue_name: queue_name.into(),
                prefix: prefix.into(),
                worker_id: Uuid::new_v4().to_string(),
                processor,
                backend,
                poll_interval: options.poll_interval,
                deliveries: AtomicU64::new(0),
            }),
            concurrency: options.concurrency.max(1),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Name of the consumed queue.
    pub fn queue_name(&self) -> &str {
        &self.consumer.queue_name
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.consumer.prefix
    }

    /// Unique worker id, used in delivery tokens.
    pub fn id(&self) -> &str {
        &self.consumer.worker_id
    }

    /// Number of consume loops.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Whether the consume loops are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether [`WorkerHandle::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start consuming. Must be called from within a Tokio runtime.
    pub fn run(&self) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::WorkerClosed(self.queue_name().to_string()));
        }
        let runtime = runtime_handle()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::WorkerAlreadyRunning(self.queue_name().to_string()));
        }

        let mut tasks = self.tasks.lock();
        for slot in 0..self.concurrency {
            let consumer = self.consumer.clone();
            tasks.push(runtime.spawn(consumer.consume(slot, self.stop.subscribe())));
        }

        info!(
            queue = %self.queue_name(),
            worker_id = %self.id(),
            concurrency = self.concurrency,
            "Worker started"
        );
        Ok(())
    }

    /// Stop dispatching and wait for in-flight jobs. Closing twice is a
    /// no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(queue = %self.queue_name(), error = %e, "Consume loop ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);

        debug!(queue = %self.queue_name(), worker_id = %self.id(), "Worker closed");
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("queue_name", &self.queue_name())
            .field("prefix", &self.prefix())
            .field("id", &self.id())
            .field("concurrency", &self.concurrency)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Queue-name-keyed set of workers.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<WorkerHandle>>,
    queues: Arc<QueueRegistry>,
    backend: Arc<dyn QueueBackend>,
    prefix: String,
    events: EventBus,
}

impl WorkerRegistry {
    pub(crate) fn new(
        queues: Arc<QueueRegistry>,
        backend: Arc<dyn QueueBackend>,
        prefix: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            queues,
            backend,
            prefix: prefix.into(),
            events,
        }
    }

    /// Return the worker for `queue_name`, creating it on first use.
    ///
    /// The processor is wrapped with redirection support. Arguments of a
    /// repeated call are ignored.
    pub fn create(
        &self,
        queue_name: &str,
        processor: Arc<dyn JobProcessor>,
        options: WorkerOptions,
    ) -> QueueResult<Arc<WorkerHandle>> {
        if self.backend.is_closed() {
            return Err(QueueError::ConnectionClosed);
        }
        if options.autorun {
            runtime_handle()?;
        }

        let worker = match self.workers.entry(queue_name.to_string()) {
            Entry::Occupied(entry) => {
                warn!(queue = %queue_name, "Worker already exists, returning existing handle");
                return Ok(entry.get().clone());
            }
            Entry::Vacant(entry) => {
                let prefix = options.prefix.clone().unwrap_or_else(|| self.prefix.clone());
                let adapter = RedirectingProcessor::new(
                    processor,
                    self.queues.clone(),
                    self.backend.clone(),
                    prefix.clone(),
                );
                let worker = Arc::new(WorkerHandle::new(
                    queue_name,
                    prefix,
                    Arc::new(adapter),
                    self.backend.clone(),
                    &options,
                ));
                entry.insert(worker.clone());
                worker
            }
        };

        info!(queue = %queue_name, worker_id = %worker.id(), "Worker created");
        self.events.publish(ManagerEvent::WorkerCreated(worker.clone()));

        // Listeners hear about the worker before its first job. A listener
        // may already have started or closed it.
        if options.autorun {
            match worker.run() {
                Ok(()) | Err(QueueError::WorkerAlreadyRunning(_) | QueueError::WorkerClosed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(worker)
    }

    /// Look up a worker.
    pub fn get(&self, queue_name: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.get(queue_name).map(|entry| entry.value().clone())
    }

    /// Every registered worker, in no particular order.
    pub fn all(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Queue names of every registered worker.
    pub fn names(&self) -> Vec<String> {
        self.workers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop and unregister the worker for `queue_name`. Returns `false`
    /// when another call got there first or no worker existed.
    pub async fn close(&self, queue_name: &str) -> bool {
        let Some(worker) = self.get(queue_name) else {
            return false;
        };

        worker.close().await;

        let removed = self
            .workers
            .remove_if(queue_name, |_, current| Arc::ptr_eq(current, &worker))
            .is_some();
        if removed {
            info!(queue = %queue_name, "Worker removed");
            self.events.publish(ManagerEvent::WorkerRemoved(worker));
        }
        removed
    }
}
