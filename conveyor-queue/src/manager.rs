//! The queue manager.
//!
//! A [`QueueManager`] owns one shared connection, a queue registry, a
//! worker registry and an event bus. Queues and workers are created on
//! demand and live until they are closed individually or the manager
//! shuts down with [`QueueManager::close_all`].
//!
//! # Examples
//!
//! ```
//! use conveyor_queue::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> QueueResult<()> {
//! let config = ManagerConfig::builder()
//!     .connection(Arc::new(MemoryBackend::new()))
//!     .prefix("myapp")
//!     .default_job_options(JobOptions::new().with_attempts(3))
//!     .build();
//! let manager = QueueManager::new(config)?;
//!
//! manager.create_queue("emails", None)?;
//! manager.create_worker(
//!     "emails",
//!     processor_fn(|job| async move { Ok(JobResult::ok(job.data)) }),
//!     None,
//! )?;
//!
//! let job = manager.add_job("emails", json!({"to": "user@example.com"}), None).await?;
//! println!("queued {}", job.id);
//!
//! manager.close_all().await?;
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

use crate::backend::{self, QueueBackend};
use crate::config::ManagerConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, EventKind, Listener, ManagerEvent};
use crate::job::{Job, JobData, JobOptions};
use crate::processor::JobProcessor;
use crate::queue::{QueueHandle, QueueOptions, QueueRegistry};
use crate::worker::{WorkerHandle, WorkerOptions, WorkerRegistry};

/// Manages named queues and workers over one shared connection.
#[derive(Debug)]
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    queues: Arc<QueueRegistry>,
    workers: WorkerRegistry,
    events: EventBus,
    default_job_options: JobOptions,
    prefix: String,
    closed: AtomicBool,
}

impl QueueManager {
    /// Create a manager.
    ///
    /// Fails with [`QueueError::Config`] when no connection source is
    /// configured. Redis connections are opened lazily.
    pub fn new(config: ManagerConfig) -> QueueResult<Self> {
        config.validate()?;
        let source = config
            .connection
            .as_ref()
            .ok_or_else(|| QueueError::Config("a connection is required".to_string()))?;
        let backend = backend::connect(source)?;

        let events = EventBus::new();
        let queues = Arc::new(QueueRegistry::new(
            backend.clone(),
            config.prefix.clone(),
            events.clone(),
        ));
        let workers = WorkerRegistry::new(
            queues.clone(),
            backend.clone(),
            config.prefix.clone(),
            events.clone(),
        );

        info!(prefix = %config.prefix, backend = backend.kind(), "QueueManager initialized");

        Ok(Self {
            backend,
            queues,
            workers,
            events,
            default_job_options: config.default_job_options,
            prefix: config.prefix,
            closed: AtomicBool::new(false),
        })
    }

    /// Key prefix for queues and workers created without one.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The shared connection.
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Return the queue named `name`, creating it on first use.
    pub fn create_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
    ) -> QueueResult<Arc<QueueHandle>> {
        self.queues.create(name, options.unwrap_or_default())
    }

    /// Return the worker for `queue_name`, creating it on first use.
    pub fn create_worker<P>(
        &self,
        queue_name: &str,
        processor: P,
        options: Option<WorkerOptions>,
    ) -> QueueResult<Arc<WorkerHandle>>
    where
        P: JobProcessor,
    {
        self.workers
            .create(queue_name, Arc::new(processor), options.unwrap_or_default())
    }

    /// Submit a job to a registered queue.
    ///
    /// `options` override the default job options field by field. The
    /// queue name doubles as the job name.
    pub async fn add_job(
        &self,
        queue_name: &str,
        data: JobData,
        options: Option<JobOptions>,
    ) -> QueueResult<Job> {
        let queue = self
            .queues
            .get(queue_name)
            .ok_or_else(|| QueueError::QueueNotFound(queue_name.to_string()))?;

        let options = match options {
            Some(options) => self.default_job_options.merged_with(&options),
            None => self.default_job_options.clone(),
        };

        let job = queue.add(queue_name, data, options).await?;
        info!(queue = %queue_name, job_id = %job.id, "Job added");
        Ok(job)
    }

    /// Look up a queue.
    pub fn get_queue(&self, name: &str) -> Option<Arc<QueueHandle>> {
        self.queues.get(name)
    }

    /// Every registered queue, in no particular order.
    pub fn get_all_queues(&self) -> Vec<Arc<QueueHandle>> {
        self.queues.all()
    }

    /// Look up a worker by the queue it consumes.
    pub fn get_worker(&self, queue_name: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.get(queue_name)
    }

    /// Every registered worker, in no particular order.
    pub fn get_all_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.all()
    }

    /// Close and unregister a queue. Unknown names are ignored.
    pub async fn close_queue(&self, name: &str) -> QueueResult<()> {
        self.queues.close(name).await;
        Ok(())
    }

    /// Stop and unregister a worker. Unknown names are ignored.
    pub async fn close_worker(&self, queue_name: &str) -> QueueResult<()> {
        self.workers.close(queue_name).await;
        Ok(())
    }

    /// Close every queue and worker, then the shared connection.
    ///
    /// `queueManagerClosed` is published once, after every removal event.
    /// Later calls do nothing.
    pub async fn close_all(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queue_names = self.queues.names();
        let worker_names = self.workers.names();

        let queues = join_all(queue_names.iter().map(|name| self.queues.close(name)));
        let workers = join_all(worker_names.iter().map(|name| self.workers.close(name)));
        futures::join!(queues, workers);

        let closed = self.backend.close().await;
        if let Err(e) = &closed {
            error!(error = %e, "Failed to close shared connection");
        }

        info!(
            queues = queue_names.len(),
            workers = worker_names.len(),
            "All queues and workers closed"
        );
        self.events.publish(ManagerEvent::QueueManagerClosed);

        closed
    }

    /// Whether [`QueueManager::close_all`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register `listener` for `event`.
    pub fn subscribe(&self, event: EventKind, listener: Listener) {
        self.events.subscribe(event, listener);
    }

    /// Remove `listener` from `event`. Returns `false` when it was not
    /// subscribed.
    pub fn unsubscribe(&self, event: EventKind, listener: &Listener) -> bool {
        self.events.unsubscribe(event, listener)
    }
}
