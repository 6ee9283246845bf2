//! Per-connection reassembly and dispatch.
//!
//! [`EventProcessor`] routes every decoded event to the connection worker
//! owning its identity string, creating workers on first sight. Each worker
//! runs on its own task with its own idle ticker and a bounded FIFO queue, so
//! events of one connection are always processed in arrival order while
//! connections proceed independently.
//!
//! Workers retire themselves after idling out; the processor owns the map and
//! only removes an entry when the retiring worker is still the current one.

pub mod parser;
pub mod worker;

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ProcessorConfig;
use crate::export::health::HealthMetrics;
use crate::sink::Sink;
use crate::tracer::event::Event;

pub use worker::{MessageMeta, WorkerStats, WorkerStatus};

use self::worker::Worker;

/// Resolves the peer address of a connection for display.
pub trait AddressResolver: Send + Sync {
    fn lookup(&self, pid: u32, fd: u32) -> Option<SocketAddrV4>;
}

/// Resolver that never knows an address.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl AddressResolver for NoopResolver {
    fn lookup(&self, _pid: u32, _fd: u32) -> Option<SocketAddrV4> {
        None
    }
}

/// Errors surfaced by [`EventProcessor`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("worker queue full for connection {uuid}")]
    QueueFull { uuid: String },

    #[error("event processor is shut down")]
    Closed,

    #[error("{remaining} connection workers still running after {timeout:?}")]
    ShutdownTimeout { timeout: Duration, remaining: usize },
}

/// Map entry for a live worker.
struct WorkerHandle {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// UUID -> worker map. The only state shared between workers.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    /// Removes `uuid` only if it still maps to worker `id`.
    pub(crate) fn remove_if_current(&self, uuid: &str, id: u64) -> bool {
        let mut workers = self.workers.lock();
        match workers.get(uuid) {
            Some(handle) if handle.id == id => {
                workers.remove(uuid);
                true
            }
            _ => false,
        }
    }
}

/// Everything a worker needs besides its own queue.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) cfg: ProcessorConfig,
    pub(crate) color: bool,
    pub(crate) resolver: Arc<dyn AddressResolver>,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) metrics: Option<Arc<HealthMetrics>>,
    pub(crate) registry: Arc<WorkerRegistry>,
}

/// Dispatcher from decoded events to connection workers.
pub struct EventProcessor {
    ctx: WorkerContext,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl EventProcessor {
    pub fn new(
        cfg: ProcessorConfig,
        resolver: Arc<dyn AddressResolver>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                cfg,
                color: false,
                resolver,
                sink,
                metrics: None,
                registry: Arc::new(WorkerRegistry::default()),
            },
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Report worker and message counters to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.ctx.metrics = Some(metrics);
        self
    }

    /// Render with ANSI colors.
    pub fn with_color(mut self, color: bool) -> Self {
        self.ctx.color = color;
        self
    }

    /// Deliver `event` to its connection worker, waiting while the worker's
    /// queue is full.
    pub async fn route(&self, event: Event) -> Result<(), DispatchError> {
        let uuid = event.uuid();
        let mut event = event;

        loop {
            let (id, tx) = self.get_or_create_worker(&uuid)?;

            match tx.send(event).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    // The worker retired between lookup and send.
                    self.ctx.registry.remove_if_current(&uuid, id);
                    event = returned;
                }
            }
        }
    }

    /// Deliver `event` without waiting. Fails with [`DispatchError::QueueFull`]
    /// when the worker's queue has no room.
    pub fn try_route(&self, event: Event) -> Result<(), DispatchError> {
        let uuid = event.uuid();
        let mut event = event;

        loop {
            let (id, tx) = self.get_or_create_worker(&uuid)?;

            match tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if let Some(m) = &self.ctx.metrics {
                        m.queue_full.inc();
                    }
                    return Err(DispatchError::QueueFull { uuid });
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    self.ctx.registry.remove_if_current(&uuid, id);
                    event = returned;
                }
            }
        }
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.ctx.registry.workers.lock().len()
    }

    /// Whether a worker currently owns `uuid`.
    pub fn contains(&self, uuid: &str) -> bool {
        self.ctx.registry.workers.lock().contains_key(uuid)
    }

    /// Cancel every worker and wait up to `timeout` for them to drain and
    /// retire. Routing fails with [`DispatchError::Closed`] afterwards.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DispatchError> {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            let remaining = self.tracker.len();
            tracing::warn!(remaining, ?timeout, "connection workers did not drain in time");
            return Err(DispatchError::ShutdownTimeout { timeout, remaining });
        }

        tracing::info!("event processor stopped");
        Ok(())
    }

    fn get_or_create_worker(
        &self,
        uuid: &str,
    ) -> Result<(u64, mpsc::Sender<Event>), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }

        let registry = &self.ctx.registry;
        let mut workers = registry.workers.lock();

        if let Some(handle) = workers.get(uuid) {
            if !handle.tx.is_closed() {
                return Ok((handle.id, handle.tx.clone()));
            }
        }

        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.ctx.cfg.queue_capacity);
        workers.insert(
            uuid.to_string(),
            WorkerHandle {
                id,
                tx: tx.clone(),
            },
        );
        drop(workers);

        let worker = Worker::new(uuid.to_string(), id, rx, self.ctx.clone());
        self.tracker.spawn(worker.run(self.cancel.child_token()));

        if let Some(m) = &self.ctx.metrics {
            m.workers_created.inc();
            m.workers_active.inc();
        }
        tracing::debug!(uuid, id, "connection worker created");

        Ok((id, tx))
    }
}
