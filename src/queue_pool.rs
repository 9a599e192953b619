//! Background render queues.
//! A fixed set of serial (FIFO) worker threads, picked round-robin per
//! submission, plus a single low-priority queue that only drops released
//! resources off the control thread.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam_channel as cb;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RenderConfig;
use crate::error::{RenderError, RenderResult};

/// Unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool size for a given processor count: clamp(parallelism, 1, max).
pub fn queue_count_for(parallelism: usize, max: usize) -> usize {
    parallelism.clamp(1, max.max(1))
}

fn detected_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// One worker thread draining its own channel in submission order.
pub struct SerialQueue {
    name: String,
    tx: cb::Sender<Job>,
    _thread: JoinHandle<()>,
}

impl SerialQueue {
    pub fn spawn(name: String) -> RenderResult<Self> {
        let (tx, rx) = cb::unbounded::<Job>();
        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_serial_loop(&thread_name, rx))
            .map_err(|source| RenderError::Spawn {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            tx,
            _thread: thread,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Never blocks.
    pub fn exec_async(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!(queue = %self.name, "serial queue closed, job dropped");
        }
    }
}

fn run_serial_loop(name: &str, rx: cb::Receiver<Job>) {
    debug!(queue = name, "serial queue started");
    loop {
        match rx.recv() {
            Ok(job) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    error!(queue = name, panic = panic_message(&panic), "render job panicked");
                }
            }
            Err(cb::RecvError) => {
                debug!(queue = name, "serial queue channel closed, exiting");
                break;
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

/// Fixed pool of serial render queues with an atomic round-robin cursor.
pub struct WorkerQueuePool {
    queues: Vec<SerialQueue>,
    cursor: AtomicI32,
}

static SHARED_POOL: OnceLock<Arc<WorkerQueuePool>> = OnceLock::new();
static SHARED_POOL_INIT: Mutex<()> = Mutex::new(());

impl WorkerQueuePool {
    /// Build a pool sized to this machine's parallelism.
    pub fn new(config: &RenderConfig) -> RenderResult<Self> {
        Self::with_queue_count(
            config,
            queue_count_for(detected_parallelism(), config.max_queue_count),
        )
    }

    /// Build a pool with an explicit size, still clamped to the configured maximum.
    pub fn with_queue_count(config: &RenderConfig, count: usize) -> RenderResult<Self> {
        config.validate()?;
        let count = queue_count_for(count, config.max_queue_count);
        let queues = (0..count)
            .map(|i| SerialQueue::spawn(format!("{}-{i}", config.worker_name_prefix)))
            .collect::<RenderResult<Vec<_>>>()?;

        info!(queues = count, prefix = %config.worker_name_prefix, "render queue pool built");

        Ok(Self {
            queues,
            cursor: AtomicI32::new(0),
        })
    }

    /// Process-wide pool, constructed exactly once on first use.
    pub fn shared() -> RenderResult<Arc<Self>> {
        if let Some(pool) = SHARED_POOL.get() {
            return Ok(Arc::clone(pool));
        }
        let _init = SHARED_POOL_INIT.lock();
        if let Some(pool) = SHARED_POOL.get() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Self::new(&RenderConfig::from_env())?);
        Ok(Arc::clone(SHARED_POOL.get_or_init(|| pool)))
    }

    /// Idempotent warm-up of the shared pool.
    pub fn initialize() -> RenderResult<()> {
        Self::shared().map(|_| ())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Next queue index: increment-and-fetch, absolute value, modulo pool size.
    /// The cursor wraps through negative values; the result is always in range.
    pub fn next_index(&self) -> usize {
        let cur = self.cursor.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        cur.unsigned_abs() as usize % self.queues.len()
    }

    /// Enqueue `job` onto the next queue, returning the index that received it.
    pub fn submit<F>(&self, job: F) -> usize
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.next_index();
        self.queues[index].exec_async(Box::new(job));
        index
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(SerialQueue::name)
    }

    #[cfg(test)]
    fn set_cursor(&self, value: i32) {
        self.cursor.store(value, Ordering::SeqCst);
    }
}

/// Low-priority background queue whose only job is dropping values.
pub struct ReleaseQueue {
    queue: SerialQueue,
}

impl ReleaseQueue {
    pub fn new(config: &RenderConfig) -> RenderResult<Self> {
        Ok(Self {
            queue: SerialQueue::spawn(config.release_queue_name.clone())?,
        })
    }

    /// Move `value` to the release thread and drop it there.
    pub fn release<T: Send + 'static>(&self, value: T) {
        self.queue.exec_async(Box::new(move || drop(value)));
    }
}
