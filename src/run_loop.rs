//! Control-thread event loop.
//!
//! `ControlLoop` is owned by the control (UI) thread. Other threads marshal
//! work onto it through a cloneable [`MainHandle`]. Each loop iteration runs
//! every ready job, then notifies `BEFORE_WAITING` observers (the idle point),
//! then waits for the next job. Observers are registered through the
//! [`RunLoopHost`] trait so a host with its own native loop can stand in.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::queue_pool::Job;

/// Set of loop activities an observer wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunLoopActivity(u8);

impl RunLoopActivity {
    /// The loop has run out of ready work and is about to block.
    pub const BEFORE_WAITING: Self = Self(1 << 0);
    /// The loop is about to exit.
    pub const EXIT: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for RunLoopActivity {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

pub type ObserverCallback = Arc<dyn Fn(RunLoopActivity) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Capability to observe a control loop's idle and exit points.
pub trait RunLoopHost: Send + Sync {
    fn add_observer(&self, activities: RunLoopActivity, callback: ObserverCallback) -> ObserverId;

    /// Returns false if `id` was not registered.
    fn remove_observer(&self, id: ObserverId) -> bool;
}

struct ObserverEntry {
    id: ObserverId,
    activities: RunLoopActivity,
    callback: ObserverCallback,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<ObserverEntry>,
}

/// `Send + Sync` handle for scheduling work onto the control thread.
#[derive(Clone)]
pub struct MainHandle {
    tx: cb::Sender<Job>,
    observers: Arc<Mutex<Observers>>,
    control_thread: ThreadId,
}

impl fmt::Debug for MainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainHandle")
            .field("control_thread", &self.control_thread)
            .finish_non_exhaustive()
    }
}

impl MainHandle {
    /// Run `job` on the control thread during its next loop iteration.
    pub fn exec_async<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            debug!("control loop gone, main-thread job dropped");
        }
    }

    pub fn is_control_thread(&self) -> bool {
        std::thread::current().id() == self.control_thread
    }

    fn notify(&self, activity: RunLoopActivity) {
        let callbacks: Vec<ObserverCallback> = self
            .observers
            .lock()
            .entries
            .iter()
            .filter(|e| e.activities.intersects(activity))
            .map(|e| Arc::clone(&e.callback))
            .collect();
        // Lock released: callbacks may register or remove observers.
        for callback in callbacks {
            callback(activity);
        }
    }
}

impl RunLoopHost for MainHandle {
    fn add_observer(&self, activities: RunLoopActivity, callback: ObserverCallback) -> ObserverId {
        let mut observers = self.observers.lock();
        observers.next_id += 1;
        let id = ObserverId(observers.next_id);
        observers.entries.push(ObserverEntry {
            id,
            activities,
            callback,
        });
        debug!(observer = id.0, "run loop observer added");
        id
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.entries.len();
        observers.entries.retain(|e| e.id != id);
        observers.entries.len() != before
    }
}

/// The control thread's loop. Create it on the thread that will drive it.
pub struct ControlLoop {
    rx: cb::Receiver<Job>,
    handle: MainHandle,
}

impl fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop")
            .field("pending", &self.rx.len())
            .finish_non_exhaustive()
    }
}

impl Default for ControlLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLoop {
    pub fn new() -> Self {
        let (tx, rx) = cb::unbounded();
        Self {
            rx,
            handle: MainHandle {
                tx,
                observers: Arc::new(Mutex::new(Observers::default())),
                control_thread: std::thread::current().id(),
            },
        }
    }

    pub fn handle(&self) -> MainHandle {
        self.handle.clone()
    }

    /// Run every job that is ready right now. Returns how many ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// One loop iteration: drain, idle point, then wait up to `timeout` for more work.
    /// Returns true if any job ran.
    pub fn run_once(&self, timeout: Duration) -> bool {
        let mut ran = self.drain();
        trace!(jobs = ran, "control loop before waiting");
        self.handle.notify(RunLoopActivity::BEFORE_WAITING);

        // Idle observers may have queued new work; pick it up without sleeping.
        if !self.rx.is_empty() {
            return ran > 0;
        }
        if let Ok(job) = self.rx.recv_timeout(timeout) {
            job();
            ran += 1;
        }
        ran > 0
    }

    /// Iterate until `done` holds or `timeout` elapses. Returns whether `done` held.
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_once((deadline - now).min(Duration::from_millis(10)));
        }
    }

    /// Fire the synthetic idle point without draining or waiting.
    pub fn notify_idle(&self) {
        self.handle.notify(RunLoopActivity::BEFORE_WAITING);
    }

    /// Drain remaining work and notify `EXIT` observers.
    pub fn exit(&self) {
        self.drain();
        debug!("control loop exiting");
        self.handle.notify(RunLoopActivity::EXIT);
    }
}

impl RunLoopHost for ControlLoop {
    fn add_observer(&self, activities: RunLoopActivity, callback: ObserverCallback) -> ObserverId {
        self.handle.add_observer(activities, callback)
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        self.handle.remove_observer(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn activity_sets_combine() {
        let both = RunLoopActivity::BEFORE_WAITING | RunLoopActivity::EXIT;
        assert!(both.contains(RunLoopActivity::EXIT));
        assert!(both.contains(RunLoopActivity::BEFORE_WAITING));
        assert!(!RunLoopActivity::EXIT.intersects(RunLoopActivity::BEFORE_WAITING));
    }

    #[test]
    fn jobs_from_other_threads_run_on_control_thread() {
        let control = ControlLoop::new();
        let handle = control.handle();
        let observed = Arc::new(Mutex::new(None));

        let remote = handle.clone();
        let observed_clone = Arc::clone(&observed);
        std::thread::spawn(move || {
            let check = remote.clone();
            remote.exec_async(move || {
                *observed_clone.lock() = Some(check.is_control_thread());
            });
        })
        .join()
        .unwrap();

        assert!(control.run_until(|| observed.lock().is_some(), Duration::from_secs(5)));
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn idle_observer_fires_after_ready_jobs() {
        let control = ControlLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_obs = Arc::clone(&log);
        control.add_observer(
            RunLoopActivity::BEFORE_WAITING,
            Arc::new(move |_| log_obs.lock().push("idle")),
        );
        for _ in 0..3 {
            let log_job = Arc::clone(&log);
            control.handle().exec_async(move || log_job.lock().push("job"));
        }

        control.run_once(Duration::from_millis(1));
        assert_eq!(*log.lock(), vec!["job", "job", "job", "idle"]);
    }

    #[test]
    fn exit_notifies_only_exit_observers() {
        let control = ControlLoop::new();
        let idle = Arc::new(AtomicUsize::new(0));
        let exit = Arc::new(AtomicUsize::new(0));

        let idle_clone = Arc::clone(&idle);
        control.add_observer(
            RunLoopActivity::BEFORE_WAITING,
            Arc::new(move |_| {
                idle_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let exit_clone = Arc::clone(&exit);
        control.add_observer(
            RunLoopActivity::EXIT,
            Arc::new(move |a| {
                assert_eq!(a, RunLoopActivity::EXIT);
                exit_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        control.exit();
        assert_eq!(idle.load(Ordering::SeqCst), 0);
        assert_eq!(exit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_observer_is_silent() {
        let control = ControlLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = control.add_observer(
            RunLoopActivity::BEFORE_WAITING,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        control.notify_idle();
        assert!(control.remove_observer(id));
        assert!(!control.remove_observer(id));
        control.notify_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn work_queued_by_idle_observer_runs_next_iteration() {
        let control = ControlLoop::new();
        let handle = control.handle();
        let queued = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let queued_clone = Arc::clone(&queued);
        let ran_clone = Arc::clone(&ran);
        control.add_observer(
            RunLoopActivity::BEFORE_WAITING,
            Arc::new(move |_| {
                if queued_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    let ran = Arc::clone(&ran_clone);
                    handle.exec_async(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }),
        );

        assert!(!control.run_once(Duration::from_millis(1)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        assert!(control.run_once(Duration::from_millis(1)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_until_times_out() {
        let control = ControlLoop::new();
        assert!(!control.run_until(|| false, Duration::from_millis(30)));
    }
}
