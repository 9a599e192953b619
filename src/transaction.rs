//! Idle-point action coalescing.
//!
//! A [`Transaction`] pairs a retained target with a named action. Committing
//! it to a [`Coalescer`] schedules the action to run once before the control
//! loop next goes idle; committing the same `(target, action)` pair again in
//! the same cycle is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::run_loop::{ObserverId, RunLoopActivity, RunLoopHost};

/// Identity of a pending action: target address plus action name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    target: usize,
    action: &'static str,
}

type Perform = Box<dyn FnOnce() + Send + 'static>;

pub struct Transaction {
    key: TransactionKey,
    perform: Perform,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// `target` is retained until the flush that performs the action.
    pub fn new<T, F>(target: &Arc<T>, action: &'static str, perform: F) -> Self
    where
        T: Send + Sync + ?Sized + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        let key = TransactionKey {
            target: Arc::as_ptr(target).cast::<()>() as usize,
            action,
        };
        let target = Arc::clone(target);
        Self {
            key,
            perform: Box::new(move || perform(target)),
        }
    }
}

/// Pending transactions for the current idle cycle.
pub struct Coalescer {
    host: Arc<dyn RunLoopHost>,
    pending: Arc<Mutex<HashMap<TransactionKey, Transaction>>>,
    observer: OnceLock<ObserverId>,
}

impl fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("pending", &self.pending_len())
            .field("installed", &self.observer.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Coalescer {
    pub fn new(host: Arc<dyn RunLoopHost>) -> Self {
        Self {
            host,
            pending: Arc::new(Mutex::new(HashMap::new())),
            observer: OnceLock::new(),
        }
    }

    /// Add `tx` to this cycle unless an equal `(target, action)` is already pending.
    /// Returns true if it was added.
    pub fn commit(&self, tx: Transaction) -> bool {
        self.install_observer();
        let key = tx.key;
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return false;
        }
        pending.insert(key, tx);
        debug!(action = key.action, pending = pending.len(), "transaction committed");
        true
    }

    /// Swap out the pending set and perform each entry once. Returns how many ran.
    pub fn flush(&self) -> usize {
        flush_pending(&self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_installed(&self) -> bool {
        self.observer.get().is_some()
    }

    fn install_observer(&self) {
        self.observer.get_or_init(|| {
            let pending = Arc::clone(&self.pending);
            let id = self.host.add_observer(
                RunLoopActivity::BEFORE_WAITING | RunLoopActivity::EXIT,
                Arc::new(move |_| {
                    flush_pending(&pending);
                }),
            );
            info!("transaction idle observer installed");
            id
        });
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        if let Some(id) = self.observer.get() {
            self.host.remove_observer(*id);
        }
    }
}

fn flush_pending(pending: &Mutex<HashMap<TransactionKey, Transaction>>) -> usize {
    let current = std::mem::take(&mut *pending.lock());
    if current.is_empty() {
        return 0;
    }
    let count = current.len();
    for (_, tx) in current {
        (tx.perform)();
    }
    debug!(performed = count, "transactions flushed");
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_loop::ControlLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter(AtomicUsize);

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }

        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn bump_tx(target: &Arc<Counter>, action: &'static str) -> Transaction {
        Transaction::new(target, action, |c: Arc<Counter>| c.bump())
    }

    #[test]
    fn duplicate_commit_runs_once() {
        let control = ControlLoop::new();
        let coalescer = Coalescer::new(Arc::new(control.handle()));
        let target = Counter::new();

        assert!(coalescer.commit(bump_tx(&target, "layout")));
        assert!(!coalescer.commit(bump_tx(&target, "layout")));
        assert_eq!(coalescer.pending_len(), 1);

        control.notify_idle();
        assert_eq!(target.get(), 1);
        assert_eq!(coalescer.pending_len(), 0);

        control.notify_idle();
        assert_eq!(target.get(), 1);
    }

    #[test]
    fn distinct_targets_sharing_an_action_both_run() {
        let coalescer = Coalescer::new(Arc::new(ControlLoop::new().handle()));
        let a = Counter::new();
        let b = Counter::new();

        assert!(coalescer.commit(bump_tx(&a, "display")));
        assert!(coalescer.commit(bump_tx(&b, "display")));
        assert_eq!(coalescer.flush(), 2);
        assert_eq!((a.get(), b.get()), (1, 1));
    }

    #[test]
    fn distinct_actions_on_one_target_both_run() {
        let coalescer = Coalescer::new(Arc::new(ControlLoop::new().handle()));
        let target = Counter::new();
        coalescer.commit(bump_tx(&target, "display"));
        coalescer.commit(bump_tx(&target, "layout"));
        assert_eq!(coalescer.flush(), 2);
        assert_eq!(target.get(), 2);
    }

    #[test]
    fn commit_after_flush_belongs_to_next_cycle() {
        let control = ControlLoop::new();
        let coalescer = Coalescer::new(Arc::new(control.handle()));
        let target = Counter::new();

        coalescer.commit(bump_tx(&target, "display"));
        control.notify_idle();
        assert!(coalescer.commit(bump_tx(&target, "display")));
        control.notify_idle();
        assert_eq!(target.get(), 2);
    }

    #[test]
    fn commit_made_while_flushing_waits_for_next_cycle() {
        let control = ControlLoop::new();
        let coalescer = Arc::new(Coalescer::new(Arc::new(control.handle())));
        let target = Counter::new();

        let inner = Arc::clone(&coalescer);
        coalescer.commit(Transaction::new(&target, "display", move |c: Arc<Counter>| {
            c.bump();
            // same pair, committed from inside the running flush
            assert!(inner.commit(bump_tx(&c, "display")));
        }));

        control.notify_idle();
        assert_eq!(target.get(), 1);
        assert_eq!(coalescer.pending_len(), 1);

        control.notify_idle();
        assert_eq!(target.get(), 2);
        assert_eq!(coalescer.pending_len(), 0);

        control.notify_idle();
        assert_eq!(target.get(), 2);
    }

    #[test]
    fn commits_racing_flushes_each_run_exactly_once() {
        let coalescer = Arc::new(Coalescer::new(Arc::new(ControlLoop::new().handle())));
        let target = Counter::new();
        let accepted = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let committers: Vec<_> = (0..4)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let target = Arc::clone(&target);
                let accepted = Arc::clone(&accepted);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        if coalescer.commit(bump_tx(&target, "display")) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        let mut flushed = 0;
        for _ in 0..200 {
            flushed += coalescer.flush();
            std::thread::yield_now();
        }
        stop.store(true, Ordering::SeqCst);
        for h in committers {
            h.join().unwrap();
        }
        flushed += coalescer.flush();

        assert_eq!(coalescer.pending_len(), 0);
        assert_eq!(flushed, accepted.load(Ordering::SeqCst));
        assert_eq!(target.get(), flushed);
    }

    #[test]
    fn observer_installed_lazily_once() {
        let control = ControlLoop::new();
        let coalescer = Coalescer::new(Arc::new(control.handle()));
        assert!(!coalescer.is_installed());

        let target = Counter::new();
        for action in ["a", "b", "c"] {
            coalescer.commit(bump_tx(&target, action));
        }
        assert!(coalescer.is_installed());

        // a second observer would run each action twice
        control.notify_idle();
        assert_eq!(target.get(), 3);
    }

    #[test]
    fn exit_flushes_pending() {
        let control = ControlLoop::new();
        let coalescer = Coalescer::new(Arc::new(control.handle()));
        let target = Counter::new();
        coalescer.commit(bump_tx(&target, "display"));
        control.exit();
        assert_eq!(target.get(), 1);
    }

    #[test]
    fn target_is_retained_until_flush() {
        let coalescer = Coalescer::new(Arc::new(ControlLoop::new().handle()));
        let target = Counter::new();
        let weak = Arc::downgrade(&target);
        coalescer.commit(bump_tx(&target, "display"));
        drop(target);
        assert!(weak.upgrade().is_some());
        coalescer.flush();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn concurrent_commits_of_one_pair_run_once() {
        let control = ControlLoop::new();
        let coalescer = Arc::new(Coalescer::new(Arc::new(control.handle())));
        let target = Counter::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let target = Arc::clone(&target);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        coalescer.commit(bump_tx(&target, "display"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        control.run_once(Duration::from_millis(1));
        assert_eq!(target.get(), 1);
    }
}
