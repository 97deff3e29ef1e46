//! Stop-at-first-match coordination
//!
//! Fans concurrent request tasks out while guaranteeing that at most one
//! match callback wins when stop-at-first-match is enabled, and that every
//! task observes cancellation before starting a transport call once a
//! match fired.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify, Semaphore};

use crate::error::ErrorX;

/// Coordinator shared by the tasks of one fan-out.
///
/// The blocking variant caps concurrent starts with a semaphore of
/// `max_workers`; the non-blocking variant only counts outstanding tasks,
/// for modes that pre-size their fan-out.
pub struct SpmHandler {
    semaphore: Option<Arc<Semaphore>>,
    stop_at_first_match: bool,
    matched: AtomicBool,
    gate_fired: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    outstanding: AtomicUsize,
    idle: Notify,
    results: Mutex<Vec<ErrorX>>,
}

impl SpmHandler {
    /// Blocking variant: `acquire()` suspends once `max_workers` slots are
    /// taken.
    pub fn blocking(max_workers: usize, stop_at_first_match: bool) -> Arc<Self> {
        Arc::new(Self::build(
            Some(Arc::new(Semaphore::new(max_workers.max(1)))),
            stop_at_first_match,
        ))
    }

    /// Non-blocking variant: slots are counted but starts are never capped.
    pub fn non_blocking(stop_at_first_match: bool) -> Arc<Self> {
        Arc::new(Self::build(None, stop_at_first_match))
    }

    fn build(semaphore: Option<Arc<Semaphore>>, stop_at_first_match: bool) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            semaphore,
            stop_at_first_match,
            matched: AtomicBool::new(false),
            gate_fired: AtomicBool::new(false),
            cancel_tx,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Takes a slot, suspending when the blocking variant is saturated.
    pub async fn acquire(&self) {
        if let Some(semaphore) = &self.semaphore {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("spm semaphore closed");
            permit.forget();
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Frees a slot taken with `acquire`.
    pub fn release(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.add_permits(1);
        }
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Signals "found": flips the match flag and cancels pending tasks.
    pub fn trigger(&self) {
        self.matched.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
    }

    /// Observable: has a first match been found.
    pub fn found_first_match(&self) -> bool {
        self.matched.load(Ordering::SeqCst)
    }

    /// True once cancellation has been signalled. Tasks observing this
    /// before their transport call must return without starting one.
    pub fn is_done(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Receiver resolving when cancellation is signalled, for use inside
    /// `select!`.
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Invokes `f` exactly once across all concurrent callers when
    /// stop-at-first-match is enabled; otherwise always invokes it.
    pub fn match_callback(&self, f: impl FnOnce()) {
        if self.stop_at_first_match {
            if !self.gate_fired.swap(true, Ordering::SeqCst) {
                f();
            }
        } else {
            f();
        }
    }

    /// Records a task outcome in send order.
    pub fn send_result(&self, result: Result<(), ErrorX>) {
        if let Err(err) = result {
            self.results.lock().expect("spm results poisoned").push(err);
        }
    }

    /// Blocks until every acquired slot has been released.
    pub async fn wait(&self) {
        loop {
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before re-checking, otherwise a release
            // landing between the check and the await is lost.
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Errors accumulated by tasks, joined in send order. Cancellations
    /// are not recorded and so never appear here.
    pub fn combined_results(&self) -> Option<ErrorX> {
        let results = std::mem::take(&mut *self.results.lock().expect("spm results poisoned"));
        ErrorX::combine(results)
    }
}
