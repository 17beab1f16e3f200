//! Generic per-key coalescing work queue.
//!
//! One instantiation per component (Binder's `bKey`, Tunneler's `TunnelKey`,
//! Querier's `QuerierWorkKey`, see spec §4.5.1 and §9). Enqueuing a key that
//! is already pending or in flight is a no-op; `acquire` blocks until a key
//! with no in-flight job is available; `done` must be called exactly once
//! per successful `acquire` to let a subsequent enqueue for that key run.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueState<K> {
    pending: VecDeque<K>,
    in_progress: HashSet<K>,
}

/// Returned by `acquire` when the queue has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_progress: HashSet::new(),
            }),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Adds `key` to the queue unless it is already pending.
    pub fn enqueue(&self, key: K) {
        let mut state = self.state.lock();
        if state.pending.iter().any(|k| *k == key) {
            return;
        }
        state.pending.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Blocks until a key with no in-flight job is available, or the queue
    /// is cancelled.
    pub async fn acquire(&self) -> Result<K, Cancelled> {
        loop {
            {
                let mut state = self.state.lock();
                let pos = state
                    .pending
                    .iter()
                    .position(|k| !state.in_progress.contains(k));
                if let Some(idx) = pos {
                    let key = state.pending.remove(idx).expect("index in bounds");
                    state.in_progress.insert(key.clone());
                    return Ok(key);
                }
            }
            if self.cancelled.load(Ordering::Acquire) {
                return Err(Cancelled);
            }
            self.notify.notified().await;
            if self.cancelled.load(Ordering::Acquire) {
                return Err(Cancelled);
            }
        }
    }

    /// Marks `key` as no longer in flight, unblocking any pending job for it.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.in_progress.remove(key);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wakes every waiting `acquire` with `Err(Cancelled)`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
