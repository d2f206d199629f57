//! De-duplicating work queue of identity keys
//!
//! A key is in at most one of three places:
//! - `queue`: waiting to be handed out (always mirrored in `dirty`)
//! - `processing`: handed out by [`WorkQueue::get`], not yet finished
//! - both `processing` and `dirty`: re-added while in flight, goes back on
//!   the queue when processing finishes
//!
//! Adding a key that is already waiting is a no-op, so a burst of events for
//! one object collapses into a single rebuild.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Set-backed FIFO of pending keys with at-least-once processing.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as needing processing.
    ///
    /// Ignored once the queue is shutting down.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and every waiting key has
    /// been handed out.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`.
    ///
    /// If the key was added again while it was being processed it goes back
    /// on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Finish processing `key` and put it straight back on the queue.
    ///
    /// Used when processing failed. After shutdown a failed key is only kept
    /// if it was re-added before the queue closed; returns whether the key
    /// was queued again.
    pub fn requeue(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.processing.remove(key);
        let was_dirty = state.dirty.contains(key);
        if state.shutting_down && !was_dirty {
            return false;
        }
        if !was_dirty {
            state.dirty.insert(key.to_string());
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Stop accepting new keys and wake every waiter.
    ///
    /// Keys already waiting still drain through [`WorkQueue::get`].
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
