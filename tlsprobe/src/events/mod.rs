//! Process lifecycle notifications
//!
//! The manager consumes exec/exit events through [`ProcessEventSource`] and
//! does not care how they are produced. [`ProcPoller`] is the procfs-polling
//! implementation used by the `tlsprobe` binary.

pub mod procfs_poller;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::{ManagerError, Pid};

pub use procfs_poller::ProcPoller;

/// Callback invoked with the pid of a process that started or exited
pub type ProcessCallback = Arc<dyn Fn(Pid) + Send + Sync>;

/// Producer of process start/exit events
pub trait ProcessEventSource: Send + Sync {
    /// Call `callback` for every process that executes a new image
    ///
    /// # Errors
    /// Returns [`ManagerError::Subscribe`] if the source cannot deliver events.
    fn subscribe_exec(&self, callback: ProcessCallback) -> Result<Subscription, ManagerError>;

    /// Call `callback` for every process that exits
    ///
    /// # Errors
    /// Returns [`ManagerError::Subscribe`] if the source cannot deliver events.
    fn subscribe_exit(&self, callback: ProcessCallback) -> Result<Subscription, ManagerError>;

    /// Which of `pids` are no longer running
    fn find_dead_processes(&self, pids: &HashSet<Pid>) -> HashSet<Pid>;

    /// Stop producing events. Must be idempotent.
    fn stop(&self);
}

/// Registration of a callback; dropping it unsubscribes
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}

/// Set of callbacks for one kind of event
#[derive(Clone, Default)]
pub struct Subscribers {
    callbacks: Arc<Mutex<HashMap<u64, ProcessCallback>>>,
    next_id: Arc<AtomicU64>,
}

impl Subscribers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: ProcessCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).insert(id, callback);

        let callbacks = Arc::clone(&self.callbacks);
        Subscription::new(move || {
            callbacks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        })
    }

    /// Invoke every callback with `pid`
    ///
    /// Callbacks run without the subscriber lock held, so they may subscribe
    /// or unsubscribe themselves.
    pub fn notify(&self, pid: Pid) {
        let callbacks: Vec<ProcessCallback> =
            self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        for callback in callbacks {
            callback(pid);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
