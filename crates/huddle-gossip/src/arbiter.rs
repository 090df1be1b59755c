//! Cooperative task scheduler
//!
//! Background loops ask [`Arbiter::should_run`] before each round and exit
//! cleanly once shutdown begins. Tracked tasks are aborted on shutdown;
//! one-shot timers are deliberately left untracked and their handlers must
//! tolerate firing against empty state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Grants run permission to background tasks and tears them down on
/// shutdown.
pub struct Arbiter {
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Arbiter {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether background work may continue.
    pub fn should_run(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn a tracked task. No-op once shutdown has begun.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.should_run() {
            return;
        }
        let handle = tokio::spawn(future);
        self.tasks.lock().expect("arbiter lock poisoned").push(handle);
    }

    /// Revoke run permission and abort all tracked tasks.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let handles: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("arbiter lock poisoned").drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
