//! Task registry for the subsystem's background work.
//!
//! Tracks spawned tokio tasks and ties them to one [`InterruptToken`] so a
//! single `shutdown` stops DKG phase handlers and periodic maintenance
//! alike.
//!
//! # Blocking Lock Usage
//!
//! Uses `parking_lot::Mutex` for JoinHandle storage because:
//! 1. Operations are O(1) push or O(n) drain (shutdown only)
//! 2. Lock is never held across `.await` points

use crate::interrupt::InterruptToken;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owner of all long-running subsystem tasks.
#[derive(Debug)]
pub struct TaskRegistry {
    interrupt: InterruptToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Registry bound to `interrupt`.
    pub fn new(interrupt: InterruptToken) -> Self {
        Self {
            interrupt,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token shared with spawned tasks.
    pub fn interrupt_token(&self) -> InterruptToken {
        self.interrupt.clone()
    }

    /// Spawn a task that is dropped at the next await point after interrupt.
    pub fn spawn_cancellable<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.interrupt.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.interrupted() => {}
                _ = fut => {}
            }
        });
        self.handles.lock().push(handle);
    }

    /// Run `f` every `interval` until it returns `false` or the interrupt fires.
    pub fn spawn_interval_until<F, Fut>(&self, interval: Duration, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let token = self.interrupt.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.interrupted() => break,
                    _ = ticker.tick() => {
                        if !f().await {
                            break;
                        }
                    }
                }
            }
        });
        self.handles.lock().push(handle);
    }

    /// Number of tracked tasks that have not finished.
    pub fn active_tasks(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Trigger the interrupt and wait for every task to wind down.
    pub async fn shutdown(&self) {
        self.interrupt.interrupt();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "Background task panicked");
                }
            }
        }
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.interrupt.interrupt();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}
