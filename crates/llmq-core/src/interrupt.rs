//! Process-wide interrupt flag.
//!
//! Cloned into every long-running task. Synchronous code (worker-pool jobs,
//! cache populators) polls [`InterruptToken::is_interrupted`]; async code
//! awaits [`InterruptToken::interrupted`] or sleeps through
//! [`InterruptToken::sleep`], which wakes early on interrupt.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared, resettable interrupt flag.
#[derive(Debug, Clone)]
pub struct InterruptToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl InterruptToken {
    /// A fresh, un-triggered token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Trigger the interrupt for every clone.
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    /// Clear the flag so the subsystem can be started again.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Whether the interrupt has been triggered.
    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the interrupt is triggered.
    pub async fn interrupted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if woken by the interrupt.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_interrupted() {
            return false;
        }
        tokio::select! {
            _ = self.interrupted() => false,
            _ = tokio::time::sleep(duration) => !self.is_interrupted(),
        }
    }
}

impl Default for InterruptToken {
    fn default() -> Self {
        Self::new()
    }
}
