//! Cooperative cancellation for per-connection background work.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancel flag; every clone observes the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) { self.tx.send_replace(true); }

    pub fn is_cancelled(&self) -> bool { *self.tx.borrow() }

    /// Resolves once `cancel` has been called (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    /// Sleep for `dur`; returns false when cancelled first.
    pub async fn sleep(&self, dur: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(dur) => true,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self { Self::new() }
}
