use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cooperative pause flag shared by a session's driver and its streams.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate closes. Returns `false` if `cancel` fired first.
    pub async fn wait_until_paused(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            paused = rx.wait_for(|paused| *paused) => paused.is_ok(),
        }
    }

    /// Wait while paused. Returns `false` if `cancel` fired first.
    pub async fn wait_until_running(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}
