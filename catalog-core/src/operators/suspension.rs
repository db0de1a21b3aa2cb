//! Host-controlled pause switch for background loading.
//!
//! While suspended, every load waits at its entry point until resumed or
//! cancelled. Work already past that point runs to completion.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CatalogError, CatalogResult};

#[derive(Debug, Clone)]
pub struct Suspension {
    suspended: Arc<watch::Sender<bool>>,
}

impl Default for Suspension {
    fn default() -> Self {
        Self::new()
    }
}

impl Suspension {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            suspended: Arc::new(tx),
        }
    }

    pub fn suspend(&self) {
        self.suspended.send_replace(true);
        info!(marker = "LOAD_GATE", operation_type = "suspend", "Background loading suspended");
    }

    pub fn resume(&self) {
        self.suspended.send_replace(false);
        info!(marker = "LOAD_GATE", operation_type = "resume", "Background loading resumed");
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    /// Wait until loading may proceed. Fails with `Cancelled` if `token` fires first.
    pub async fn can_continue(&self, what: &str, token: &CancellationToken) -> CatalogResult<()> {
        if token.is_cancelled() {
            return Err(CatalogError::cancelled(what));
        }

        let mut rx = self.suspended.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(());
        }

        debug!(
            marker = "LOAD_GATE",
            operation_type = "wait_suspended",
            target_node = what,
            "Waiting for loading to resume"
        );

        tokio::select! {
            () = token.cancelled() => Err(CatalogError::cancelled(what)),
            changed = rx.wait_for(|suspended| !*suspended) => {
                changed.map(|_| ()).map_err(|_| CatalogError::cancelled(what))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn passes_straight_through_when_running() {
        let gate = Suspension::new();
        let token = CancellationToken::new();
        assert!(gate.can_continue("x", &token).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_resumed() {
        let gate = Suspension::new();
        gate.suspend();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.can_continue("x", &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancellation_releases_a_suspended_waiter() {
        let gate = Suspension::new();
        gate.suspend();
        let token = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let token = token.clone();
            tokio::spawn(async move { gate.can_continue("x", &token).await })
        };

        token.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        assert!(gate.is_suspended());
    }
}
