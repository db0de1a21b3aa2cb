//! Delayed purge of the decoded resources owned by a container.
//!
//! Deselecting a container schedules a purge of its objects' thumbnails
//! and metadata; selecting it again within the delay cancels the purge.
//! There is at most one pending purge per container and a newer request
//! supersedes the older one. Objects with a pending thumbnail or metadata
//! load are skipped.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::container::{Container, PurgeJob};

static NEXT_PURGE: AtomicU64 = AtomicU64::new(1);

/// Outcome of one executed purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
    pub skipped: usize,
}

impl Container {
    /// Purge every directly owned object after `delay`, unless cancelled.
    pub fn request_purge(self: &Arc<Self>, delay: Duration) {
        let id = NEXT_PURGE.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        {
            let mut st = self.state.lock();
            if let Some(previous) = st.purge.replace(PurgeJob {
                id,
                token: token.clone(),
            }) {
                previous.token.cancel();
            }
        }

        debug!(
            marker = "CONTAINER_PURGE",
            operation_type = "purge_scheduled",
            container = %self.identifier(),
            delay_ms = delay.as_millis(),
            "Purge scheduled"
        );

        let container = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(container) = container.upgrade() {
                        container.run_purge(id);
                    }
                }
            }
        });
    }

    /// Returns `true` if a pending purge was cancelled.
    pub fn cancel_purge(&self) -> bool {
        let job = self.state.lock().purge.take();
        match job {
            Some(job) => {
                job.token.cancel();
                debug!(
                    marker = "CONTAINER_PURGE",
                    operation_type = "purge_cancelled",
                    container = %self.identifier(),
                    "Pending purge cancelled"
                );
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn has_pending_purge(&self) -> bool {
        self.state.lock().purge.is_some()
    }

    fn run_purge(&self, id: u64) -> Option<PurgeReport> {
        let objects = {
            let mut st = self.state.lock();
            match &st.purge {
                Some(job) if job.id == id => {}
                _ => return None,
            }
            st.purge = None;
            st.objects.clone()
        };

        let mut report = PurgeReport::default();
        for object in &objects {
            if object.purge() {
                report.purged += 1;
            } else {
                report.skipped += 1;
            }
        }

        info!(
            marker = "CONTAINER_PURGE",
            operation_type = "purge_executed",
            container = %self.identifier(),
            purged = report.purged,
            skipped = report.skipped,
            "Container resources purged"
        );

        Some(report)
    }
}
