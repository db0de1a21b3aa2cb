//!  src/util/debounce.rs
//!  ===================================================================
//!  Trailing-edge debouncer keyed by name.
//!
//!  • Per-key state lives in a small slab while an event is pending; the
//!    key map only stores indices and both are cleared on delivery.
//!  • Each burst of events for a key yields one delivery of the latest
//!    event, `delay` after the last submit and never later than
//!    `max_delay` after the first one.
//!  • Sleepers are plain tokio tasks; a new submit aborts the old one.
//!  • State sits behind `parking_lot` locks that are never held across an
//!    await, so `submit` is synchronous and callable from any task.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::Mutex;
use slab::Slab;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::trace;

use crate::config::LoadingConfig;

/* ======================== DebounceConfig ============================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub delay: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self::filter_input(&LoadingConfig::default())
    }
}

impl DebounceConfig {
    /// Filter edits on the selected container
    #[must_use]
    pub const fn filter_input(config: &LoadingConfig) -> Self {
        Self {
            delay: config.filter_debounce,
            max_delay: None,
        }
    }

    /// Tree-state writes; a steady stream of changes still saves now and then
    #[must_use]
    pub fn state_save(config: &LoadingConfig) -> Self {
        Self {
            delay: config.state_save_debounce,
            max_delay: Some(config.state_save_debounce * 10),
        }
    }
}

/* ============================ Debouncer ============================ */

/// A key's pending burst. The slot exists only while an event is waiting.
struct Slot<T> {
    burst_started: Instant,
    /// Unique across the debouncer, so a reused slab index never matches
    /// a stale sleeper
    seq: u64,
    last_event: T,
    sleeper: JoinHandle<()>,
}

struct Shared<T> {
    slab: Slab<Slot<T>>,
    key_map: AHashMap<CompactString, usize>,
    next_seq: u64,
}

impl<T> Shared<T> {
    fn take(&mut self, key: &str) -> Option<Slot<T>> {
        let idx = self.key_map.remove(key)?;
        self.slab.try_remove(idx)
    }
}

pub struct Debouncer<T> {
    cfg: DebounceConfig,
    shared: Arc<Mutex<Shared<T>>>,
    tx: mpsc::UnboundedSender<(CompactString, T)>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg,
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Debouncer<T> {
    /// Create a new debouncer and its Rx endpoint
    #[must_use]
    pub fn new(cfg: DebounceConfig) -> (Self, mpsc::UnboundedReceiver<(CompactString, T)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deb = Self {
            cfg,
            shared: Arc::new(Mutex::new(Shared {
                slab: Slab::new(),
                key_map: AHashMap::new(),
                next_seq: 0,
            })),
            tx,
        };
        (deb, rx)
    }

    #[must_use]
    pub const fn config(&self) -> DebounceConfig {
        self.cfg
    }

    /// Replace the pending event for `key` and restart its quiet period.
    pub fn submit(&self, key: &str, ev: T) {
        trace!(marker = "DEBOUNCE", key, "Debouncer received event");

        let mut shared = self.shared.lock();
        let now = Instant::now();
        shared.next_seq += 1;
        let seq = shared.next_seq;

        let (idx, burst_started) = match shared.key_map.get(key) {
            Some(&i) => {
                let slot = &mut shared.slab[i];
                slot.sleeper.abort();
                (i, slot.burst_started)
            }
            None => (shared.slab.vacant_key(), now),
        };

        let delay_deadline = now + self.cfg.delay;
        let deadline = self
            .cfg
            .max_delay
            .map_or(delay_deadline, |d| delay_deadline.min(burst_started + d));

        let shared_ptr = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        let owned_key = CompactString::from(key);

        let sleeper = tokio::spawn(async move {
            sleep_until(deadline).await;

            let event = {
                let mut shared = shared_ptr.lock();
                if shared.slab.get(idx).is_none_or(|slot| slot.seq != seq) {
                    return;
                }
                shared.take(&owned_key).map(|slot| slot.last_event)
            };
            if let Some(event) = event {
                trace!(marker = "DEBOUNCE", key = %owned_key, "Trailing edge fired");
                let _ = tx.send((owned_key, event));
            }
        });

        let slot = Slot {
            burst_started,
            seq,
            last_event: ev,
            sleeper,
        };
        if let Some(existing) = shared.slab.get_mut(idx) {
            *existing = slot;
        } else {
            let inserted = shared.slab.insert(slot);
            debug_assert_eq!(inserted, idx);
            shared.key_map.insert(key.into(), inserted);
        }
    }

    /// Deliver every pending event now.
    pub fn flush(&self) {
        let mut shared = self.shared.lock();
        let Shared { slab, key_map, .. } = &mut *shared;

        for (key, idx) in key_map.drain() {
            let Some(slot) = slab.try_remove(idx) else {
                continue;
            };
            slot.sleeper.abort();
            let _ = self.tx.send((key, slot.last_event));
        }
    }

    /// Drop every pending event without delivering it.
    pub fn cancel_all(&self) {
        let mut shared = self.shared.lock();
        for slot in shared.slab.drain() {
            slot.sleeper.abort();
        }
        shared.key_map.clear();
    }

    /// Keys with an event waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().slab.len()
    }
}
