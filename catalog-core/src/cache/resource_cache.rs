//! `src/cache/resource_cache.rs`
//! ============================================================================
//! # Per-object Resource Cache
//!
//! Memoized, single-flight accessors for the three lazy resources of an
//! [`Object`](crate::model::object::Object):
//! - each resource kind is independently absent, loading or present
//! - concurrent requesters of a loading resource await the same job
//! - jobs are spawned, so they finish even when every requester goes away
//! - failures are never cached; the next request starts a fresh job
//! - `purge` reclaims thumbnail and metadata without touching live jobs

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use compact_str::CompactString;
use enum_map::EnumMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{CatalogError, CatalogResult},
    model::object::{MetadataMap, ResourceKind, Thumbnail},
};

static STATS: Lazy<CacheStats> = Lazy::new(CacheStats::default);

static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

/// Process-wide resource cache counters.
#[must_use]
pub fn global_stats() -> &'static CacheStats {
    &STATS
}

#[derive(Debug, Default)]
pub struct KindCounters {
    hits: AtomicU64,
    joins: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
    total_load_time_ns: AtomicU64,
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Default)]
pub struct CacheStats {
    kinds: EnumMap<ResourceKind, KindCounters>,
    purges: AtomicU64,
    skipped_purges: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self, kind: ResourceKind) {
        self.kinds[kind].hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_join(&self, kind: ResourceKind) {
        self.kinds[kind].joins.fetch_add(1, Ordering::Relaxed);
    }

    #[expect(clippy::cast_possible_truncation, reason = "Expected accuracy")]
    fn record_load(&self, kind: ResourceKind, duration: Duration, success: bool) {
        let counters = &self.kinds[kind];
        counters.loads.fetch_add(1, Ordering::Relaxed);
        counters
            .total_load_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        if !success {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_purge(&self, purged: bool) {
        if purged {
            self.purges.fetch_add(1, Ordering::Relaxed);
        } else {
            self.skipped_purges.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let kinds = EnumMap::from_fn(|kind| {
            let counters: &KindCounters = &self.kinds[kind];
            KindSnapshot {
                hits: counters.hits.load(Ordering::Relaxed),
                joins: counters.joins.load(Ordering::Relaxed),
                loads: counters.loads.load(Ordering::Relaxed),
                failures: counters.failures.load(Ordering::Relaxed),
                total_load_time: Duration::from_nanos(
                    counters.total_load_time_ns.load(Ordering::Relaxed),
                ),
            }
        });

        CacheStatsSnapshot {
            kinds,
            purges: self.purges.load(Ordering::Relaxed),
            skipped_purges: self.skipped_purges.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSnapshot {
    pub hits: u64,
    pub joins: u64,
    pub loads: u64,
    pub failures: u64,
    pub total_load_time: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheStatsSnapshot {
    pub kinds: EnumMap<ResourceKind, KindSnapshot>,
    pub purges: u64,
    pub skipped_purges: u64,
}

impl CacheStatsSnapshot {
    /// Share of requests answered without starting a fetch.
    #[expect(clippy::cast_precision_loss, reason = "Expected precision loss")]
    #[must_use]
    pub fn hit_rate(&self, kind: ResourceKind) -> f64 {
        let k = &self.kinds[kind];
        let total = k.hits + k.joins + k.loads;
        if total == 0 {
            0.0
        } else {
            (k.hits + k.joins) as f64 / total as f64
        }
    }

    #[must_use]
    pub fn average_load_penalty(&self, kind: ResourceKind) -> Duration {
        let k = &self.kinds[kind];
        if k.loads == 0 {
            Duration::ZERO
        } else {
            k.total_load_time / u32::try_from(k.loads).unwrap_or(u32::MAX)
        }
    }
}

type Pending<T> = Shared<BoxFuture<'static, CatalogResult<T>>>;

enum Slot<T> {
    Absent,
    Loading { job: u64, pending: Pending<T> },
    Present(T),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Slot<T> {
    const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }
}

#[derive(Default)]
struct Slots {
    thumbnail: Slot<Thumbnail>,
    metadata: Slot<Arc<MetadataMap>>,
    local_file: Slot<PathBuf>,
}

/// Maps a resource value type onto its slot.
trait Resource: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn slot(slots: &mut Slots) -> &mut Slot<Self>;
}

impl Resource for Thumbnail {
    const KIND: ResourceKind = ResourceKind::Thumbnail;

    fn slot(slots: &mut Slots) -> &mut Slot<Self> {
        &mut slots.thumbnail
    }
}

impl Resource for Arc<MetadataMap> {
    const KIND: ResourceKind = ResourceKind::Metadata;

    fn slot(slots: &mut Slots) -> &mut Slot<Self> {
        &mut slots.metadata
    }
}

impl Resource for PathBuf {
    const KIND: ResourceKind = ResourceKind::LocalFile;

    fn slot(slots: &mut Slots) -> &mut Slot<Self> {
        &mut slots.local_file
    }
}

/// Resource slots of one object. All three share one lock; it is never held
/// across an await.
pub struct ResourceCache {
    identifier: CompactString,
    slots: Arc<Mutex<Slots>>,
}

impl ResourceCache {
    #[must_use]
    pub fn new(identifier: CompactString) -> Self {
        Self {
            identifier,
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub async fn thumbnail<F, Fut>(&self, fetch: F) -> CatalogResult<Thumbnail>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<Thumbnail>> + Send + 'static,
    {
        self.get_or_fetch(fetch).await
    }

    pub async fn metadata<F, Fut>(&self, fetch: F) -> CatalogResult<Arc<MetadataMap>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<Arc<MetadataMap>>> + Send + 'static,
    {
        self.get_or_fetch(fetch).await
    }

    pub async fn local_file<F, Fut>(&self, fetch: F) -> CatalogResult<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<PathBuf>> + Send + 'static,
    {
        self.get_or_fetch(fetch).await
    }

    #[must_use]
    pub fn cached_thumbnail(&self) -> Option<Thumbnail> {
        self.peek()
    }

    #[must_use]
    pub fn cached_metadata(&self) -> Option<Arc<MetadataMap>> {
        self.peek()
    }

    #[must_use]
    pub fn cached_local_file(&self) -> Option<PathBuf> {
        self.peek()
    }

    /// True exactly while a job for `kind` is pending.
    #[must_use]
    pub fn is_loading(&self, kind: ResourceKind) -> bool {
        let slots = self.slots.lock();
        match kind {
            ResourceKind::Thumbnail => slots.thumbnail.is_loading(),
            ResourceKind::Metadata => slots.metadata.is_loading(),
            ResourceKind::LocalFile => slots.local_file.is_loading(),
        }
    }

    /// Clears thumbnail and metadata. The local file path survives.
    ///
    /// Returns `false` without touching anything while a thumbnail or
    /// metadata job is pending.
    pub fn purge(&self) -> bool {
        let mut slots = self.slots.lock();

        if slots.thumbnail.is_loading() || slots.metadata.is_loading() {
            STATS.record_purge(false);
            debug!(
                marker = "RESOURCE_CACHE",
                operation_type = "purge_skipped",
                object = %self.identifier,
                "Purge skipped while a resource is loading"
            );
            return false;
        }

        slots.thumbnail = Slot::Absent;
        slots.metadata = Slot::Absent;
        STATS.record_purge(true);

        true
    }

    fn peek<T: Resource>(&self) -> Option<T> {
        let mut slots = self.slots.lock();
        match T::slot(&mut slots) {
            Slot::Present(value) => Some(value.clone()),
            _ => None,
        }
    }

    async fn get_or_fetch<T, F, Fut>(&self, fetch: F) -> CatalogResult<T>
    where
        T: Resource,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<T>> + Send + 'static,
    {
        let pending = {
            let mut slots = self.slots.lock();
            let slot = T::slot(&mut slots);

            match slot {
                Slot::Present(value) => {
                    STATS.record_hit(T::KIND);
                    debug!(
                        marker = "RESOURCE_CACHE",
                        operation_type = "cache_hit",
                        object = %self.identifier,
                        kind = %T::KIND,
                        "Resource served from cache"
                    );
                    return Ok(value.clone());
                }

                Slot::Loading { pending, .. } => {
                    STATS.record_join(T::KIND);
                    debug!(
                        marker = "RESOURCE_CACHE",
                        operation_type = "join_pending",
                        object = %self.identifier,
                        kind = %T::KIND,
                        "Joining in-flight resource fetch"
                    );
                    pending.clone()
                }

                Slot::Absent => {
                    let job = NEXT_JOB.fetch_add(1, Ordering::Relaxed);
                    let pending = self.spawn_job::<T, _>(job, fetch());
                    *slot = Slot::Loading {
                        job,
                        pending: pending.clone(),
                    };
                    pending
                }
            }
        };

        pending.await
    }

    fn spawn_job<T, Fut>(&self, job: u64, fetch: Fut) -> Pending<T>
    where
        T: Resource,
        Fut: Future<Output = CatalogResult<T>> + Send + 'static,
    {
        debug!(
            marker = "RESOURCE_CACHE",
            operation_type = "fetch_start",
            object = %self.identifier,
            kind = %T::KIND,
            job,
            "Starting resource fetch"
        );

        let slots = Arc::clone(&self.slots);
        let identifier = self.identifier.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = fetch.await;
            let elapsed = started.elapsed();

            settle(&slots, job, &outcome);
            STATS.record_load(T::KIND, elapsed, outcome.is_ok());

            match &outcome {
                Ok(_) => info!(
                    marker = "RESOURCE_CACHE",
                    operation_type = "fetch_complete",
                    object = %identifier,
                    kind = %T::KIND,
                    load_time_us = elapsed.as_micros(),
                    "Resource fetched"
                ),
                Err(err) => warn!(
                    marker = "RESOURCE_CACHE",
                    operation_type = "fetch_failed",
                    object = %identifier,
                    kind = %T::KIND,
                    error = %err,
                    "Resource fetch failed; slot left empty"
                ),
            }

            outcome
        });

        let slots = Arc::clone(&self.slots);
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let err = CatalogError::from(join_err);
                    settle::<T>(&slots, job, &Err(err.clone()));
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Publish a finished job, unless its slot has moved on.
fn settle<T: Resource>(slots: &Mutex<Slots>, job: u64, outcome: &CatalogResult<T>) {
    let mut guard = slots.lock();
    let slot = T::slot(&mut guard);

    if matches!(slot, Slot::Loading { job: current, .. } if *current == job) {
        *slot = match outcome {
            Ok(value) => Slot::Present(value.clone()),
            Err(_) => Slot::Absent,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn jpeg() -> Thumbnail {
        Thumbnail::from_bytes(Bytes::from_static(b"\xFF\xD8jpeg"))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        let cache = Arc::new(ResourceCache::new("File:/a.jpg".into()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .thumbnail(move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            Ok(jpeg())
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), jpeg());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_loading(ResourceKind::Thumbnail));
        assert_eq!(cache.cached_thumbnail(), Some(jpeg()));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_all_observe_a_shared_failure() {
        let cache = Arc::new(ResourceCache::new("File:/broken.jpg".into()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .thumbnail(|| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(CatalogError::thumbnail_failed("File:/broken.jpg", "decode"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(CatalogError::ThumbnailFailed { .. })
            ));
        }
        assert_eq!(cache.cached_thumbnail(), None);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = ResourceCache::new("File:/flaky.jpg".into());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let calls = Arc::clone(&calls);
            cache
                .thumbnail(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CatalogError::thumbnail_failed("File:/flaky.jpg", "timeout")) }
                })
                .await
        };
        assert!(first.is_err());
        assert!(!cache.is_loading(ResourceKind::Thumbnail));

        let second = {
            let calls = Arc::clone(&calls);
            cache
                .thumbnail(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(jpeg()) }
                })
                .await
        };
        assert_eq!(second.unwrap(), jpeg());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // now present: the closure must not run
        let third = cache
            .thumbnail(|| async { Err(CatalogError::failed("fetch ran for a cached thumbnail")) })
            .await;
        assert_eq!(third.unwrap(), jpeg());
    }

    #[tokio::test]
    async fn purge_waits_for_pending_loads_and_keeps_local_file() {
        let cache = Arc::new(ResourceCache::new("File:/b.png".into()));

        cache
            .metadata(|| async { Ok(Arc::new(MetadataMap::new())) })
            .await
            .unwrap();
        cache
            .local_file(|| async { Ok(PathBuf::from("/b.png")) })
            .await
            .unwrap();

        let gate = Arc::new(Notify::new());
        let pending = {
            let cache = Arc::clone(&cache);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                cache
                    .thumbnail(move || async move {
                        gate.notified().await;
                        Ok(jpeg())
                    })
                    .await
            })
        };

        while !cache.is_loading(ResourceKind::Thumbnail) {
            tokio::task::yield_now().await;
        }

        assert!(!cache.purge());
        assert!(cache.cached_metadata().is_some());

        gate.notify_one();
        pending.await.unwrap().unwrap();

        assert!(cache.purge());
        assert_eq!(cache.cached_thumbnail(), None);
        assert_eq!(cache.cached_metadata(), None);
        assert_eq!(cache.cached_local_file(), Some(PathBuf::from("/b.png")));
    }

    #[tokio::test]
    async fn jobs_finish_after_requesters_are_dropped() {
        let cache = Arc::new(ResourceCache::new("File:/c.jpg".into()));
        let gate = Arc::new(Notify::new());

        let requester = {
            let cache = Arc::clone(&cache);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                cache
                    .thumbnail(move || async move {
                        gate.notified().await;
                        Ok(jpeg())
                    })
                    .await
            })
        };

        while !cache.is_loading(ResourceKind::Thumbnail) {
            tokio::task::yield_now().await;
        }
        requester.abort();
        let _ = requester.await;

        gate.notify_one();
        while cache.is_loading(ResourceKind::Thumbnail) {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.cached_thumbnail(), Some(jpeg()));
    }

    #[test]
    fn snapshot_reports_hit_rate_per_kind() {
        let stats = CacheStats::default();
        stats.record_load(ResourceKind::Metadata, Duration::from_millis(4), true);
        stats.record_hit(ResourceKind::Metadata);
        stats.record_join(ResourceKind::Metadata);
        stats.record_hit(ResourceKind::Metadata);

        let snap = stats.snapshot();
        assert!((snap.hit_rate(ResourceKind::Metadata) - 0.75).abs() < f64::EPSILON);
        assert_eq!(snap.hit_rate(ResourceKind::Thumbnail), 0.0);
        assert_eq!(
            snap.average_load_penalty(ResourceKind::Metadata),
            Duration::from_millis(4)
        );
    }
}
