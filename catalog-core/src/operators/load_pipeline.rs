//! `src/operators/load_pipeline.rs`
//! ============================================================================
//! # Container Load Pipeline
//!
//! Cancel-and-restart orchestration of container and source loads.
//!
//! Per node the state machine is `idle → loading → loaded | idle`:
//! 1. a new load cancels the node's running job and becomes the current one
//! 2. the node's fetch runs in a spawned task, raced against its token
//! 3. a successful fetch commits only if its job is still current; the new
//!    children and objects replace the old ones in one step, and children
//!    that were expanded before (or are expanded in restored state) are
//!    loaded recursively with their sub-state
//! 4. a failed or cancelled fetch clears the loading flag of the current job
//!    and leaves the previous snapshot in place
//!
//! The pipeline counts running jobs so callers can wait for the tree to
//! settle, and offers every committed container to an optional creation
//! hook (used to restore a selection whose node did not exist yet). A
//! loaded container whose backend can watch it is reloaded when it changes
//! outside the catalog.

use std::{sync::Arc, time::Instant};

use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use parking_lot::RwLock;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::{
    error::{CatalogError, CatalogResult},
    model::{
        container::{ChangeCallback, ContainerRef, Contents, FetchRequest, LoadJob, ParentRef},
        node_state::NodeState,
        object::ObjectRef,
        source::{SourceRef, SourceRequest},
        statistics::Statistics,
    },
    operators::suspension::Suspension,
};

/// Called with every container that a commit attaches to the tree.
pub type CreationHook = Arc<dyn Fn(&ContainerRef) + Send + Sync>;

struct PipelineInner {
    statistics: Arc<Statistics>,
    suspension: Suspension,
    active: watch::Sender<usize>,
    on_created: RwLock<Option<CreationHook>>,
}

/// Cheap to clone; all clones drive the same set of jobs.
#[derive(Clone)]
pub struct LoadPipeline {
    inner: Arc<PipelineInner>,
}

/// Keeps the running-job count accurate even if a job panics.
struct ActiveGuard(Arc<PipelineInner>);

impl ActiveGuard {
    fn enter(inner: &Arc<PipelineInner>) -> Self {
        inner.active.send_modify(|n| *n += 1);
        Self(Arc::clone(inner))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn new_job_id() -> CompactString {
    CompactString::from(nanoid::nanoid!(10))
}

fn is_current(job: Option<&LoadJob>, job_id: &str) -> bool {
    job.is_some_and(|job| job.id == job_id)
}

/// Keep the first occurrence of every identifier.
fn dedup_by_identifier<T>(items: Vec<T>, identifier: impl Fn(&T) -> &CompactString) -> Vec<T> {
    let mut seen: AHashSet<CompactString> = AHashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(identifier(item).clone()))
        .collect()
}

impl LoadPipeline {
    #[must_use]
    pub fn new(statistics: Arc<Statistics>) -> Self {
        let (active, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(PipelineInner {
                statistics,
                suspension: Suspension::new(),
                active,
                on_created: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    #[must_use]
    pub fn suspension(&self) -> &Suspension {
        &self.inner.suspension
    }

    pub fn set_creation_hook(&self, hook: CreationHook) {
        *self.inner.on_created.write() = Some(hook);
    }

    #[must_use]
    pub fn active_loads(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Resolves once no load, including recursive re-expansion, is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    /// Load `container` with its current filter, superseding any running load.
    pub fn load(&self, container: &ContainerRef) -> JoinHandle<()> {
        self.start(container, None)
    }

    /// Load with restored sub-state to apply to the children it yields.
    pub fn load_with_state(&self, container: &ContainerRef, state: NodeState) -> JoinHandle<()> {
        self.start(container, Some(state))
    }

    /// "Near the end of the list": fetch more unless a load is already running.
    pub fn next_page(&self, container: &ContainerRef) -> Option<JoinHandle<()>> {
        if container.is_loading() {
            debug!(
                marker = "CONTAINER_LOAD",
                operation_type = "next_page_skipped",
                container = %container.identifier(),
                "Next page requested while loading"
            );
            return None;
        }
        Some(self.load(container))
    }

    /// Reload a loaded, selected container from scratch.
    pub fn reload(&self, container: &ContainerRef) -> Option<JoinHandle<()>> {
        if !(container.is_loaded() && container.is_selected()) {
            return None;
        }
        container.invalidate_loaded();
        Some(self.load(container))
    }

    /// Cancel the running load, if any. The previous snapshot stays.
    pub fn cancel(&self, container: &ContainerRef) -> bool {
        let job = container.state.lock().load.take();
        match job {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    fn start(&self, container: &ContainerRef, restored: Option<NodeState>) -> JoinHandle<()> {
        let job_id = new_job_id();
        let token = CancellationToken::new();

        let filter = {
            let mut st = container.state.lock();
            if let Some(previous) = st.load.replace(LoadJob {
                id: job_id.clone(),
                token: token.clone(),
            }) {
                previous.token.cancel();
                debug!(
                    marker = "CONTAINER_LOAD",
                    operation_type = "load_superseded",
                    container = %container.identifier(),
                    superseded_job = %previous.id,
                    job_id = %job_id,
                    "Previous load superseded"
                );
            }
            if let Some(state) = restored {
                st.is_expanded = state.is_expanded;
                st.saved = Some(state);
            }
            st.filter.clone()
        };

        let request = FetchRequest {
            identifier: container.identifier().clone(),
            data: Arc::clone(container.data()),
            filter,
            token,
            statistics: Arc::clone(&self.inner.statistics),
        };

        let guard = ActiveGuard::enter(&self.inner);
        let pipeline = self.clone();
        let container = Arc::clone(container);
        let span = debug_span!(
            "container_load",
            container = %container.identifier(),
            job_id = %job_id
        );

        tokio::spawn(
            async move {
                pipeline.run_container_load(&container, &job_id, request).await;
                drop(guard);
            }
            .instrument(span),
        )
    }

    async fn run_container_load(&self, container: &ContainerRef, job_id: &str, request: FetchRequest) {
        let started = Instant::now();
        let token = request.token.clone();
        let fetch = container.fetcher();
        let suspension = &self.inner.suspension;

        let outcome: CatalogResult<Contents> = tokio::select! {
            biased;
            () = token.cancelled() => Err(CatalogError::cancelled(container.identifier())),
            result = async {
                suspension.can_continue(container.identifier(), &token).await?;
                fetch.fetch(request).await
            } => result,
        };

        match outcome {
            Ok(contents) => {
                let children = contents.containers.len();
                let objects = contents.objects.len();
                if self.commit_container(container, job_id, contents) {
                    self.start_watching(container);
                    info!(
                        marker = "CONTAINER_LOAD",
                        operation_type = "load_committed",
                        container = %container.identifier(),
                        children,
                        objects,
                        duration_ms = started.elapsed().as_millis(),
                        "Container loaded"
                    );
                } else {
                    debug!(
                        marker = "CONTAINER_LOAD",
                        operation_type = "stale_result_dropped",
                        container = %container.identifier(),
                        "Result of a superseded load dropped"
                    );
                }
            }
            Err(err) => {
                let mut st = container.state.lock();
                if is_current(st.load.as_ref(), job_id) {
                    st.load = None;
                }
                drop(st);
                log_failure(container.identifier(), err);
            }
        }
    }

    fn commit_container(&self, container: &ContainerRef, job_id: &str, contents: Contents) -> bool {
        let Contents {
            containers,
            objects,
        } = contents;
        let containers = dedup_by_identifier(containers, |c| c.identifier());
        let objects: Vec<ObjectRef> = dedup_by_identifier(objects, |o| o.identifier());

        let (previous, saved) = {
            let mut st = container.state.lock();
            if !is_current(st.load.as_ref(), job_id) {
                return false;
            }
            st.load = None;
            st.objects = objects;
            st.is_loaded = true;
            let previous = std::mem::replace(&mut st.children, containers.clone());
            (previous, st.saved.take())
        };

        let parent = Arc::downgrade(container);
        for child in &containers {
            child.set_parent(ParentRef::Container(parent.clone()));
        }

        self.settle_children(&previous, &containers, saved.as_ref());
        true
    }

    /// Ask the backend to report outside changes of a loaded container.
    /// Each report reloads the container while it is still loaded.
    fn start_watching(&self, container: &ContainerRef) {
        if container.is_watched() {
            return;
        }

        let runtime = tokio::runtime::Handle::current();
        let pipeline = Arc::downgrade(&self.inner);
        let weak = Arc::downgrade(container);
        let on_change: ChangeCallback = Arc::new(move || {
            let (Some(inner), Some(container)) = (pipeline.upgrade(), weak.upgrade()) else {
                return;
            };
            if !container.is_loaded() {
                return;
            }
            debug!(
                marker = "CONTAINER_WATCH",
                operation_type = "outside_change",
                container = %container.identifier(),
                "Contents changed outside the catalog; reloading"
            );
            let _runtime = runtime.enter();
            LoadPipeline { inner }.load(&container);
        });

        match container.fetcher().watch(container.data(), on_change) {
            Ok(Some(handle)) => container.set_watch(handle),
            Ok(None) => {}
            Err(e) => warn!(
                marker = "CONTAINER_WATCH",
                operation_type = "watch_failed",
                container = %container.identifier(),
                error = %e,
                "Could not watch container; outside changes need a manual reload"
            ),
        }
    }

    /// Load the containers of `source`, superseding any running source load.
    pub fn load_source(&self, source: &SourceRef) -> JoinHandle<()> {
        let job_id = new_job_id();
        let token = CancellationToken::new();

        {
            let mut st = source.state.lock();
            if let Some(previous) = st.load.replace(LoadJob {
                id: job_id.clone(),
                token: token.clone(),
            }) {
                previous.token.cancel();
            }
        }

        let guard = ActiveGuard::enter(&self.inner);
        let pipeline = self.clone();
        let source = Arc::clone(source);
        let span = debug_span!(
            "source_load",
            source = %source.identifier(),
            job_id = %job_id
        );

        tokio::spawn(
            async move {
                pipeline.run_source_load(&source, &job_id, token).await;
                drop(guard);
            }
            .instrument(span),
        )
    }

    async fn run_source_load(&self, source: &SourceRef, job_id: &str, token: CancellationToken) {
        let fetch = source.fetcher();
        let request = SourceRequest {
            identifier: source.identifier().clone(),
            token: token.clone(),
        };
        let suspension = &self.inner.suspension;

        let outcome: CatalogResult<Vec<ContainerRef>> = tokio::select! {
            biased;
            () = token.cancelled() => Err(CatalogError::cancelled(source.identifier())),
            result = async {
                suspension.can_continue(source.identifier(), &token).await?;
                fetch.fetch(request).await
            } => result,
        };

        match outcome {
            Ok(containers) => {
                let containers = dedup_by_identifier(containers, |c| c.identifier());

                let (previous, saved) = {
                    let mut st = source.state.lock();
                    if !is_current(st.load.as_ref(), job_id) {
                        return;
                    }
                    st.load = None;
                    st.is_loaded = true;
                    let previous = std::mem::replace(&mut st.containers, containers.clone());
                    (previous, st.saved.take())
                };

                let parent = Arc::downgrade(source);
                for container in &containers {
                    container.set_parent(ParentRef::Source(parent.clone()));
                }

                info!(
                    marker = "SOURCE_LOAD",
                    operation_type = "load_committed",
                    source = %source.identifier(),
                    containers = containers.len(),
                    "Source loaded"
                );

                self.settle_children(&previous, &containers, saved.as_ref());
            }
            Err(err) => {
                let mut st = source.state.lock();
                if is_current(st.load.as_ref(), job_id) {
                    st.load = None;
                }
                drop(st);
                log_failure(source.identifier(), err);
            }
        }
    }

    /// Carry expansion over from the replaced children and from restored
    /// state, cancel work under children that disappeared, and announce the
    /// new ones.
    fn settle_children(
        &self,
        previous: &[ContainerRef],
        current: &[ContainerRef],
        saved: Option<&NodeState>,
    ) {
        let was_expanded: AHashMap<CompactString, NodeState> = previous
            .iter()
            .filter(|c| c.is_expanded())
            .map(|c| (c.identifier().clone(), c.snapshot()))
            .collect();

        for old in previous {
            if !current.iter().any(|c| Arc::ptr_eq(c, old)) {
                old.cancel_subtree();
            }
        }

        for child in current {
            let sub_state = was_expanded
                .get(child.identifier())
                .cloned()
                .or_else(|| saved.and_then(|s| s.child(child.identifier())).cloned());

            match sub_state {
                Some(state) if state.is_expanded => {
                    self.load_with_state(child, state);
                }
                Some(state) => child.stash_state(state),
                None => {}
            }

            self.announce(child);
        }
    }

    fn announce(&self, container: &ContainerRef) {
        let hook = self.inner.on_created.read().clone();
        if let Some(hook) = hook {
            hook(container);
        }
    }
}

fn log_failure(node: &str, err: CatalogError) {
    if err.is_cancelled() {
        debug!(
            marker = "CONTAINER_LOAD",
            operation_type = "load_cancelled",
            node,
            "Load cancelled"
        );
    } else {
        warn!(
            marker = "CONTAINER_LOAD",
            operation_type = "load_failed",
            node,
            error = %err,
            error_kind = err.error_marker(),
            recoverable = err.is_recoverable(),
            "Load failed; previous contents kept"
        );
    }
}
