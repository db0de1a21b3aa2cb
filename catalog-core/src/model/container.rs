//! `src/model/container.rs`
//! ============================================================
//! Container nodes of the catalog tree.
//!
//! A container owns its children and objects. Everything mutable sits in
//! one [`ContainerState`] behind a mutex, which is the container's
//! serialization domain: the load pipeline, the purge scheduler and UI
//! flag changes all go through it, and it is never held across an await.
//! Parents are reached through weak back-references.

use std::{
    any::Any,
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{CatalogError, CatalogResult},
    model::{
        filter::FilterState,
        node_state::{NodeState, state_key},
        object::{BackendData, ObjectRef, no_backend_data},
        source::Source,
        statistics::Statistics,
    },
};

pub type ContainerRef = Arc<Container>;

/// State-key path from the section down to a node.
pub type StatePath = SmallVec<[CompactString; 8]>;

/// One fetch result: child containers and objects.
#[derive(Debug, Default)]
pub struct Contents {
    pub containers: Vec<ContainerRef>,
    pub objects: Vec<ObjectRef>,
}

impl Contents {
    #[must_use]
    pub const fn new(containers: Vec<ContainerRef>, objects: Vec<ObjectRef>) -> Self {
        Self {
            containers,
            objects,
        }
    }
}

/// Everything a [`ContentFetch`] gets to see.
#[derive(Clone)]
pub struct FetchRequest {
    pub identifier: CompactString,
    pub data: BackendData,
    pub filter: FilterState,
    pub token: CancellationToken,
    pub statistics: Arc<Statistics>,
}

impl FetchRequest {
    /// Early exit point for long fetches.
    pub fn ensure_active(&self) -> CatalogResult<()> {
        if self.token.is_cancelled() {
            Err(CatalogError::cancelled(&self.identifier))
        } else {
            Ok(())
        }
    }
}

/// Called when a watched container's contents changed outside the engine.
/// May run on a thread outside the async runtime.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque backend watch; dropping it stops the change reports.
pub type WatchHandle = Box<dyn Any + Send>;

/// Lists the contents of one container.
///
/// May fail with `NotFound`, `AccessDenied`, `Cancelled` or `Failed`.
#[async_trait]
pub trait ContentFetch: Send + Sync + 'static {
    async fn fetch(&self, request: FetchRequest) -> CatalogResult<Contents>;

    /// Report outside changes of a loaded container through `on_change`.
    /// `Ok(None)` means the backend cannot watch.
    fn watch(
        &self,
        _data: &BackendData,
        _on_change: ChangeCallback,
    ) -> CatalogResult<Option<WatchHandle>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
pub enum ParentRef {
    #[default]
    Detached,
    Container(Weak<Container>),
    Source(Weak<Source>),
}

/// The one outstanding load of a node.
#[derive(Debug)]
pub(crate) struct LoadJob {
    pub(crate) id: CompactString,
    pub(crate) token: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct PurgeJob {
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
}

#[derive(Default)]
pub(crate) struct ContainerState {
    pub(crate) children: Vec<ContainerRef>,
    pub(crate) objects: Vec<ObjectRef>,
    pub(crate) is_loaded: bool,
    pub(crate) is_expanded: bool,
    pub(crate) is_selected: bool,
    pub(crate) filter: FilterState,
    /// `Some` exactly while the container is loading
    pub(crate) load: Option<LoadJob>,
    pub(crate) purge: Option<PurgeJob>,
    /// Restored sub-state not yet applied by a commit
    pub(crate) saved: Option<NodeState>,
    pub(crate) watch: Option<WatchHandle>,
}

pub struct Container {
    identifier: CompactString,
    name: CompactString,
    icon: Option<CompactString>,
    data: BackendData,
    fetch: Arc<dyn ContentFetch>,
    pub(crate) state: Mutex<ContainerState>,
    parent: RwLock<ParentRef>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("is_loading", &self.is_loading())
            .field("is_loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for Container {}

impl Container {
    #[must_use]
    pub fn builder(
        identifier: impl Into<CompactString>,
        name: impl Into<CompactString>,
        fetch: Arc<dyn ContentFetch>,
    ) -> ContainerBuilder {
        ContainerBuilder {
            identifier: identifier.into(),
            name: name.into(),
            icon: None,
            data: no_backend_data(),
            fetch,
            filter: FilterState::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn identifier(&self) -> &CompactString {
        &self.identifier
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &BackendData {
        &self.data
    }

    pub(crate) fn fetcher(&self) -> Arc<dyn ContentFetch> {
        Arc::clone(&self.fetch)
    }

    #[must_use]
    pub fn children(&self) -> Vec<ContainerRef> {
        self.state.lock().children.clone()
    }

    #[must_use]
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.state.lock().objects.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.lock().load.is_some()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().is_loaded
    }

    #[must_use]
    pub fn is_expanded(&self) -> bool {
        self.state.lock().is_expanded
    }

    /// UI-owned flag. Loading an expanded container is the caller's call.
    pub fn set_expanded(&self, expanded: bool) {
        self.state.lock().is_expanded = expanded;
    }

    /// Whether the backend reports outside changes of this container.
    #[must_use]
    pub fn is_watched(&self) -> bool {
        self.state.lock().watch.is_some()
    }

    pub(crate) fn set_watch(&self, handle: WatchHandle) {
        let previous = self.state.lock().watch.replace(handle);
        drop(previous);
    }

    #[must_use]
    pub fn is_selected(&self) -> bool {
        self.state.lock().is_selected
    }

    pub(crate) fn set_selected(&self, selected: bool) {
        self.state.lock().is_selected = selected;
    }

    #[must_use]
    pub fn filter(&self) -> FilterState {
        self.state.lock().filter.clone()
    }

    pub(crate) fn set_filter(&self, filter: FilterState) {
        self.state.lock().filter = filter;
    }

    pub(crate) fn stash_state(&self, state: NodeState) {
        let mut st = self.state.lock();
        st.is_expanded = state.is_expanded;
        st.saved = Some(state);
    }

    #[must_use]
    pub fn parent(&self) -> ParentRef {
        self.parent.read().clone()
    }

    pub(crate) fn set_parent(&self, parent: ParentRef) {
        *self.parent.write() = parent;
    }

    #[must_use]
    pub fn parent_container(&self) -> Option<ContainerRef> {
        match &*self.parent.read() {
            ParentRef::Container(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Keys from the owning section down to this container.
    #[must_use]
    pub fn state_path(&self) -> StatePath {
        let mut path = StatePath::new();
        path.push(state_key(&self.identifier));

        let mut parent = self.parent();
        loop {
            match parent {
                ParentRef::Container(weak) => match weak.upgrade() {
                    Some(container) => {
                        path.push(state_key(container.identifier()));
                        parent = container.parent();
                    }
                    None => break,
                },
                ParentRef::Source(weak) => {
                    if let Some(source) = weak.upgrade() {
                        path.push(state_key(source.identifier()));
                        if let Some(section) = source.section() {
                            path.push(state_key(section.identifier()));
                        }
                    }
                    break;
                }
                ParentRef::Detached => break,
            }
        }

        path.reverse();
        path
    }

    /// Recursive expanded-state snapshot.
    ///
    /// Restored state that no commit has consumed yet is carried over, so an
    /// untouched tree saves what it was restored from.
    #[must_use]
    pub fn snapshot(&self) -> NodeState {
        let (is_expanded, children, saved) = {
            let st = self.state.lock();
            (st.is_expanded, st.children.clone(), st.saved.clone())
        };

        let mut node = saved.unwrap_or_default();
        node.is_expanded = is_expanded;
        for child in &children {
            node.insert_child(child.identifier(), child.snapshot());
        }
        node
    }

    /// Attach `child`, replacing any child with the same identifier.
    pub fn add_child(self: &Arc<Self>, child: ContainerRef) {
        child.set_parent(ParentRef::Container(Arc::downgrade(self)));

        let replaced = {
            let mut st = self.state.lock();
            match st
                .children
                .iter()
                .position(|c| c.identifier == child.identifier)
            {
                Some(idx) => Some(std::mem::replace(&mut st.children[idx], child)),
                None => {
                    st.children.push(child);
                    None
                }
            }
        };

        if let Some(old) = replaced {
            old.cancel_subtree();
        }
    }

    /// Detach a child and cancel everything in flight below it.
    pub fn remove_child(&self, identifier: &str) -> Option<ContainerRef> {
        let removed = {
            let mut st = self.state.lock();
            let idx = st.children.iter().position(|c| c.identifier == identifier)?;
            st.children.remove(idx)
        };

        removed.set_parent(ParentRef::Detached);
        removed.cancel_subtree();
        Some(removed)
    }

    /// Cancel pending work and stop watching, for this container and its
    /// descendants.
    pub fn cancel_subtree(&self) {
        let (children, watch) = {
            let mut st = self.state.lock();
            if let Some(job) = st.load.take() {
                job.token.cancel();
                debug!(
                    marker = "CONTAINER_LOAD",
                    operation_type = "load_cancelled",
                    container = %self.identifier,
                    job_id = %job.id,
                    "Load cancelled with subtree"
                );
            }
            if let Some(purge) = st.purge.take() {
                purge.token.cancel();
            }
            (st.children.clone(), st.watch.take())
        };
        drop(watch);

        for child in &children {
            child.cancel_subtree();
        }
    }

    /// Forget that the contents were loaded; the next selection reloads.
    pub fn invalidate_loaded(&self) {
        self.state.lock().is_loaded = false;
    }

    /// Purge every object in this subtree.
    pub fn invalidate_cache(&self) {
        let (objects, children) = {
            let st = self.state.lock();
            (st.objects.clone(), st.children.clone())
        };

        for object in &objects {
            object.purge();
        }
        for child in &children {
            child.invalidate_cache();
        }
    }

    /// Depth-first search of the loaded subtree, excluding `self`.
    #[must_use]
    pub fn find_descendant(&self, identifier: &str) -> Option<ContainerRef> {
        for child in self.children() {
            if child.identifier == identifier {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(identifier) {
                return Some(found);
            }
        }
        None
    }
}

pub struct ContainerBuilder {
    identifier: CompactString,
    name: CompactString,
    icon: Option<CompactString>,
    data: BackendData,
    fetch: Arc<dyn ContentFetch>,
    filter: FilterState,
}

impl ContainerBuilder {
    #[must_use]
    pub fn icon(mut self, icon: impl Into<CompactString>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    #[must_use]
    pub fn data(mut self, data: BackendData) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: FilterState) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn build(self) -> ContainerRef {
        Arc::new(Container {
            identifier: self.identifier,
            name: self.name,
            icon: self.icon,
            data: self.data,
            fetch: self.fetch,
            state: Mutex::new(ContainerState {
                filter: self.filter,
                ..ContainerState::default()
            }),
            parent: RwLock::new(ParentRef::Detached),
        })
    }
}
