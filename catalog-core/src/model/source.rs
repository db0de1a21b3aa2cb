//! Sources: the roots of one backend (a folder set, a cloud account, an
//! app library) inside a section. A source lists its top-level containers
//! through [`SourceFetch`] and may keep backend-owned values in its state.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    error::CatalogResult,
    model::{
        container::{ContainerRef, LoadJob, ParentRef},
        node_state::NodeState,
        section::Section,
    },
};

pub type SourceRef = Arc<Source>;

#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub identifier: CompactString,
    pub token: CancellationToken,
}

/// Lists the top-level containers of a source.
#[async_trait]
pub trait SourceFetch: Send + Sync + 'static {
    async fn fetch(&self, request: SourceRequest) -> CatalogResult<Vec<ContainerRef>>;

    /// Extra values to persist with the source's state.
    fn state_extras(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Counterpart of [`SourceFetch::state_extras`], called before the first load.
    fn restore_extras(&self, _extras: &Map<String, Value>) {}
}

#[derive(Default)]
pub(crate) struct SourceState {
    pub(crate) containers: Vec<ContainerRef>,
    pub(crate) is_loaded: bool,
    pub(crate) is_expanded: bool,
    pub(crate) load: Option<LoadJob>,
    pub(crate) saved: Option<NodeState>,
}

pub struct Source {
    identifier: CompactString,
    name: CompactString,
    fetch: Arc<dyn SourceFetch>,
    pub(crate) state: Mutex<SourceState>,
    section: RwLock<Weak<Section>>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Source {
    #[must_use]
    pub fn new(
        identifier: impl Into<CompactString>,
        name: impl Into<CompactString>,
        fetch: Arc<dyn SourceFetch>,
    ) -> SourceRef {
        Arc::new(Self {
            identifier: identifier.into(),
            name: name.into(),
            fetch,
            state: Mutex::new(SourceState {
                is_expanded: true,
                ..SourceState::default()
            }),
            section: RwLock::new(Weak::new()),
        })
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

    pub(crate) fn fetcher(&self) -> Arc<dyn SourceFetch> {
        Arc::clone(&self.fetch)
    }

    #[must_use]
    pub fn section(&self) -> Option<Arc<Section>> {
        self.section.read().upgrade()
    }

    pub(crate) fn set_section(&self, section: Weak<Section>) {
        *self.section.write() = section;
    }

    #[must_use]
    pub fn containers(&self) -> Vec<ContainerRef> {
        self.state.lock().containers.clone()
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

    pub fn set_expanded(&self, expanded: bool) {
        self.state.lock().is_expanded = expanded;
    }

    /// Apply restored state ahead of the first load.
    pub fn restore(&self, state: &NodeState) {
        self.fetch.restore_extras(&state.extra);

        let mut st = self.state.lock();
        st.is_expanded = state.is_expanded;
        st.saved = Some(state.clone());
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeState {
        let (is_expanded, containers, saved) = {
            let st = self.state.lock();
            (st.is_expanded, st.containers.clone(), st.saved.clone())
        };

        let mut node = saved.unwrap_or_default();
        node.is_expanded = is_expanded;
        node.extra = self.fetch.state_extras();
        for container in &containers {
            node.insert_child(container.identifier(), container.snapshot());
        }
        node
    }

    /// Attach a top-level container, replacing one with the same identifier.
    pub fn add_container(self: &Arc<Self>, container: ContainerRef) {
        container.set_parent(ParentRef::Source(Arc::downgrade(self)));

        let replaced = {
            let mut st = self.state.lock();
            match st
                .containers
                .iter()
                .position(|c| c.identifier() == container.identifier())
            {
                Some(idx) => Some(std::mem::replace(&mut st.containers[idx], container)),
                None => {
                    st.containers.push(container);
                    None
                }
            }
        };

        if let Some(old) = replaced {
            old.cancel_subtree();
        }
    }

    pub fn remove_container(&self, identifier: &str) -> Option<ContainerRef> {
        let removed = {
            let mut st = self.state.lock();
            let idx = st
                .containers
                .iter()
                .position(|c| c.identifier() == identifier)?;
            st.containers.remove(idx)
        };

        removed.set_parent(ParentRef::Detached);
        removed.cancel_subtree();
        Some(removed)
    }

    /// Cancel the source load and everything below it.
    pub fn cancel_subtree(&self) {
        let containers = {
            let mut st = self.state.lock();
            if let Some(job) = st.load.take() {
                job.token.cancel();
            }
            st.containers.clone()
        };

        for container in &containers {
            container.cancel_subtree();
        }
    }

    #[must_use]
    pub fn find_container(&self, identifier: &str) -> Option<ContainerRef> {
        for container in self.containers() {
            if container.identifier() == identifier {
                return Some(container);
            }
            if let Some(found) = container.find_descendant(identifier) {
                return Some(found);
            }
        }
        None
    }
}
