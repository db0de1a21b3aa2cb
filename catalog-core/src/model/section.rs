//! Sections group sources under one heading of the library.

use std::sync::Arc;

use compact_str::CompactString;
use parking_lot::RwLock;

use crate::model::{
    container::ContainerRef,
    node_state::NodeState,
    source::SourceRef,
};

pub type SectionRef = Arc<Section>;

#[derive(Debug)]
pub struct Section {
    identifier: CompactString,
    name: CompactString,
    sources: RwLock<Vec<SourceRef>>,
}

impl Section {
    #[must_use]
    pub fn new(identifier: impl Into<CompactString>, name: impl Into<CompactString>) -> SectionRef {
        Arc::new(Self {
            identifier: identifier.into(),
            name: name.into(),
            sources: RwLock::new(Vec::new()),
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

    #[must_use]
    pub fn sources(&self) -> Vec<SourceRef> {
        self.sources.read().clone()
    }

    pub fn add_source(self: &Arc<Self>, source: SourceRef) {
        source.set_section(Arc::downgrade(self));

        let mut sources = self.sources.write();
        if let Some(existing) = sources
            .iter_mut()
            .find(|s| s.identifier() == source.identifier())
        {
            existing.cancel_subtree();
            *existing = source;
        } else {
            sources.push(source);
        }
    }

    /// Detach a source and cancel its in-flight loads.
    pub fn remove_source(&self, identifier: &str) -> Option<SourceRef> {
        let removed = {
            let mut sources = self.sources.write();
            let idx = sources.iter().position(|s| s.identifier() == identifier)?;
            sources.remove(idx)
        };

        removed.cancel_subtree();
        Some(removed)
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeState {
        let mut node = NodeState::expanded();
        for source in self.sources() {
            node.insert_child(source.identifier(), source.snapshot());
        }
        node
    }

    /// Hand each source its part of `state`.
    pub fn restore(&self, state: &NodeState) {
        for source in self.sources() {
            if let Some(sub) = state.child(source.identifier()) {
                source.restore(sub);
            }
        }
    }

    #[must_use]
    pub fn find_container(&self, identifier: &str) -> Option<ContainerRef> {
        self.sources()
            .iter()
            .find_map(|source| source.find_container(identifier))
    }
}
