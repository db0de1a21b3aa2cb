//! `src/model/library.rs`
//! ============================================================
//! The library: root of the catalog tree and owner of everything that spans
//! more than one node.
//!
//! * sections, and through them sources and containers
//! * the load pipeline and the user statistics it filters and sorts by
//! * selection, with delayed purge of the container left behind
//! * persisted state: restore, debounced save, and deferred selection
//!   restore for containers that do not exist yet when state is restored
//! * debounced reload of the selected container after a filter change
//!
//! `Library` is a cheap handle; clones share one tree. It spawns background
//! tasks and must be created inside a tokio runtime.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::CatalogResult,
    model::{
        container::{Container, ContainerRef},
        filter::FilterState,
        node_state::{LibraryState, NodeState, STATE_VERSION, StateStore, state_key},
        section::SectionRef,
        source::SourceRef,
        statistics::Statistics,
    },
    operators::{backoff::Backoff, load_pipeline::LoadPipeline},
    util::debounce::{DebounceConfig, Debouncer},
};

const SAVE_KEY: &str = "library-state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryOptions {
    /// Grace period before a deselected container's resources are purged
    pub purge_delay: Duration,
    pub filter_debounce: DebounceConfig,
    pub save_debounce: DebounceConfig,
    /// Retry policy handed to backends that poll for generated renditions
    pub backoff: Backoff,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for LibraryOptions {
    fn from(config: &Config) -> Self {
        Self {
            purge_delay: config.purge.delay,
            filter_debounce: DebounceConfig::filter_input(&config.loading),
            save_debounce: DebounceConfig::state_save(&config.loading),
            backoff: Backoff::from(&config.backoff),
        }
    }
}

#[derive(Default)]
struct Selection {
    current: Weak<Container>,
    /// Restored selection whose container has not been created yet
    pending: Option<CompactString>,
}

struct LibraryInner {
    sections: RwLock<Vec<SectionRef>>,
    pipeline: LoadPipeline,
    statistics: Arc<Statistics>,
    store: Arc<dyn StateStore>,
    options: LibraryOptions,
    selection: Mutex<Selection>,
    restored: RwLock<Option<LibraryState>>,
    filter_reloads: Debouncer<Weak<Container>>,
    saves: Debouncer<()>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

impl Library {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, options: LibraryOptions) -> Self {
        let statistics = Arc::new(Statistics::new());
        let pipeline = LoadPipeline::new(Arc::clone(&statistics));
        let (filter_reloads, mut filter_rx) = Debouncer::new(options.filter_debounce);
        let (saves, mut save_rx) = Debouncer::new(options.save_debounce);

        let inner = Arc::new(LibraryInner {
            sections: RwLock::new(Vec::new()),
            pipeline,
            statistics,
            store,
            options,
            selection: Mutex::new(Selection::default()),
            restored: RwLock::new(None),
            filter_reloads,
            saves,
            consumers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.pipeline.set_creation_hook(Arc::new(move |container: &ContainerRef| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.on_container_created(container);
            }
        }));

        let weak = Arc::downgrade(&inner);
        let filter_consumer = tokio::spawn(async move {
            while let Some((_, container)) = filter_rx.recv().await {
                let (Some(inner), Some(container)) = (weak.upgrade(), container.upgrade()) else {
                    continue;
                };
                Self { inner }.reload_for_filter(&container);
            }
        });

        let weak = Arc::downgrade(&inner);
        let save_consumer = tokio::spawn(async move {
            while save_rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = (Self { inner }).save().await {
                    warn!(
                        marker = "STATE_PERSISTENCE",
                        operation_type = "state_save_failed",
                        error = %e,
                        "Debounced state save failed"
                    );
                }
            }
        });

        inner.consumers.lock().extend([filter_consumer, save_consumer]);
        Self { inner }
    }

    #[must_use]
    pub fn pipeline(&self) -> &LoadPipeline {
        &self.inner.pipeline
    }

    #[must_use]
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    #[must_use]
    pub fn options(&self) -> LibraryOptions {
        self.inner.options
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        self.inner.options.backoff
    }

    #[must_use]
    pub fn sections(&self) -> Vec<SectionRef> {
        self.inner.sections.read().clone()
    }

    /* ------------------------- tree edits -------------------------- */

    /// Attach a section, applying restored state if there is any.
    pub fn add_section(&self, section: SectionRef) {
        if let Some(state) = self.restored_section(section.identifier()) {
            section.restore(&state);
        }

        let mut sections = self.inner.sections.write();
        if let Some(existing) = sections
            .iter_mut()
            .find(|s| s.identifier() == section.identifier())
        {
            for source in existing.sources() {
                source.cancel_subtree();
            }
            *existing = section;
        } else {
            sections.push(section);
        }
    }

    pub fn remove_section(&self, identifier: &str) -> Option<SectionRef> {
        let removed = {
            let mut sections = self.inner.sections.write();
            let idx = sections.iter().position(|s| s.identifier() == identifier)?;
            sections.remove(idx)
        };
        for source in removed.sources() {
            source.cancel_subtree();
        }
        self.request_save();
        Some(removed)
    }

    /// Add a source to `section`, applying its restored state.
    pub fn add_source(&self, section: &SectionRef, source: SourceRef) {
        if let Some(state) = self
            .restored_section(section.identifier())
            .and_then(|s| s.child(source.identifier()).cloned())
        {
            source.restore(&state);
        }
        section.add_source(source);
    }

    #[must_use]
    pub fn find_container(&self, identifier: &str) -> Option<ContainerRef> {
        self.sections()
            .iter()
            .find_map(|section| section.find_container(identifier))
    }

    /* --------------------------- loading --------------------------- */

    /// Load every source; restored expansion cascades from there.
    pub fn load(&self) -> Vec<JoinHandle<()>> {
        self.sections()
            .iter()
            .flat_map(|section| section.sources())
            .map(|source| self.inner.pipeline.load_source(&source))
            .collect()
    }

    pub async fn wait_idle(&self) {
        self.inner.pipeline.wait_idle().await;
    }

    /// "Scrolled near the end of the list" for a paged container.
    pub fn next_page(&self, container: &ContainerRef) -> Option<JoinHandle<()>> {
        self.inner.pipeline.next_page(container)
    }

    /// Expanding an unloaded container loads it.
    pub fn set_expanded(&self, container: &ContainerRef, expanded: bool) {
        container.set_expanded(expanded);
        if expanded && !container.is_loaded() && !container.is_loading() {
            self.inner.pipeline.load(container);
        }
        self.request_save();
    }

    pub fn set_source_expanded(&self, source: &SourceRef, expanded: bool) {
        source.set_expanded(expanded);
        self.request_save();
    }

    /// Change the filter of `container`. A selected container reloads once
    /// edits settle; any other container reloads when next selected.
    pub fn set_filter(&self, container: &ContainerRef, filter: FilterState) {
        if container.filter() == filter {
            return;
        }
        container.set_filter(filter);

        if container.is_selected() {
            self.inner
                .filter_reloads
                .submit(container.identifier(), Arc::downgrade(container));
        } else {
            container.invalidate_loaded();
        }
    }

    fn reload_for_filter(&self, container: &ContainerRef) {
        if !container.is_selected() {
            return;
        }
        debug!(
            marker = "CONTAINER_LOAD",
            operation_type = "filter_reload",
            container = %container.identifier(),
            "Filter changed; reloading selected container"
        );
        container.invalidate_loaded();
        self.inner.pipeline.load(container);
    }

    /* -------------------------- selection -------------------------- */

    #[must_use]
    pub fn selected(&self) -> Option<ContainerRef> {
        self.inner.selection.lock().current.upgrade()
    }

    #[must_use]
    pub fn pending_selection(&self) -> Option<CompactString> {
        self.inner.selection.lock().pending.clone()
    }

    /// Select `container` (or nothing). The previous selection's resources
    /// are purged after the configured delay unless it is selected again.
    pub fn select(&self, container: Option<&ContainerRef>) {
        let previous = {
            let mut selection = self.inner.selection.lock();
            let previous = selection.current.upgrade();
            selection.current = container.map(Arc::downgrade).unwrap_or_default();
            selection.pending = None;
            previous
        };

        if let Some(previous) = previous {
            if !container.is_some_and(|c| Arc::ptr_eq(c, &previous)) {
                previous.set_selected(false);
                previous.request_purge(self.inner.options.purge_delay);
            }
        }

        if let Some(container) = container {
            container.set_selected(true);
            container.cancel_purge();
            if !container.is_loaded() && !container.is_loading() {
                self.inner.pipeline.load(container);
            }
            info!(
                marker = "SELECTION",
                operation_type = "container_selected",
                container = %container.identifier(),
                "Container selected"
            );
        }

        self.request_save();
    }

    fn on_container_created(&self, container: &ContainerRef) {
        let wanted = self
            .inner
            .selection
            .lock()
            .pending
            .as_deref()
            .is_some_and(|id| container.identifier() == id);

        if wanted {
            debug!(
                marker = "SELECTION",
                operation_type = "deferred_selection",
                container = %container.identifier(),
                "Restored selection applied"
            );
            self.select(Some(container));
        }
    }

    /* ------------------------- statistics -------------------------- */

    pub fn set_rating(&self, identifier: &str, rating: u8) {
        self.inner.statistics.set_rating(identifier, rating);
        self.request_save();
    }

    pub fn record_use(&self, identifier: &str) -> u32 {
        let count = self.inner.statistics.increment_use_count(identifier);
        self.request_save();
        count
    }

    /* ------------------------ persistence -------------------------- */

    fn restored_section(&self, identifier: &str) -> Option<NodeState> {
        self.inner
            .restored
            .read()
            .as_ref()
            .and_then(|state| state.sections.get(&state_key(identifier)).cloned())
    }

    /// Snapshot of the whole tree. Sections that were restored but are not
    /// attached keep their restored state.
    #[must_use]
    pub fn state(&self) -> LibraryState {
        let mut state = LibraryState {
            statistics: self.inner.statistics.snapshot(),
            ..LibraryState::default()
        };

        if let Some(restored) = self.inner.restored.read().as_ref() {
            state.sections = restored.sections.clone();
        }
        for section in self.sections() {
            state
                .sections
                .insert(state_key(section.identifier()), section.snapshot());
        }

        let selection = self.inner.selection.lock();
        state.selected_container = selection
            .current
            .upgrade()
            .map(|c| c.identifier().clone())
            .or_else(|| selection.pending.clone());

        state
    }

    /// Load saved state and apply it to the (possibly still empty) tree.
    pub async fn restore(&self) -> CatalogResult<()> {
        let Some(state) = self.inner.store.load_state().await? else {
            return Ok(());
        };

        if state.version > STATE_VERSION {
            warn!(
                marker = "STATE_PERSISTENCE",
                operation_type = "state_restore",
                version = state.version,
                "Saved state is from a newer version; ignored"
            );
            return Ok(());
        }

        self.inner.statistics.restore(&state.statistics);
        for section in self.sections() {
            if let Some(sub) = state.sections.get(&state_key(section.identifier())) {
                section.restore(sub);
            }
        }

        let selected = state.selected_container.clone();
        *self.inner.restored.write() = Some(state);

        if let Some(identifier) = selected {
            match self.find_container(&identifier) {
                Some(container) => self.select(Some(&container)),
                None => self.inner.selection.lock().pending = Some(identifier),
            }
        }

        info!(
            marker = "STATE_PERSISTENCE",
            operation_type = "state_restore",
            pending_selection = ?self.pending_selection(),
            "Library state restored"
        );
        Ok(())
    }

    pub async fn save(&self) -> CatalogResult<()> {
        let state = self.state();
        self.inner.store.save_state(&state).await
    }

    /// Coalesce a burst of changes into one save.
    pub fn request_save(&self) {
        self.inner.saves.submit(SAVE_KEY, ());
    }

    /// Cancel every load, drop pending debounced work and save once.
    pub async fn shutdown(&self) -> CatalogResult<()> {
        self.inner.saves.cancel_all();
        self.inner.filter_reloads.cancel_all();

        for section in self.sections() {
            for source in section.sources() {
                source.cancel_subtree();
            }
        }

        let consumers = std::mem::take(&mut *self.inner.consumers.lock());
        for consumer in consumers {
            consumer.abort();
        }

        self.save().await
    }
}
