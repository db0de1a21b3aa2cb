//! `src/model/node_state.rs`
//! ============================================================
//! Persisted tree state and the stores that hold it.
//!
//! The on-disk shape is recursive: every node records whether it is
//! expanded plus the states of its children, keyed by [`state_key`].
//! Restoration tolerates a tree that has not been populated yet.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs as TokioFs;
use tracing::{debug, info};

use crate::{
    error::{CatalogError, CatalogResult},
    model::statistics::StatisticsSnapshot,
};

pub const STATE_VERSION: u32 = 1;

/// Key under which a node's state is stored in its parent's `children`.
#[must_use]
pub fn state_key(identifier: &str) -> CompactString {
    identifier.replace('.', "-").into()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    #[serde(default)]
    pub is_expanded: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<CompactString, NodeState>,

    /// Backend-owned values, e.g. folders a user added to a source
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NodeState {
    #[must_use]
    pub fn expanded() -> Self {
        Self {
            is_expanded: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn child(&self, identifier: &str) -> Option<&Self> {
        self.children.get(&state_key(identifier))
    }

    pub fn insert_child(&mut self, identifier: &str, state: Self) {
        self.children.insert(state_key(identifier), state);
    }

    /// True if this node or anything below it is expanded.
    #[must_use]
    pub fn has_expanded_descendant(&self) -> bool {
        self.is_expanded || self.children.values().any(Self::has_expanded_descendant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryState {
    pub version: u32,

    #[serde(default)]
    pub sections: BTreeMap<CompactString, NodeState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_container: Option<CompactString>,

    #[serde(default)]
    pub statistics: StatisticsSnapshot,
}

impl Default for LibraryState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            sections: BTreeMap::new(),
            selected_container: None,
            statistics: StatisticsSnapshot::default(),
        }
    }
}

/// Where library state is saved between runs.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn save_state(&self, state: &LibraryState) -> CatalogResult<()>;

    /// `None` when nothing has been saved yet.
    async fn load_state(&self) -> CatalogResult<Option<LibraryState>>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<LibraryState>>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_state(state: LibraryState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    #[must_use]
    pub fn current(&self) -> Option<LibraryState> {
        self.state.lock().clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_state(&self, state: &LibraryState) -> CatalogResult<()> {
        *self.state.lock() = Some(state.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    async fn load_state(&self) -> CatalogResult<Option<LibraryState>> {
        Ok(self.state.lock().clone())
    }
}

/// Pretty JSON file, replaced atomically through a temp file and rename.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn save_state(&self, state: &LibraryState) -> CatalogResult<()> {
        let context = self.path.display().to_string();

        if let Some(parent) = self.path.parent() {
            TokioFs::create_dir_all(parent)
                .await
                .map_err(|e| CatalogError::from_io(&e, &context))?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let temp_path = self.path.with_extension("json.tmp");

        TokioFs::write(&temp_path, &json)
            .await
            .map_err(|e| CatalogError::from_io(&e, &context))?;
        TokioFs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| CatalogError::from_io(&e, &context))?;

        info!(
            marker = "STATE_PERSISTENCE",
            operation_type = "state_save",
            path = %self.path.display(),
            bytes = json.len(),
            "Library state saved"
        );

        Ok(())
    }

    async fn load_state(&self) -> CatalogResult<Option<LibraryState>> {
        let bytes = match TokioFs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    marker = "STATE_PERSISTENCE",
                    operation_type = "state_load",
                    path = %self.path.display(),
                    "No saved state"
                );
                return Ok(None);
            }
            Err(e) => return Err(CatalogError::from_io(&e, &self.path.display().to_string())),
        };

        let state: LibraryState = serde_json::from_slice(&bytes)?;
        Ok(Some(state))
    }
}
