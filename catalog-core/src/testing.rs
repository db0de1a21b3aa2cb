//! Fixtures shared by the in-module tests.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::{
    error::{CatalogError, CatalogResult},
    model::{
        container::{Container, ContainerRef, ContentFetch, Contents, FetchRequest},
        filter::FilterState,
        object::{BackendData, MetadataMap, MetadataValue, Object, ObjectBackend, ObjectRef, Thumbnail},
        source::{SourceFetch, SourceRequest},
    },
};

/// Backend answering every request from the identifier, counting calls.
#[derive(Debug, Default)]
pub struct CountingBackend {
    pub thumbnails: AtomicUsize,
    pub metadata: AtomicUsize,
    pub delay: Duration,
}

impl CountingBackend {
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl ObjectBackend for CountingBackend {
    async fn thumbnail(&self, identifier: &str, _data: &BackendData) -> CatalogResult<Thumbnail> {
        self.thumbnails.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(Thumbnail::from_bytes(Bytes::copy_from_slice(identifier.as_bytes())))
    }

    async fn metadata(&self, identifier: &str, _data: &BackendData) -> CatalogResult<MetadataMap> {
        self.metadata.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut map = MetadataMap::new();
        map.insert("identifier".into(), MetadataValue::from(identifier));
        Ok(map)
    }

    async fn local_file(&self, identifier: &str, _data: &BackendData) -> CatalogResult<PathBuf> {
        Ok(PathBuf::from("/tmp").join(identifier))
    }
}

pub fn object(identifier: &str) -> ObjectRef {
    Object::builder(identifier, identifier, Arc::new(CountingBackend::default())).build()
}

pub fn object_with(identifier: &str, backend: Arc<dyn ObjectBackend>) -> ObjectRef {
    Object::builder(identifier, identifier, backend).build()
}

pub fn object_created(identifier: &str, unix_secs: i64) -> ObjectRef {
    Object::builder(identifier, identifier, Arc::new(CountingBackend::default()))
        .created(DateTime::<Utc>::from_timestamp(unix_secs, 0))
        .build()
}

pub fn container<F: ContentFetch>(identifier: &str, fetch: Arc<F>) -> ContainerRef {
    Container::builder(identifier, identifier, fetch as Arc<dyn ContentFetch>).build()
}

struct Step {
    delay: Duration,
    honors_token: bool,
    outcome: CatalogResult<Contents>,
}

/// Content fetch that plays queued steps, then falls back to fixed contents.
pub struct ScriptedFetch {
    calls: AtomicUsize,
    steps: Mutex<VecDeque<Step>>,
    fallback: Contents,
    filters: Mutex<Vec<FilterState>>,
}

impl ScriptedFetch {
    pub fn empty() -> Arc<Self> {
        Self::returning(Contents::default())
    }

    pub fn returning(contents: Contents) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            steps: Mutex::new(VecDeque::new()),
            fallback: contents,
            filters: Mutex::new(Vec::new()),
        })
    }

    /// Queue a step whose delay ends early when the load is cancelled.
    pub fn push(&self, delay: Duration, outcome: CatalogResult<Contents>) {
        self.steps.lock().push_back(Step {
            delay,
            honors_token: true,
            outcome,
        });
    }

    pub fn push_uncancellable(&self, delay: Duration, outcome: CatalogResult<Contents>) {
        self.steps.lock().push_back(Step {
            delay,
            honors_token: false,
            outcome,
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn filters(&self) -> Vec<FilterState> {
        self.filters.lock().clone()
    }
}

#[async_trait]
impl ContentFetch for ScriptedFetch {
    async fn fetch(&self, request: FetchRequest) -> CatalogResult<Contents> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.filters.lock().push(request.filter.clone());

        let step = self.steps.lock().pop_front();
        let Some(step) = step else {
            return Ok(Contents::new(
                self.fallback.containers.clone(),
                self.fallback.objects.clone(),
            ));
        };

        if !step.delay.is_zero() {
            if step.honors_token {
                tokio::select! {
                    () = request.token.cancelled() => {
                        return Err(CatalogError::cancelled(&request.identifier));
                    }
                    () = tokio::time::sleep(step.delay) => {}
                }
            } else {
                tokio::time::sleep(step.delay).await;
            }
        }

        step.outcome
    }
}

/// Fetch that builds a fresh tree of containers from an adjacency list.
pub struct TreeFetch {
    shape: Arc<HashMap<CompactString, Vec<CompactString>>>,
    calls: Arc<Mutex<HashMap<CompactString, usize>>>,
}

impl TreeFetch {
    pub fn new(shape: &[(&str, &[&str])]) -> Self {
        let shape = shape
            .iter()
            .map(|(id, children)| {
                (
                    CompactString::from(*id),
                    children.iter().map(|c| CompactString::from(*c)).collect(),
                )
            })
            .collect();

        Self {
            shape: Arc::new(shape),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn handle(&self) -> Arc<Self> {
        Arc::new(Self {
            shape: Arc::clone(&self.shape),
            calls: Arc::clone(&self.calls),
        })
    }

    pub fn container(&self, identifier: &str) -> ContainerRef {
        container(identifier, self.handle())
    }

    pub fn calls(&self, identifier: &str) -> usize {
        self.calls.lock().get(identifier).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ContentFetch for TreeFetch {
    async fn fetch(&self, request: FetchRequest) -> CatalogResult<Contents> {
        *self.calls.lock().entry(request.identifier.clone()).or_insert(0) += 1;
        tokio::task::yield_now().await;
        request.ensure_active()?;

        let children: Vec<ContainerRef> = self
            .shape
            .get(&request.identifier)
            .map(|ids| ids.iter().map(|id| self.container(id)).collect())
            .unwrap_or_default();

        Ok(Contents::new(children, vec![object(&format!("{}/item", request.identifier))]))
    }
}

/// Source returning containers from a factory and remembering its extras.
pub struct StaticSource {
    factory: Box<dyn Fn() -> Vec<ContainerRef> + Send + Sync>,
    extras: Mutex<Map<String, Value>>,
}

impl StaticSource {
    pub fn new(containers: Vec<ContainerRef>) -> Self {
        Self::with_factory(move || containers.clone())
    }

    pub fn with_factory(factory: impl Fn() -> Vec<ContainerRef> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            extras: Mutex::new(Map::new()),
        }
    }

    pub fn restored_extras(&self) -> Map<String, Value> {
        self.extras.lock().clone()
    }
}

#[async_trait]
impl SourceFetch for StaticSource {
    async fn fetch(&self, request: SourceRequest) -> CatalogResult<Vec<ContainerRef>> {
        if request.token.is_cancelled() {
            return Err(CatalogError::cancelled(&request.identifier));
        }
        Ok((self.factory)())
    }

    fn state_extras(&self) -> Map<String, Value> {
        self.extras.lock().clone()
    }

    fn restore_extras(&self, extras: &Map<String, Value>) {
        *self.extras.lock() = extras.clone();
    }
}
