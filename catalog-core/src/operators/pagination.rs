//! Cursor accumulation for backends that list container contents page by page.
//!
//! A paged container carries a [`PagedData`] as its backend data. Every load
//! of the container fetches exactly one page through a [`PageSource`] and
//! merges it into the accumulated, identifier-keyed object list:
//!
//! * no cursor yet: first page for the current filter
//! * cursor stored: the page at that cursor
//! * exhausted: no request, the accumulated set is returned as is
//!
//! A change of search string or rating threshold discards the cursor and the
//! accumulated list. A change of sort order only re-sorts what is there.

use std::sync::Arc;

use async_trait::async_trait;
use compact_str::CompactString;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{CatalogError, CatalogResult},
    model::{
        container::{Container, ContainerRef, ContentFetch, Contents, FetchRequest},
        filter::FilterState,
        object::{BackendData, ObjectRef},
        statistics::Statistics,
    },
};

/// Opaque "where to resume" token of a remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(pub CompactString);

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Default)]
pub struct Page {
    pub objects: Vec<ObjectRef>,
    /// `None` once the listing is exhausted
    pub next: Option<Cursor>,
}

/// Remote listing API of one backend.
///
/// Implementations should abort the underlying request when `token` fires.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    async fn first_page(
        &self,
        remote_id: &str,
        filter: &FilterState,
        token: &CancellationToken,
    ) -> CatalogResult<Page>;

    async fn page_at(
        &self,
        remote_id: &str,
        cursor: &Cursor,
        filter: &FilterState,
        token: &CancellationToken,
    ) -> CatalogResult<Page>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum CursorState {
    #[default]
    NotStarted,
    At(Cursor),
    Exhausted,
}

enum Step {
    First,
    At(Cursor),
    Serve,
}

/// Cursor plus accumulated objects of one paged container.
#[derive(Debug, Default)]
pub struct PagedAccumulator {
    cursor: CursorState,
    filter: Option<FilterState>,
    objects: IndexMap<CompactString, ObjectRef>,
    /// Bumped on every reset so a page fetched before it is not merged after
    generation: u64,
}

impl PagedAccumulator {
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cursor == CursorState::Exhausted
    }

    fn reset(&mut self) {
        self.cursor = CursorState::NotStarted;
        self.objects.clear();
        self.generation += 1;
    }

    fn plan(&mut self, filter: &FilterState) -> (Step, u64) {
        let same_selection = self
            .filter
            .as_ref()
            .is_some_and(|stored| stored.selects_same_objects(filter));
        if !same_selection && self.filter.is_some() {
            self.reset();
        }
        self.filter = Some(filter.clone());

        let step = match &self.cursor {
            CursorState::NotStarted => Step::First,
            CursorState::At(cursor) => Step::At(cursor.clone()),
            CursorState::Exhausted => Step::Serve,
        };
        (step, self.generation)
    }

    /// Merge a page; re-seen identifiers replace their entry in place.
    fn absorb(&mut self, page: Page) -> usize {
        let before = self.objects.len();
        for object in page.objects {
            self.objects.insert(object.identifier().clone(), object);
        }
        self.cursor = page.next.map_or(CursorState::Exhausted, CursorState::At);
        self.objects.len() - before
    }

    /// Accumulated objects passing the rating threshold, sorted client-side.
    ///
    /// The search string is applied by the server.
    fn visible(&self, filter: &FilterState, statistics: &Statistics) -> Vec<ObjectRef> {
        let mut objects: Vec<ObjectRef> = self
            .objects
            .values()
            .filter(|o| filter.passes_rating(o.identifier(), statistics))
            .cloned()
            .collect();
        filter.sort(&mut objects, statistics);
        objects
    }
}

/// Backend data of a paged container.
#[derive(Debug)]
pub struct PagedData {
    remote_id: CompactString,
    accumulator: Mutex<PagedAccumulator>,
}

impl PagedData {
    #[must_use]
    pub fn new(remote_id: impl Into<CompactString>) -> Arc<Self> {
        Arc::new(Self {
            remote_id: remote_id.into(),
            accumulator: Mutex::new(PagedAccumulator::default()),
        })
    }

    #[must_use]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    #[must_use]
    pub fn accumulated(&self) -> usize {
        self.accumulator.lock().len()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.accumulator.lock().is_exhausted()
    }
}

/// [`ContentFetch`] of paged containers. Paged containers have no child
/// containers.
pub struct PagedContentFetch<S> {
    source: S,
}

impl<S: PageSource> PagedContentFetch<S> {
    #[must_use]
    pub fn new(source: S) -> Arc<Self> {
        Arc::new(Self { source })
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// A container listing `remote_id` through this fetch.
    pub fn container(
        self: &Arc<Self>,
        identifier: impl Into<CompactString>,
        name: impl Into<CompactString>,
        remote_id: impl Into<CompactString>,
    ) -> ContainerRef {
        Container::builder(identifier, name, Arc::clone(self) as Arc<dyn ContentFetch>)
            .data(PagedData::new(remote_id) as BackendData)
            .build()
    }
}

#[async_trait]
impl<S: PageSource> ContentFetch for PagedContentFetch<S> {
    async fn fetch(&self, request: FetchRequest) -> CatalogResult<Contents> {
        let data = request
            .data
            .as_ref()
            .downcast_ref::<PagedData>()
            .ok_or_else(|| CatalogError::failed(format!("{} is not a paged container", request.identifier)))?;

        let (step, generation) = data.accumulator.lock().plan(&request.filter);

        let page = match step {
            Step::Serve => {
                debug!(
                    marker = "PAGINATION",
                    operation_type = "exhausted",
                    container = %request.identifier,
                    "Listing exhausted; serving accumulated objects"
                );
                let accumulator = data.accumulator.lock();
                let objects = accumulator.visible(&request.filter, &request.statistics);
                return Ok(Contents::new(Vec::new(), objects));
            }
            Step::First => {
                self.source
                    .first_page(&data.remote_id, &request.filter, &request.token)
                    .await?
            }
            Step::At(cursor) => {
                self.source
                    .page_at(&data.remote_id, &cursor, &request.filter, &request.token)
                    .await?
            }
        };

        request.ensure_active()?;

        let mut accumulator = data.accumulator.lock();
        if accumulator.generation != generation {
            return Err(CatalogError::cancelled(&request.identifier));
        }

        let received = page.objects.len();
        let added = accumulator.absorb(page);
        debug!(
            marker = "PAGINATION",
            operation_type = "page_absorbed",
            container = %request.identifier,
            received,
            added,
            total = accumulator.len(),
            exhausted = accumulator.is_exhausted(),
            "Page absorbed"
        );

        Ok(Contents::new(
            Vec::new(),
            accumulator.visible(&request.filter, &request.statistics),
        ))
    }
}
