pub mod error;

pub mod config;

pub mod cache {
    pub mod resource_cache;
    pub use resource_cache::{CacheStatsSnapshot, ResourceCache, global_stats};
}

pub mod model {
    pub mod object;
    pub use object::{MediaKind, Object, ObjectRef, ResourceKind, Thumbnail};

    pub mod container;
    pub use container::{
        ChangeCallback, Container, ContainerRef, ContentFetch, Contents, FetchRequest, WatchHandle,
    };

    pub mod source;
    pub use source::{Source, SourceFetch, SourceRef, SourceRequest};

    pub mod section;
    pub use section::{Section, SectionRef};

    pub mod library;
    pub use library::{Library, LibraryOptions};

    pub mod filter;
    pub use filter::{FilterState, SortDirection, SortKey};

    pub mod statistics;

    pub mod node_state;
    pub use node_state::{JsonFileStateStore, LibraryState, NodeState, StateStore};
}

pub mod operators {
    pub mod load_pipeline;
    pub use load_pipeline::LoadPipeline;

    pub mod purge;

    pub mod pagination;
    pub use pagination::{Cursor, Page, PageSource, PagedContentFetch};

    pub mod backoff;

    pub mod suspension;
}

pub mod fs {
    pub mod dir_scanner;
    pub mod object_info;
}

pub mod backends {
    pub mod folder;
    pub use folder::FolderSource;

    pub mod folder_watch;
}

pub mod logging;

pub mod util {
    pub mod debounce;
}

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{CatalogError, CatalogResult};
pub use model::{Library, LibraryOptions};
