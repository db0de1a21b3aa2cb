//! Local-filesystem backend.
//!
//! * [`FolderSource`] offers the configured root folders plus folders the
//!   user added at runtime; the latter are persisted in the source's state.
//! * [`FolderFetch`] lists one folder: subfolders become child containers,
//!   files become objects. A loaded folder is watched for outside changes
//!   when watching is enabled.
//! * [`FileBackend`] serves an object's resources straight from its file.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use bytes::Bytes;
use compact_str::{CompactString, format_compact};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    backends::folder_watch::watch_handle,
    config::{FolderConfig, FolderWatchConfig},
    error::{CatalogError, CatalogResult},
    fs::{dir_scanner::scan_folder, object_info::FileInfo},
    model::{
        container::{
            ChangeCallback, Container, ContainerRef, ContentFetch, Contents, FetchRequest,
            WatchHandle,
        },
        object::{BackendData, MediaKind, MetadataMap, Object, ObjectBackend, ObjectRef, Thumbnail},
        source::{Source, SourceFetch, SourceRef, SourceRequest},
    },
};

pub const SOURCE_ID: &str = "FolderSource";
pub const FOLDER_PREFIX: &str = "Folder:";
pub const FILE_PREFIX: &str = "File:";

/// Key of the user-added folder list in the source's persisted extras.
const USER_FOLDERS_KEY: &str = "folders";

#[must_use]
pub fn folder_identifier(path: &Path) -> CompactString {
    format_compact!("{FOLDER_PREFIX}{}", path.display())
}

#[must_use]
pub fn file_identifier(path: &Path) -> CompactString {
    format_compact!("{FILE_PREFIX}{}", path.display())
}

/// Backend data of a folder container.
#[derive(Debug)]
pub struct FolderData {
    pub path: PathBuf,
}

/// Backend data of a file object.
#[derive(Debug)]
pub struct FileData {
    pub info: FileInfo,
}

fn file_data<'a>(identifier: &str, data: &'a BackendData) -> CatalogResult<&'a FileData> {
    data.as_ref()
        .downcast_ref::<FileData>()
        .ok_or_else(|| CatalogError::failed(format!("{identifier} is not a file object")))
}

fn display_name(path: &Path) -> CompactString {
    path.file_name().map_or_else(
        || CompactString::from(path.to_string_lossy()),
        |name| CompactString::from(name.to_string_lossy()),
    )
}

/* ============================ FileBackend ============================ */

#[derive(Debug, Default)]
pub struct FileBackend;

#[async_trait]
impl ObjectBackend for FileBackend {
    /// Image files are their own thumbnail; decoding and scaling belong to
    /// the presentation layer.
    async fn thumbnail(&self, identifier: &str, data: &BackendData) -> CatalogResult<Thumbnail> {
        let file = file_data(identifier, data)?;
        if file.info.media_kind() != MediaKind::Image {
            return Err(CatalogError::thumbnail_failed(identifier, "no preview for this kind of file"));
        }

        let bytes = tokio::fs::read(&*file.info.path)
            .await
            .map_err(|e| CatalogError::thumbnail_failed(identifier, e.to_string()))?;
        Ok(Thumbnail::from_bytes(Bytes::from(bytes)))
    }

    async fn metadata(&self, identifier: &str, data: &BackendData) -> CatalogResult<MetadataMap> {
        let file = file_data(identifier, data)?;
        let info = FileInfo::from_path(&file.info.path)
            .await
            .map_err(|e| CatalogError::metadata_failed(identifier, e.to_string()))?;
        Ok(info.metadata_map())
    }

    async fn local_file(&self, identifier: &str, data: &BackendData) -> CatalogResult<PathBuf> {
        let file = file_data(identifier, data)?;
        let path: &Path = &file.info.path;
        match tokio::fs::try_exists(path).await {
            Ok(true) => Ok(path.to_path_buf()),
            Ok(false) => Err(CatalogError::download_failed(identifier, "file no longer exists")),
            Err(e) => Err(CatalogError::download_failed(identifier, e.to_string())),
        }
    }
}

/* ============================ FolderFetch ============================ */

pub struct FolderFetch {
    show_hidden: bool,
    /// `None` when outside changes are not watched
    watch: Option<FolderWatchConfig>,
    backend: Arc<FileBackend>,
    /// Handed to the child containers a listing creates
    me: Weak<FolderFetch>,
}

impl FolderFetch {
    /// A fetch that never watches folders.
    #[must_use]
    pub fn new(show_hidden: bool) -> Arc<Self> {
        Self::build(show_hidden, None)
    }

    #[must_use]
    pub fn with_config(config: &FolderConfig) -> Arc<Self> {
        let watch = config.watch.enabled.then(|| config.watch.clone());
        Self::build(config.show_hidden, watch)
    }

    fn build(show_hidden: bool, watch: Option<FolderWatchConfig>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            show_hidden,
            watch,
            backend: Arc::new(FileBackend),
            me: me.clone(),
        })
    }

    /// Container listing `path` through this fetch.
    pub fn container(self: &Arc<Self>, path: &Path) -> ContainerRef {
        Container::builder(
            folder_identifier(path),
            display_name(path),
            Arc::clone(self) as Arc<dyn ContentFetch>,
        )
        .icon("folder")
        .data(Arc::new(FolderData {
            path: path.to_path_buf(),
        }) as BackendData)
        .build()
    }

    fn object(&self, info: FileInfo) -> ObjectRef {
        Object::builder(
            file_identifier(&info.path),
            info.name.clone(),
            Arc::clone(&self.backend) as Arc<dyn ObjectBackend>,
        )
        .kind(info.media_kind())
        .created(info.created_utc())
        .data(Arc::new(FileData { info }) as BackendData)
        .build()
    }
}

#[async_trait]
impl ContentFetch for FolderFetch {
    async fn fetch(&self, request: FetchRequest) -> CatalogResult<Contents> {
        let folder = request
            .data
            .as_ref()
            .downcast_ref::<FolderData>()
            .ok_or_else(|| CatalogError::failed(format!("{} is not a folder", request.identifier)))?;
        let this = self
            .me
            .upgrade()
            .ok_or_else(|| CatalogError::cancelled(&request.identifier))?;

        let entries = scan_folder(&folder.path, self.show_hidden, &request.token).await?;
        request.ensure_active()?;

        let mut containers = Vec::new();
        let mut objects = Vec::new();
        for entry in entries {
            if entry.is_dir {
                containers.push(this.container(&entry.path));
            } else {
                objects.push(self.object(entry));
            }
        }

        let objects = request.filter.apply(&objects, &request.statistics);
        Ok(Contents::new(containers, objects))
    }

    fn watch(
        &self,
        data: &BackendData,
        on_change: ChangeCallback,
    ) -> CatalogResult<Option<WatchHandle>> {
        let Some(config) = &self.watch else {
            return Ok(None);
        };
        let folder = data
            .as_ref()
            .downcast_ref::<FolderData>()
            .ok_or_else(|| CatalogError::failed("not a folder"))?;
        watch_handle(&folder.path, config, on_change).map(Some)
    }
}

/* ============================ FolderSource ============================ */

pub struct FolderSource {
    roots: Vec<PathBuf>,
    user_folders: RwLock<Vec<PathBuf>>,
    fetch: Arc<FolderFetch>,
}

impl FolderSource {
    #[must_use]
    pub fn new(config: &FolderConfig) -> Arc<Self> {
        Arc::new(Self {
            roots: config.roots.clone(),
            user_folders: RwLock::new(Vec::new()),
            fetch: FolderFetch::with_config(config),
        })
    }

    /// Wrap into a [`Source`] node.
    #[must_use]
    pub fn into_source(self: Arc<Self>, name: &str) -> SourceRef {
        Source::new(SOURCE_ID, name, self as Arc<dyn SourceFetch>)
    }

    #[must_use]
    pub fn folders(&self) -> Vec<PathBuf> {
        let mut folders = self.roots.clone();
        for folder in self.user_folders.read().iter() {
            if !folders.contains(folder) {
                folders.push(folder.clone());
            }
        }
        folders
    }

    #[must_use]
    pub fn user_folders(&self) -> Vec<PathBuf> {
        self.user_folders.read().clone()
    }

    /// Returns `false` if the folder is already offered. The source needs a
    /// reload to show it.
    pub fn add_folder(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.roots.contains(&path) {
            return false;
        }
        let mut folders = self.user_folders.write();
        if folders.contains(&path) {
            return false;
        }
        info!(
            marker = "FOLDER_SOURCE",
            operation_type = "folder_added",
            path = %path.display(),
            "Folder added"
        );
        folders.push(path);
        true
    }

    pub fn remove_folder(&self, path: &Path) -> bool {
        let mut folders = self.user_folders.write();
        let before = folders.len();
        folders.retain(|p| p != path);
        folders.len() != before
    }
}

#[async_trait]
impl SourceFetch for FolderSource {
    async fn fetch(&self, request: SourceRequest) -> CatalogResult<Vec<ContainerRef>> {
        let mut containers = Vec::new();

        for folder in self.folders() {
            if request.token.is_cancelled() {
                return Err(CatalogError::cancelled(&request.identifier));
            }

            match tokio::fs::metadata(&folder).await {
                Ok(meta) if meta.is_dir() => containers.push(self.fetch.container(&folder)),
                Ok(_) => warn!(
                    marker = "FOLDER_SOURCE",
                    operation_type = "not_a_folder",
                    path = %folder.display(),
                    "Configured folder is not a directory"
                ),
                Err(e) => warn!(
                    marker = "FOLDER_SOURCE",
                    operation_type = "folder_unavailable",
                    path = %folder.display(),
                    error = %e,
                    "Configured folder is unavailable"
                ),
            }
        }

        Ok(containers)
    }

    fn state_extras(&self) -> Map<String, Value> {
        let folders: Vec<Value> = self
            .user_folders
            .read()
            .iter()
            .map(|p| Value::String(p.to_string_lossy().into_owned()))
            .collect();

        let mut extras = Map::new();
        if !folders.is_empty() {
            extras.insert(USER_FOLDERS_KEY.to_owned(), Value::Array(folders));
        }
        extras
    }

    fn restore_extras(&self, extras: &Map<String, Value>) {
        let Some(Value::Array(folders)) = extras.get(USER_FOLDERS_KEY) else {
            return;
        };
        // Saved folders come first; folders added before the restore are kept.
        let mut current = self.user_folders.write();
        let mut merged: Vec<PathBuf> = Vec::with_capacity(folders.len() + current.len());
        let saved = folders.iter().filter_map(Value::as_str).map(PathBuf::from);
        for path in saved.chain(current.drain(..)) {
            if !self.roots.contains(&path) && !merged.contains(&path) {
                merged.push(path);
            }
        }
        *current = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{
            filter::{FilterState, SortDirection, SortKey},
            object::MetadataValue,
            statistics::Statistics,
        },
        operators::load_pipeline::LoadPipeline,
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn request(container: &ContainerRef, filter: FilterState, statistics: Arc<Statistics>) -> FetchRequest {
        FetchRequest {
            identifier: container.identifier().clone(),
            data: Arc::clone(container.data()),
            filter,
            token: CancellationToken::new(),
            statistics,
        }
    }

    fn names(objects: &[ObjectRef]) -> Vec<&str> {
        objects.iter().map(|o| o.name()).collect()
    }

    fn photo_folder() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("beach.jpg"), b"jpeg-bytes").unwrap();
        std::fs::write(dir.path().join("Alps.png"), b"png").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        std::fs::write(dir.path().join(".hidden.jpg"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("2024")).unwrap();
        dir
    }

    #[tokio::test]
    async fn folder_listing_splits_folders_and_files() {
        let dir = photo_folder();
        let fetch = FolderFetch::new(false);
        let root = fetch.container(dir.path());

        let contents = fetch
            .fetch(request(&root, FilterState::default(), Arc::new(Statistics::new())))
            .await
            .unwrap();

        assert_eq!(contents.containers.len(), 1);
        assert_eq!(contents.containers[0].name(), "2024");
        assert_eq!(contents.containers[0].icon(), Some("folder"));
        assert_eq!(names(&contents.objects), ["Alps.png", "beach.jpg", "notes.txt"]);

        let beach = &contents.objects[1];
        assert_eq!(beach.kind(), MediaKind::Image);
        assert_eq!(*beach.identifier(), file_identifier(&dir.path().join("beach.jpg")));
    }

    #[tokio::test]
    async fn search_rating_and_sort_apply_to_files() {
        let dir = photo_folder();
        let fetch = FolderFetch::new(false);
        let root = fetch.container(dir.path());
        let statistics = Arc::new(Statistics::new());
        statistics.set_rating(&file_identifier(&dir.path().join("notes.txt")), 5);
        statistics.set_rating(&file_identifier(&dir.path().join("beach.jpg")), 3);

        let searched = fetch
            .fetch(request(&root, FilterState::with_search("BEA"), Arc::clone(&statistics)))
            .await
            .unwrap();
        assert_eq!(names(&searched.objects), ["beach.jpg"]);
        assert_eq!(searched.containers.len(), 1);

        let rated = FilterState {
            rating_threshold: 3,
            sort_key: SortKey::Rating,
            sort_direction: SortDirection::Descending,
            ..FilterState::default()
        };
        let listed = fetch.fetch(request(&root, rated, statistics)).await.unwrap();
        assert_eq!(names(&listed.objects), ["notes.txt", "beach.jpg"]);
    }

    #[tokio::test]
    async fn missing_folder_fails_with_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = FolderFetch::new(false);
        let gone = fetch.container(&dir.path().join("gone"));

        let err = fetch
            .fetch(request(&gone, FilterState::default(), Arc::new(Statistics::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_resources_come_from_the_file() {
        let dir = photo_folder();
        let fetch = FolderFetch::new(false);
        let root = fetch.container(dir.path());
        let contents = fetch
            .fetch(request(&root, FilterState::default(), Arc::new(Statistics::new())))
            .await
            .unwrap();
        let beach = contents.objects[1].clone();
        let notes = contents.objects[2].clone();

        let thumb = beach.thumbnail().await.unwrap();
        assert_eq!(thumb.bytes, Bytes::from_static(b"jpeg-bytes"));

        let metadata = beach.metadata().await.unwrap();
        assert_eq!(metadata.get("size"), Some(&MetadataValue::Integer(10)));

        assert!(matches!(
            notes.thumbnail().await,
            Err(CatalogError::ThumbnailFailed { .. })
        ));

        assert_eq!(beach.local_file().await.unwrap(), dir.path().join("beach.jpg"));
        std::fs::remove_file(dir.path().join("notes.txt")).unwrap();
        assert!(matches!(
            notes.local_file().await,
            Err(CatalogError::DownloadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn pipeline_loads_nested_folders() {
        let dir = photo_folder();
        std::fs::write(dir.path().join("2024").join("jan.jpg"), b"j").unwrap();

        let fetch = FolderFetch::new(false);
        let root = fetch.container(dir.path());
        let pipeline = LoadPipeline::new(Arc::new(Statistics::new()));

        pipeline.load(&root).await.unwrap();
        let year = root.children()[0].clone();
        assert!(!year.is_loaded());

        pipeline.load(&year).await.unwrap();
        assert_eq!(names(&year.objects()), ["jan.jpg"]);
        assert_eq!(year.parent_container().unwrap().identifier(), root.identifier());
    }

    #[tokio::test]
    async fn source_lists_roots_and_user_folders() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let config = FolderConfig {
            roots: vec![first.path().to_path_buf(), first.path().join("missing")],
            show_hidden: false,
            ..FolderConfig::default()
        };
        let folders = FolderSource::new(&config);
        assert!(folders.add_folder(second.path()));
        assert!(!folders.add_folder(second.path()));
        assert!(!folders.add_folder(first.path()));

        let listed = folders
            .fetch(SourceRequest {
                identifier: SOURCE_ID.into(),
                token: CancellationToken::new(),
            })
            .await
            .unwrap();
        let ids: Vec<CompactString> = listed.iter().map(|c| c.identifier().clone()).collect();
        assert_eq!(
            ids,
            [folder_identifier(first.path()), folder_identifier(second.path())]
        );
    }

    #[test]
    fn user_folders_round_trip_through_extras() {
        let folders = FolderSource::new(&FolderConfig::default());
        folders.add_folder("/media/photos");
        let extras = folders.state_extras();

        let restored = FolderSource::new(&FolderConfig::default());
        restored.restore_extras(&extras);
        assert_eq!(restored.user_folders(), [PathBuf::from("/media/photos")]);

        assert!(restored.remove_folder(Path::new("/media/photos")));
        assert!(restored.state_extras().is_empty());
    }

    #[test]
    fn restore_keeps_folders_added_beforehand() {
        let saved = FolderSource::new(&FolderConfig::default());
        saved.add_folder("/media/old");
        saved.add_folder("/media/shared");
        let extras = saved.state_extras();

        let folders = FolderSource::new(&FolderConfig {
            roots: vec![PathBuf::from("/media/root")],
            ..FolderConfig::default()
        });
        folders.add_folder("/media/from-cli");
        folders.add_folder("/media/shared");
        folders.restore_extras(&extras);

        assert_eq!(
            folders.user_folders(),
            [
                PathBuf::from("/media/old"),
                PathBuf::from("/media/shared"),
                PathBuf::from("/media/from-cli"),
            ]
        );
    }

    #[tokio::test]
    async fn loaded_folder_reloads_when_a_file_appears() {
        let dir = photo_folder();
        let config = FolderConfig {
            watch: FolderWatchConfig {
                enabled: true,
                poll_interval: Duration::from_millis(50),
                debounce: Duration::from_millis(50),
            },
            ..FolderConfig::default()
        };
        let fetch = FolderFetch::with_config(&config);
        let root = fetch.container(dir.path());
        let year = fetch.container(&dir.path().join("2024"));
        let pipeline = LoadPipeline::new(Arc::new(Statistics::new()));

        pipeline.load(&root).await.unwrap();
        assert!(root.is_watched());
        assert!(!year.is_watched());
        assert!(!names(&root.objects()).contains(&"sunset.jpg"));

        std::fs::write(dir.path().join("sunset.jpg"), b"jpeg").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !names(&root.objects()).contains(&"sunset.jpg") {
            assert!(tokio::time::Instant::now() < deadline, "folder was not reloaded");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        root.cancel_subtree();
        assert!(!root.is_watched());
    }

    #[tokio::test]
    async fn watching_can_be_disabled() {
        let dir = photo_folder();
        let config = FolderConfig {
            watch: FolderWatchConfig {
                enabled: false,
                ..FolderWatchConfig::default()
            },
            ..FolderConfig::default()
        };
        let root = FolderFetch::with_config(&config).container(dir.path());

        LoadPipeline::new(Arc::new(Statistics::new()))
            .load(&root)
            .await
            .unwrap();
        assert!(root.is_loaded());
        assert!(!root.is_watched());
    }
}
