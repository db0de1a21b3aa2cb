//! `src/model/object.rs`
//! ============================================================
//! Media objects: the leaves of the catalog tree.
//!
//! An [`Object`] is cheap to share (`Arc`) and carries three lazily
//! fetched resources behind its [`ResourceCache`]. The backend that knows
//! how to produce them is reached through [`ObjectBackend`].

use std::{any::Any, collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use enum_map::Enum;
use serde::{Deserialize, Serialize};

use crate::{
    cache::resource_cache::ResourceCache,
    error::CatalogResult,
};

/// Opaque node payload, interpreted only by the node's own fetch functions.
pub type BackendData = Arc<dyn Any + Send + Sync>;

pub type ObjectRef = Arc<Object>;

/// Key-value metadata as produced by a backend.
pub type MetadataMap = BTreeMap<CompactString, MetadataValue>;

/// Backend data for nodes that need none.
#[must_use]
pub fn no_backend_data() -> BackendData {
    Arc::new(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Thumbnail,
    Metadata,
    LocalFile,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thumbnail => write!(f, "thumbnail"),
            Self::Metadata => write!(f, "metadata"),
            Self::LocalFile => write!(f, "local_file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    #[default]
    Other,
}

impl MediaKind {
    /// Classify by lower-case file extension.
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "heic" | "heif" | "tif" | "tiff" | "webp" | "bmp"
            | "dng" | "cr2" | "cr3" | "nef" | "arw" | "raf" => Self::Image,
            "mp3" | "m4a" | "aac" | "wav" | "aif" | "aiff" | "flac" | "ogg" => Self::Audio,
            "mov" | "mp4" | "m4v" | "avi" | "mkv" | "webm" | "mts" => Self::Video,
            _ => Self::Other,
        }
    }
}

/// Encoded preview image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bytes: Bytes,
}

impl Thumbnail {
    #[must_use]
    pub const fn from_bytes(bytes: Bytes) -> Self {
        Self {
            width: None,
            height: None,
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Date(DateTime<Utc>),
    Text(CompactString),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.into())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<DateTime<Utc>> for MetadataValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

/// The three resource fetch contracts of one backend.
///
/// Implementations poll nothing and retry nothing on behalf of the engine;
/// a flaky backend retries inside these methods.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    async fn thumbnail(&self, identifier: &str, data: &BackendData) -> CatalogResult<Thumbnail>;

    async fn metadata(&self, identifier: &str, data: &BackendData) -> CatalogResult<MetadataMap>;

    async fn local_file(&self, identifier: &str, data: &BackendData) -> CatalogResult<PathBuf>;
}

pub struct Object {
    identifier: CompactString,
    name: CompactString,
    kind: MediaKind,
    created: Option<DateTime<Utc>>,
    data: BackendData,
    backend: Arc<dyn ObjectBackend>,
    cache: ResourceCache,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for Object {}

impl std::hash::Hash for Object {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl Object {
    #[must_use]
    pub fn builder(
        identifier: impl Into<CompactString>,
        name: impl Into<CompactString>,
        backend: Arc<dyn ObjectBackend>,
    ) -> ObjectBuilder {
        ObjectBuilder {
            identifier: identifier.into(),
            name: name.into(),
            kind: MediaKind::Other,
            created: None,
            data: no_backend_data(),
            backend,
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
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &BackendData {
        &self.data
    }

    #[inline]
    #[must_use]
    pub const fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Cached thumbnail, or the outcome of the single in-flight fetch.
    pub async fn thumbnail(&self) -> CatalogResult<Thumbnail> {
        let backend = Arc::clone(&self.backend);
        let identifier = self.identifier.clone();
        let data = Arc::clone(&self.data);

        self.cache
            .thumbnail(move || async move { backend.thumbnail(&identifier, &data).await })
            .await
    }

    pub async fn metadata(&self) -> CatalogResult<Arc<MetadataMap>> {
        let backend = Arc::clone(&self.backend);
        let identifier = self.identifier.clone();
        let data = Arc::clone(&self.data);

        self.cache
            .metadata(move || async move { backend.metadata(&identifier, &data).await.map(Arc::new) })
            .await
    }

    pub async fn local_file(&self) -> CatalogResult<PathBuf> {
        let backend = Arc::clone(&self.backend);
        let identifier = self.identifier.clone();
        let data = Arc::clone(&self.data);

        self.cache
            .local_file(move || async move { backend.local_file(&identifier, &data).await })
            .await
    }

    /// Drop thumbnail and metadata unless one of them is being fetched.
    pub fn purge(&self) -> bool {
        self.cache.purge()
    }

    #[must_use]
    pub fn is_loading(&self, kind: ResourceKind) -> bool {
        self.cache.is_loading(kind)
    }
}

pub struct ObjectBuilder {
    identifier: CompactString,
    name: CompactString,
    kind: MediaKind,
    created: Option<DateTime<Utc>>,
    data: BackendData,
    backend: Arc<dyn ObjectBackend>,
}

impl ObjectBuilder {
    #[must_use]
    pub const fn kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn created(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self
    }

    #[must_use]
    pub fn data(mut self, data: BackendData) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn build(self) -> ObjectRef {
        Arc::new(Object {
            cache: ResourceCache::new(self.identifier.clone()),
            identifier: self.identifier,
            name: self.name,
            kind: self.kind,
            created: self.created,
            data: self.data,
            backend: self.backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_by_extension() {
        assert_eq!(MediaKind::from_extension("JPG"), MediaKind::Image);
        assert_eq!(MediaKind::from_extension("flac"), MediaKind::Audio);
        assert_eq!(MediaKind::from_extension("mov"), MediaKind::Video);
        assert_eq!(MediaKind::from_extension("txt"), MediaKind::Other);
    }

    #[test]
    fn metadata_values_serialize_untagged() {
        let mut map = MetadataMap::new();
        map.insert("name".into(), MetadataValue::from("beach.jpg"));
        map.insert("size".into(), MetadataValue::from(2048_i64));

        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["name"], "beach.jpg");
        assert_eq!(json["size"], 2048);
    }
}
