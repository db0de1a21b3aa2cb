//! `src/fs/object_info.rs`
//! ============================================================
//! Filesystem attributes of one directory entry.
//!
//! Built once per entry during a folder scan and again, on demand, when an
//! object's metadata is requested. Symlinks are followed so linked folders
//! browse like real ones; a dangling link is reported as a plain file.

use std::{
    ffi::OsStr,
    fs::Metadata,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use tokio::fs as tokio_fs;

use crate::{
    error::{CatalogError, CatalogResult},
    model::object::{MediaKind, MetadataMap, MetadataValue},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Arc<PathBuf>,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    pub name: CompactString,
    /// Lower-case, files only
    pub extension: Option<CompactString>,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileInfo {
    pub async fn from_path(path: &Path) -> CatalogResult<Self> {
        let context = path.to_string_lossy();
        let link_meta = tokio_fs::symlink_metadata(path)
            .await
            .map_err(|e| CatalogError::from_io(&e, &context))?;

        let is_symlink = link_meta.file_type().is_symlink();
        let meta = if is_symlink {
            tokio_fs::metadata(path).await.unwrap_or(link_meta)
        } else {
            link_meta
        };

        Ok(Self::from_meta(path, &meta, is_symlink))
    }

    fn from_meta(path: &Path, meta: &Metadata, is_symlink: bool) -> Self {
        let is_dir = meta.is_dir();

        let name = CompactString::new(path.file_name().and_then(OsStr::to_str).unwrap_or(""));

        let extension = if is_dir {
            None
        } else {
            path.extension()
                .and_then(OsStr::to_str)
                .map(|s| CompactString::new(s.to_lowercase()))
        };

        Self {
            path: Arc::new(path.to_path_buf()),
            size: if is_dir { 0 } else { meta.len() },
            modified: meta.modified().ok(),
            created: meta.created().ok(),
            name,
            extension,
            is_dir,
            is_symlink,
        }
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        self.extension
            .as_deref()
            .map_or(MediaKind::Other, MediaKind::from_extension)
    }

    #[inline]
    #[must_use]
    pub fn size_human(&self) -> String {
        ByteSize::b(self.size).to_string()
    }

    /// Creation time, falling back to modification time where the
    /// filesystem does not record one.
    #[must_use]
    pub fn created_utc(&self) -> Option<DateTime<Utc>> {
        self.created.or(self.modified).map(DateTime::<Utc>::from)
    }

    #[must_use]
    pub fn modified_utc(&self) -> Option<DateTime<Utc>> {
        self.modified.map(DateTime::<Utc>::from)
    }

    /// Attributes exposed as object metadata.
    #[must_use]
    pub fn metadata_map(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert("name".into(), MetadataValue::from(self.name.as_str()));
        map.insert("path".into(), MetadataValue::from(&*self.path.to_string_lossy()));
        map.insert(
            "size".into(),
            MetadataValue::Integer(i64::try_from(self.size).unwrap_or(i64::MAX)),
        );
        map.insert("size_human".into(), MetadataValue::from(self.size_human().as_str()));
        map.insert("kind".into(), MetadataValue::Text(media_kind_label(self.media_kind()).into()));

        if let Some(ext) = &self.extension {
            map.insert("extension".into(), MetadataValue::from(ext.as_str()));
        }
        if let Some(modified) = self.modified_utc() {
            map.insert("modified".into(), MetadataValue::from(modified));
        }
        if let Some(created) = self.created_utc() {
            map.insert("created".into(), MetadataValue::from(created));
        }
        if self.is_symlink {
            map.insert("symlink".into(), MetadataValue::Bool(true));
        }
        map
    }
}

const fn media_kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
        MediaKind::Other => "other",
    }
}
