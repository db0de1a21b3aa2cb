//! ``src/fs/dir_scanner.rs``
//!
//! # Directory Scanner: Cancellable Folder Listing
//!
//! Lists one directory for the folder backend. The cancellation token is
//! checked before every entry, so superseding a folder load stops the scan
//! at the next entry instead of after the whole directory.

use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
    time::Instant,
};

use tokio::fs::{self, ReadDir};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{CatalogError, CatalogResult},
    fs::object_info::FileInfo,
};

/// Entries between cooperative yields.
const YIELD_EVERY: usize = 64;

/// Scan `path` and return its entries, directories first, then by name.
///
/// Fails with `NotFound` / `AccessDenied` when the folder itself cannot be
/// read and with `Cancelled` when `token` fires. Entries that vanish or
/// cannot be inspected mid-scan are skipped.
pub async fn scan_folder(
    path: &Path,
    show_hidden: bool,
    token: &CancellationToken,
) -> CatalogResult<Vec<FileInfo>> {
    let start_time = Instant::now();
    let context = path.to_string_lossy();

    let mut read_dir: ReadDir = fs::read_dir(path)
        .await
        .map_err(|e| CatalogError::from_io(&e, &context))?;

    let mut entries: Vec<FileInfo> = Vec::new();
    let mut seen = 0usize;

    loop {
        if token.is_cancelled() {
            return Err(CatalogError::cancelled(&context));
        }

        let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CatalogError::from_io(&e, &context))?
        else {
            break;
        };

        seen += 1;
        if seen % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }

        let entry_path: PathBuf = entry.path();
        if !show_hidden && is_hidden(&entry_path) {
            continue;
        }

        match FileInfo::from_path(&entry_path).await {
            Ok(info) => entries.push(info),
            Err(e) => {
                debug!(
                    marker = "DIRECTORY_SCAN",
                    operation_type = "entry_skipped",
                    path = %entry_path.display(),
                    error = %e,
                    "Entry could not be inspected"
                );
            }
        }
    }

    sort_entries(&mut entries);

    info!(
        marker = "DIRECTORY_SCAN",
        operation_type = "scan_folder",
        path = %path.display(),
        entries = entries.len(),
        duration_ms = start_time.elapsed().as_millis(),
        "Folder scanned"
    );

    Ok(entries)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn sort_entries(entries: &mut [FileInfo]) {
    entries.sort_by(|a, b| -> Ordering {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entries: &[FileInfo]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn lists_folders_first_and_skips_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"b").unwrap();
        std::fs::write(dir.path().join("A.png"), b"a").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"").unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();

        let entries = scan_folder(dir.path(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&entries), ["zeta", "A.png", "b.jpg"]);

        let all = scan_folder(dir.path(), true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn missing_folder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_folder(&dir.path().join("gone"), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_scan_stops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = scan_folder(dir.path(), false, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
