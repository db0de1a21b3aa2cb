//! Change reports for loaded folder containers.
//!
//! Each watched folder gets its own debounced, non-recursive
//! [`PollWatcher`]. A burst of changes inside the folder yields one call of
//! the container's change callback. The watch lives exactly as long as the
//! returned handle.

use std::path::{Path, PathBuf};

use notify_debouncer_mini::{
    Config as DebouncerConfig, DebounceEventResult, Debouncer, new_debouncer_opt,
    notify::{self, PollWatcher, RecursiveMode},
};
use tracing::{debug, warn};

use crate::{
    config::FolderWatchConfig,
    error::{CatalogError, CatalogResult},
    model::container::{ChangeCallback, WatchHandle},
};

/// Keeps one folder watched; dropping it stops the poll thread.
pub struct FolderWatch {
    path: PathBuf,
    _debouncer: Debouncer<PollWatcher>,
}

impl FolderWatch {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FolderWatch {
    fn drop(&mut self) {
        debug!(
            marker = "FOLDER_WATCH",
            operation_type = "watch_stopped",
            path = %self.path.display(),
            "Stopped watching folder"
        );
    }
}

/// Start watching `path`; `on_change` runs on the watcher's thread.
pub fn watch_folder(
    path: &Path,
    config: &FolderWatchConfig,
    on_change: ChangeCallback,
) -> CatalogResult<FolderWatch> {
    let meta = std::fs::metadata(path)
        .map_err(|e| CatalogError::from_io(&e, &path.to_string_lossy()))?;
    if !meta.is_dir() {
        return Err(CatalogError::not_found(&path.to_string_lossy()));
    }

    let notify_config = notify::Config::default().with_poll_interval(config.poll_interval);
    let debouncer_config = DebouncerConfig::default()
        .with_timeout(config.debounce)
        .with_notify_config(notify_config);

    let folder = path.to_path_buf();
    let mut debouncer = new_debouncer_opt::<_, PollWatcher>(
        debouncer_config,
        move |res: DebounceEventResult| match res {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                debug!(
                    marker = "FOLDER_WATCH",
                    operation_type = "folder_changed",
                    path = %folder.display(),
                    events = events.len(),
                    "Folder contents changed"
                );
                on_change();
            }
            Err(error) => warn!(
                marker = "FOLDER_WATCH",
                operation_type = "watch_error",
                path = %folder.display(),
                error = %error,
                "Folder watcher error"
            ),
        },
    )
    .map_err(|e| watch_failed(path, &e))?;

    debouncer
        .watcher()
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| watch_failed(path, &e))?;

    debug!(
        marker = "FOLDER_WATCH",
        operation_type = "watch_started",
        path = %path.display(),
        poll_ms = config.poll_interval.as_millis(),
        "Watching folder"
    );

    Ok(FolderWatch {
        path: path.to_path_buf(),
        _debouncer: debouncer,
    })
}

/// [`watch_folder`] boxed for storage on a container.
pub fn watch_handle(
    path: &Path,
    config: &FolderWatchConfig,
    on_change: ChangeCallback,
) -> CatalogResult<WatchHandle> {
    Ok(Box::new(watch_folder(path, config, on_change)?))
}

fn watch_failed(path: &Path, err: &notify::Error) -> CatalogError {
    CatalogError::failed(format!("cannot watch {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::{Duration, Instant},
    };

    fn fast() -> FolderWatchConfig {
        FolderWatchConfig {
            enabled: true,
            poll_interval: Duration::from_millis(50),
            debounce: Duration::from_millis(50),
        }
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        what()
    }

    #[test]
    fn new_file_reports_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let changes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&changes);

        let watch = watch_folder(
            dir.path(),
            &fast(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert_eq!(watch.path(), dir.path());

        std::fs::write(dir.path().join("beach.jpg"), b"jpeg").unwrap();
        assert!(wait_for(|| changes.load(Ordering::SeqCst) > 0));
    }

    #[test]
    fn dropped_watch_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let changes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&changes);

        let watch = watch_folder(
            dir.path(),
            &fast(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        drop(watch);

        std::fs::write(dir.path().join("beach.jpg"), b"jpeg").unwrap();
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_folder_cannot_be_watched() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone");
        let result = watch_folder(&gone, &fast(), Arc::new(|| {}));
        assert!(matches!(result, Err(CatalogError::NotFound(_))));
    }
}
