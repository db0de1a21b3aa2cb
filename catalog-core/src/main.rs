//! src/main.rs
//! Command-line front end: loads the local folder catalog and prints the tree

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tracing::{info, warn};

use catalog_core::{
    Config, Library, LibraryOptions,
    backends::FolderSource,
    cache::global_stats,
    logging::init_logging_with_config,
    model::{ContainerRef, JsonFileStateStore, ResourceKind, Section},
};

const INDENT: &str = "  ";

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = Config::load().await.context("Failed to load configuration")?;

    let _guard = init_logging_with_config(config.logging.clone())
        .await
        .context("Failed to initialize logging")?;

    let store = Arc::new(JsonFileStateStore::new(config.state_path()?));
    let library = Library::new(store, LibraryOptions::from(&config));

    let folders = FolderSource::new(&config.folders);
    for arg in std::env::args_os().skip(1) {
        let path = PathBuf::from(arg);
        if !folders.add_folder(path.clone()) {
            warn!(path = %path.display(), "Folder listed twice, ignoring");
        }
    }

    let section = Section::new("folders", "Folders");
    library.add_section(Arc::clone(&section));
    library.add_source(&section, folders.into_source("Local"));

    if let Err(e) = library.restore().await {
        warn!(error = %e, "Could not restore library state, starting fresh");
    }

    library.load();
    library.wait_idle().await;

    // Top-level folders are listed even when collapsed.
    for source in section.sources() {
        for container in source.containers() {
            if !container.is_loaded() && !container.is_loading() {
                library.pipeline().load(&container);
            }
        }
    }
    library.wait_idle().await;

    print_tree(&library);

    let stats = global_stats().snapshot();
    info!(
        thumbnail_hit_rate = stats.hit_rate(ResourceKind::Thumbnail),
        metadata_hit_rate = stats.hit_rate(ResourceKind::Metadata),
        purges = stats.purges,
        "Catalog session finished"
    );

    library.shutdown().await.context("Failed to save library state")?;
    Ok(())
}

fn print_tree(library: &Library) {
    for section in library.sections() {
        println!("{}", section.name());
        for source in section.sources() {
            let marker = if source.is_expanded() { "-" } else { "+" };
            println!("{INDENT}{marker} {}", source.name());
            for container in source.containers() {
                print_container(&container, 2);
            }
        }
    }
}

fn print_container(container: &ContainerRef, depth: usize) {
    let marker = if container.is_expanded() { "-" } else { "+" };
    let objects = container.objects().len();
    println!(
        "{}{marker} {} ({objects} objects)",
        INDENT.repeat(depth),
        container.name()
    );
    for child in container.children() {
        print_container(&child, depth + 1);
    }
}
