//! End-to-end migration run.
//!
//! Stages run strictly in order, each one finishing before the next starts:
//! export, write the document, locate files, copy, import every file,
//! correlate, rehydrate. The first error ends the run. Remote side effects
//! already completed are left in place.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::MigrationConfig;
use crate::correlate::{correlate, destination_map_from_service};
use crate::error::MigrateError;
use crate::export::export_graph;
use crate::ir::io_json::{read_imd, write_imd};
use crate::locate::{locate_files, LocateOptions};
use crate::rehydrate::{RehydrateOptions, RehydrationCache, RehydrationSummary, Rehydrator};
use crate::service::{DestinationService, SourceService};
use crate::transfer::{import_files, FileTransfer, Importer};

/// What a completed run did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub exported_entities: usize,
    pub files: usize,
    pub unlocated_images: usize,
    pub correlated_images: usize,
    pub rehydration: RehydrationSummary,
}

/// Runs every stage against the given services and collaborators.
pub fn run_migration<S, D>(
    config: &MigrationConfig,
    source: &S,
    destination: &mut D,
    transfer: &dyn FileTransfer,
    importer: &dyn Importer,
) -> Result<MigrationReport, MigrateError>
where
    S: SourceService + ?Sized,
    D: DestinationService + ?Sized,
{
    info!("[1/6] Exporting {}", config.source.root);
    let exported = export_graph(source, config.source.root)?;
    write_imd(&config.general.imd_path, &exported)?;
    info!("Metadata document saved at {}", config.general.imd_path.display());

    // Everything downstream works from the persisted document.
    let document = read_imd(&config.general.imd_path)?;

    info!("[2/6] Listing source files");
    let located = locate_files(
        &document,
        source,
        &LocateOptions {
            view: config.source.path_view(),
            managed_repo_dir: config.source.managed_repo_dir.clone(),
        },
    )?;

    info!("[3/6] Copying files");
    let copied = transfer.transfer(&located.files, &config.transfer.data_directory)?;

    info!("[4/6] Importing files");
    let imported = import_files(
        &copied,
        importer,
        config.import.mode,
        config.import.workers,
    )?;
    let destination_files = if config.import.query_destination {
        destination_map_from_service(destination, &copied)?
    } else {
        imported
    };

    info!("[5/6] Correlating image IDs");
    let image_map = correlate(&located.by_path, &destination_files)?;
    if let Some(path) = &config.general.image_map_path {
        image_map.write(path)?;
    }

    info!("[6/6] Creating and linking destination entities");
    let cache = match &config.general.cache_path {
        Some(path) if path.exists() => {
            info!("Resuming from {}", path.display());
            RehydrationCache::read(path)?
        }
        _ => RehydrationCache::new(),
    };
    let options = RehydrateOptions {
        images: config.rehydrate.images,
    };
    let mut rehydrator = Rehydrator::new(destination, &image_map, options).with_cache(cache);
    let outcome = rehydrator.rehydrate(&document);
    if let Some(path) = &config.general.cache_path {
        if let Err(e) = rehydrator.cache().write(path) {
            warn!("Could not save rehydration cache: {}", e);
        }
    }
    let rehydration = outcome?;

    Ok(MigrationReport {
        exported_entities: document.entity_count(),
        files: located.files.len(),
        unlocated_images: located.unlocated.len(),
        correlated_images: image_map.len(),
        rehydration,
    })
}
