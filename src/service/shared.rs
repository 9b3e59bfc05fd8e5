//! A destination snapshot shared by the import workers and rehydration.
//!
//! With a snapshot standing in for the destination server, imported files
//! have to appear in the same graph that rehydration later queries and
//! writes to. [`SharedSnapshot`] is that graph behind a lock, and
//! [`SnapshotImporter`] registers imports in it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{DestinationService, ServiceError, SnapshotServer};
use crate::error::MigrateError;
use crate::ir::{Annotation, Dataset, DestId, DestRef, Image, Project, Roi};
use crate::transfer::{ImportMode, Importer};

/// Cloneable handle to one [`SnapshotServer`].
#[derive(Clone, Debug, Default)]
pub struct SharedSnapshot(Arc<Mutex<SnapshotServer>>);

impl SharedSnapshot {
    pub fn new(server: SnapshotServer) -> Self {
        Self(Arc::new(Mutex::new(server)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, SnapshotServer>, ServiceError> {
        self.0
            .lock()
            .map_err(|_| ServiceError::Connection("snapshot lock poisoned".to_string()))
    }

    /// Copy of the current graph.
    pub fn snapshot(&self) -> Result<SnapshotServer, ServiceError> {
        Ok(self.lock()?.clone())
    }

    pub fn save(&self, path: &Path) -> Result<(), MigrateError> {
        let server = self.lock().map_err(|e| MigrateError::Artifact {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        server.save(path)
    }
}

impl DestinationService for SharedSnapshot {
    fn create_project(&mut self, project: &Project) -> Result<DestId, ServiceError> {
        self.lock()?.create_project(project)
    }

    fn create_dataset(&mut self, dataset: &Dataset) -> Result<DestId, ServiceError> {
        self.lock()?.create_dataset(dataset)
    }

    fn create_image(&mut self, image: &Image) -> Result<DestId, ServiceError> {
        self.lock()?.create_image(image)
    }

    fn create_annotation(&mut self, annotation: &Annotation) -> Result<DestId, ServiceError> {
        self.lock()?.create_annotation(annotation)
    }

    fn create_roi(&mut self, roi: &Roi, image: DestId) -> Result<DestId, ServiceError> {
        self.lock()?.create_roi(roi, image)
    }

    fn link(&mut self, parent: DestRef, child: DestRef) -> Result<(), ServiceError> {
        self.lock()?.link(parent, child)
    }

    fn annotate(&mut self, target: DestRef, annotation: DestId) -> Result<(), ServiceError> {
        self.lock()?.annotate(target, annotation)
    }

    fn image_ids_by_client_path(&self, client_path: &str) -> Result<Vec<DestId>, ServiceError> {
        self.lock()?.image_ids_by_client_path(client_path)
    }
}

/// Registers each imported file in a [`SharedSnapshot`].
///
/// A file yields one image per source image recorded against its base
/// name, or a single image when the source knows no such file.
#[derive(Clone, Debug)]
pub struct SnapshotImporter {
    destination: SharedSnapshot,
    series: BTreeMap<String, usize>,
}

impl SnapshotImporter {
    pub fn new(destination: SharedSnapshot, source: &SnapshotServer) -> Self {
        let mut images: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for image in &source.images {
            for path in image.server_paths.iter().chain(&image.client_paths) {
                let base = path.rsplit('/').next().unwrap_or(path);
                images.entry(base.to_string()).or_default().insert(image.id);
            }
        }
        Self {
            destination,
            series: images
                .into_iter()
                .map(|(base, ids)| (base, ids.len()))
                .collect(),
        }
    }

    /// Images an import of a file named `base` produces.
    pub fn series_for(&self, base: &str) -> usize {
        self.series.get(base).copied().unwrap_or(1)
    }
}

impl Importer for SnapshotImporter {
    fn import(&self, path: &Path, mode: ImportMode) -> Result<Vec<DestId>, MigrateError> {
        let import_error = |message: String| MigrateError::Import {
            path: path.to_path_buf(),
            message,
        };
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| import_error("path has no file name".to_string()))?;

        let mut server = self
            .destination
            .lock()
            .map_err(|e| import_error(e.to_string()))?;
        let ids = server.register_import(&path.to_string_lossy(), self.series_for(&base));
        debug!(
            "Registered {} image(s) for {} ({:?})",
            ids.len(),
            path.display(),
            mode
        );
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Pixels;
    use crate::service::SnapshotImage;

    fn source_image(id: u64, server_path: &str) -> SnapshotImage {
        SnapshotImage {
            id,
            name: format!("image {}", id),
            description: None,
            pixels: Pixels::new("XYZCT", (1, 1, 1, 1, 1), "uint8"),
            client_paths: Vec::new(),
            server_paths: vec![server_path.to_string()],
        }
    }

    #[test]
    fn test_series_counts_source_images_per_file() {
        let mut source = SnapshotServer::new();
        source.images.push(source_image(1, "u_1/plate.lif"));
        source.images.push(source_image(2, "u_1/plate.lif"));
        source.images.push(source_image(3, "u_1/single.tif"));

        let importer = SnapshotImporter::new(SharedSnapshot::default(), &source);
        assert_eq!(importer.series_for("plate.lif"), 2);
        assert_eq!(importer.series_for("single.tif"), 1);
        assert_eq!(importer.series_for("unknown.czi"), 1);
    }

    #[test]
    fn test_imports_are_visible_to_the_destination() {
        let mut source = SnapshotServer::new();
        source.images.push(source_image(1, "u_1/plate.lif"));
        source.images.push(source_image(2, "u_1/plate.lif"));

        let destination = SharedSnapshot::default();
        let importer = SnapshotImporter::new(destination.clone(), &source);
        let ids = importer
            .import(Path::new("/data/in/u_1/plate.lif"), ImportMode::Copy)
            .unwrap();
        assert_eq!(ids.len(), 2);

        let found = destination
            .image_ids_by_client_path("/data/in/u_1/plate.lif")
            .unwrap();
        assert_eq!(found, ids);
        assert_eq!(destination.snapshot().unwrap().images.len(), 2);
    }

    #[test]
    fn test_shared_handles_write_one_graph() {
        let destination = SharedSnapshot::default();
        let mut writer = destination.clone();
        writer.create_project(&Project::new(1u64, "P")).unwrap();
        assert_eq!(destination.snapshot().unwrap().projects.len(), 1);
    }
}
