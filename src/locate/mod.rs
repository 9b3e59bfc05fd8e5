//! File location: which backing files does each exported image need?
//!
//! For every image in the document the source server is asked for its
//! original file paths. Paths are made absolute under the managed
//! repository root and gathered into a map from file to the source images it
//! backs. One file can back several images (multi-series formats), and one
//! image can span several files.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MigrateError;
use crate::ir::{Document, EntityRef, SourceId};
use crate::service::{PathView, ServiceError, SourceService};

/// Options for [`locate_files`].
#[derive(Clone, Debug)]
pub struct LocateOptions {
    /// Report paths as the uploading client saw them, or as stored
    /// server-side.
    pub view: PathView,
    /// Root of the source server's managed repository.
    pub managed_repo_dir: PathBuf,
}

/// The source side of the correlation: files to copy and the images they
/// back.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFiles {
    /// Absolute path -> ascending source image IDs backed by that file.
    pub by_path: BTreeMap<PathBuf, Vec<SourceId>>,

    /// Distinct paths to copy, sorted.
    pub files: Vec<PathBuf>,

    /// Images with no backing files. They cannot be migrated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unlocated: Vec<SourceId>,
}

impl SourceFiles {
    /// Builds the map from `(path, image)` pairs, in any order.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (PathBuf, SourceId)>) -> Self {
        let mut by_path: BTreeMap<PathBuf, Vec<SourceId>> = BTreeMap::new();
        for (path, id) in pairs {
            by_path.entry(path).or_default().push(id);
        }
        for ids in by_path.values_mut() {
            ids.sort();
            ids.dedup();
        }
        let files = by_path.keys().cloned().collect();
        Self {
            by_path,
            files,
            unlocated: Vec::new(),
        }
    }

    /// Every image that has at least one backing file.
    pub fn located_images(&self) -> BTreeSet<SourceId> {
        self.by_path.values().flatten().copied().collect()
    }

    pub fn read(path: &Path) -> Result<Self, MigrateError> {
        let file = File::open(path).map_err(MigrateError::Io)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| MigrateError::Artifact {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), MigrateError> {
        let file = File::create(path).map_err(MigrateError::Io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| {
            MigrateError::Artifact {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })
    }
}

/// Looks up the backing files of every image in `document`.
///
/// An image with no backing files is logged and listed in
/// [`SourceFiles::unlocated`]; it does not fail the run.
pub fn locate_files<S>(
    document: &Document,
    source: &S,
    opts: &LocateOptions,
) -> Result<SourceFiles, MigrateError>
where
    S: SourceService + ?Sized,
{
    info!(
        "Locating backing files for {} image(s) ({:?} paths)",
        document.images.len(),
        opts.view
    );

    let mut pairs = Vec::new();
    let mut unlocated = Vec::new();
    for image in &document.images {
        let paths = source
            .original_file_paths(image.id, opts.view)
            .map_err(|e| lookup_error(image.id, e))?;

        if paths.is_empty() {
            warn!(
                "Image {} ({}) has no backing files and will not be migrated",
                image.id, image.name
            );
            unlocated.push(image.id);
            continue;
        }

        for path in paths {
            let absolute = opts.managed_repo_dir.join(&path);
            debug!("Image {} is backed by {}", image.id, absolute.display());
            pairs.push((absolute, image.id));
        }
    }

    let mut located = SourceFiles::from_pairs(pairs);
    located.unlocated = unlocated;
    info!(
        "Found {} distinct file(s); {} image(s) without files",
        located.files.len(),
        located.unlocated.len()
    );
    Ok(located)
}

fn lookup_error(image: SourceId, err: ServiceError) -> MigrateError {
    match err {
        ServiceError::Connection(message) => MigrateError::Connection {
            service: "source",
            message,
        },
        ServiceError::NotFound(message)
        | ServiceError::PermissionDenied(message)
        | ServiceError::Rejected(message) => MigrateError::NotFound {
            target: EntityRef::image(image),
            message,
        },
    }
}
