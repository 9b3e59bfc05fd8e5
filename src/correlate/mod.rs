//! Image ID correlation between the source and destination servers.
//!
//! After the backing files have been copied and re-imported, each side has a
//! map from file path to the image IDs that file produced. Copying may change
//! the directory layout, so both maps are grouped by file base name. For
//! every source base name, the ascending source IDs are paired positionally
//! with the destination IDs in the order the import reported them.
//!
//! Positional pairing assumes the importer creates a multi-series file's
//! images in the same relative order as the source server numbered them.
//! That assumption cannot be checked here; everything that *can* be checked
//! (unique base names, matching counts, nothing left unimported) fails the
//! run rather than producing a plausible but wrong map.
//!
//! This module makes no remote calls except in
//! [`destination_map_from_service`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::MigrateError;
use crate::ir::{DestId, SourceId};
use crate::service::{DestinationService, ServiceError};

/// Path -> destination image IDs, in the order the importer reported them.
pub type DestinationFiles = BTreeMap<PathBuf, Vec<DestId>>;

/// Which side of the migration a path came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

/// A grouping or cardinality violation. Always fatal.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("{side} files {first} and {second} share the base name '{base_name}'")]
    BaseNameCollision {
        side: Side,
        base_name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("{side} path {path} has no file name")]
    NoBaseName { side: Side, path: PathBuf },

    #[error("'{base_name}' backs {source_count} source image(s) but the import produced {dest_count}")]
    CountMismatch {
        base_name: String,
        source_count: usize,
        dest_count: usize,
    },

    #[error("'{base_name}' has no imported images at the destination")]
    MissingDestination { base_name: String },

    #[error("source image {source_id} pairs with both destination image {first} and {second}")]
    ConflictingPair {
        source_id: SourceId,
        first: DestId,
        second: DestId,
    },
}

/// Source image ID -> destination image ID.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageMap(BTreeMap<SourceId, DestId>);

impl ImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: SourceId) -> Option<DestId> {
        self.0.get(&source).copied()
    }

    pub fn insert(&mut self, source: SourceId, dest: DestId) -> Option<DestId> {
        self.0.insert(source, dest)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceId, DestId)> + '_ {
        self.0.iter().map(|(s, d)| (*s, *d))
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

impl FromIterator<(SourceId, DestId)> for ImageMap {
    fn from_iter<I: IntoIterator<Item = (SourceId, DestId)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Pairs source images with the destination images imported from the same
/// file.
///
/// # Errors
/// - [`CorrelationError::BaseNameCollision`] if two different paths on the
///   same side share a base name.
/// - [`CorrelationError::MissingDestination`] if a source file was never
///   imported.
/// - [`CorrelationError::CountMismatch`] if a file produced a different
///   number of images on each side.
/// - [`CorrelationError::ConflictingPair`] if an image backed by several
///   files would map to two different destination images.
pub fn correlate(
    source: &BTreeMap<PathBuf, Vec<SourceId>>,
    destination: &DestinationFiles,
) -> Result<ImageMap, CorrelationError> {
    let source_groups = group_by_base_name(source, Side::Source)?;
    let dest_groups = group_by_base_name(destination, Side::Destination)?;

    let mut pairs: BTreeMap<SourceId, DestId> = BTreeMap::new();
    for (base_name, source_ids) in &source_groups {
        let dest_ids = dest_groups
            .get(base_name)
            .ok_or_else(|| CorrelationError::MissingDestination {
                base_name: base_name.clone(),
            })?;

        if source_ids.len() != dest_ids.len() {
            return Err(CorrelationError::CountMismatch {
                base_name: base_name.clone(),
                source_count: source_ids.len(),
                dest_count: dest_ids.len(),
            });
        }

        let mut ascending = source_ids.to_vec();
        ascending.sort();
        for (source_id, dest_id) in ascending.into_iter().zip(dest_ids.iter().copied()) {
            if let Some(first) = pairs.insert(source_id, dest_id) {
                if first != dest_id {
                    return Err(CorrelationError::ConflictingPair {
                        source_id,
                        first,
                        second: dest_id,
                    });
                }
            }
            debug!("{}: source image {} -> {}", base_name, source_id, dest_id);
        }
    }

    for base_name in dest_groups.keys() {
        if !source_groups.contains_key(base_name) {
            debug!("Ignoring destination file '{}' with no source counterpart", base_name);
        }
    }

    info!(
        "Correlated {} image(s) across {} file(s)",
        pairs.len(),
        source_groups.len()
    );
    Ok(ImageMap(pairs))
}

/// Re-keys a path map by final path component.
fn group_by_base_name<'a, T>(
    by_path: &'a BTreeMap<PathBuf, Vec<T>>,
    side: Side,
) -> Result<BTreeMap<String, &'a [T]>, CorrelationError> {
    let mut owners: BTreeMap<String, &'a Path> = BTreeMap::new();
    let mut groups: BTreeMap<String, &'a [T]> = BTreeMap::new();

    for (path, ids) in by_path {
        let base_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| CorrelationError::NoBaseName {
                side,
                path: path.clone(),
            })?;

        if let Some(first) = owners.get(&base_name) {
            return Err(CorrelationError::BaseNameCollision {
                side,
                base_name,
                first: first.to_path_buf(),
                second: path.clone(),
            });
        }
        owners.insert(base_name.clone(), path.as_path());
        groups.insert(base_name, ids.as_slice());
    }

    Ok(groups)
}

/// Builds the destination map by asking the destination server which images
/// were imported from each client path, instead of trusting importer output.
///
/// Must only be called once every import has finished.
pub fn destination_map_from_service<D>(
    destination: &D,
    paths: &[PathBuf],
) -> Result<DestinationFiles, MigrateError>
where
    D: DestinationService + ?Sized,
{
    let mut map = DestinationFiles::new();
    for path in paths {
        let ids = destination
            .image_ids_by_client_path(&path.to_string_lossy())
            .map_err(|e| match e {
                ServiceError::Connection(message) => MigrateError::Connection {
                    service: "destination",
                    message,
                },
                other => MigrateError::Import {
                    path: path.clone(),
                    message: other.to_string(),
                },
            })?;
        map.insert(path.clone(), ids);
    }
    Ok(map)
}
