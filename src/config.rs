//! YAML run configuration.
//!
//! ```yaml
//! source:
//!   root: "Project:1"
//!   use_client_filepaths: false
//!   managed_repo_dir: /OMERO/ManagedRepository
//! transfer:
//!   user: omero
//!   host: source.example.org
//!   data_directory: /data/incoming
//! import:
//!   mode: ln_s
//!   workers: 4
//! general:
//!   imd_path: imd.json
//! rehydrate:
//!   images: correlated
//! ```
//!
//! Relative paths are resolved against the directory holding the file.
//! Credentials are never read from here.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::MigrateError;
use crate::ir::{EntityKind, EntityRef};
use crate::rehydrate::ImageResolution;
use crate::service::PathView;
use crate::transfer::ImportMode;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    pub source: SourceConfig,
    pub transfer: TransferConfig,
    #[serde(default)]
    pub import: ImportConfig,
    pub general: GeneralConfig,
    #[serde(default)]
    pub rehydrate: RehydrateConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Root of the exported subgraph, as `"<Kind>:<id>"`.
    pub root: EntityRef,
    #[serde(default)]
    pub use_client_filepaths: bool,
    #[serde(default)]
    pub managed_repo_dir: PathBuf,
    /// Server snapshot standing in for a live source server.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

impl SourceConfig {
    pub fn path_view(&self) -> PathView {
        if self.use_client_filepaths {
            PathView::Client
        } else {
            PathView::Server
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Account on the source host that can read the managed repository.
    #[serde(default)]
    pub user: String,
    /// Source host. Empty means the files are on this machine.
    #[serde(default)]
    pub host: String,
    /// Account that owns the copied files at the destination.
    #[serde(default)]
    pub dest_user: Option<String>,
    pub data_directory: PathBuf,
}

impl TransferConfig {
    pub fn is_local(&self) -> bool {
        self.host.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ImportConfig {
    pub mode: ImportMode,
    /// Concurrent imports; 0 uses one per CPU.
    pub workers: usize,
    pub program: String,
    pub extra_args: Vec<String>,
    /// Build the destination file map by querying the destination server
    /// instead of trusting importer output.
    pub query_destination: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            mode: ImportMode::Copy,
            workers: 1,
            program: "omero".to_string(),
            extra_args: Vec::new(),
            query_destination: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    pub imd_path: PathBuf,
    #[serde(default)]
    pub image_map_path: Option<PathBuf>,
    /// Where the rehydration cache is kept between runs.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Server snapshot standing in for a live destination server.
    #[serde(default)]
    pub destination_snapshot: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RehydrateConfig {
    pub images: ImageResolution,
}

impl MigrationConfig {
    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let data = fs::read_to_string(path).map_err(|e| MigrateError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut config = Self::from_yaml_str(&data).map_err(|message| MigrateError::Config {
            path: path.to_path_buf(),
            message,
        })?;
        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        Ok(config)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self, String> {
        let config: Self = serde_yaml::from_str(data).map_err(|e| e.to_string())?;
        match config.source.root.kind {
            EntityKind::Project | EntityKind::Dataset | EntityKind::Image => {}
            other => {
                return Err(format!(
                    "source.root must be a Project, Dataset or Image, not {}",
                    other
                ))
            }
        }
        if config.transfer.data_directory.as_os_str().is_empty() {
            return Err("transfer.data_directory must not be empty".to_string());
        }
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.general.imd_path);
        resolve(&mut self.transfer.data_directory);
        // Empty means the recorded paths are used as they are.
        if !self.source.managed_repo_dir.as_os_str().is_empty() {
            resolve(&mut self.source.managed_repo_dir);
        }
        for path in [
            self.general.image_map_path.as_mut(),
            self.general.cache_path.as_mut(),
            self.general.destination_snapshot.as_mut(),
            self.source.snapshot.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
    }
}
