//! File copy and re-import collaborators.
//!
//! Both steps shell out to external tools: `rsync` moves the located files
//! from the source host, and the server's command-line importer registers
//! each copied file at the destination. Imports run on a bounded worker
//! pool; the result map is keyed by path, so it comes out the same whatever
//! order the workers finish in.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::correlate::DestinationFiles;
use crate::error::MigrateError;
use crate::ir::DestId;

/// How the importer takes ownership of a copied file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportMode {
    /// Copy the file into the managed repository.
    #[default]
    #[serde(rename = "copy")]
    Copy,
    /// Leave the file in place and reference it with a symlink.
    #[serde(rename = "ln_s")]
    Link,
}

/// Where a source file lands under `dest_dir`.
///
/// The full source path is kept below the destination directory, as
/// `rsync --relative` does, so files from different folders never collide.
pub fn destination_path(dest_dir: &Path, source: &Path) -> PathBuf {
    let relative: PathBuf = source
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    dest_dir.join(relative)
}

/// Copies an explicit list of files into a destination directory.
pub trait FileTransfer {
    /// Returns the destination path of every file, in input order.
    fn transfer(&self, files: &[PathBuf], dest_dir: &Path) -> Result<Vec<PathBuf>, MigrateError>;
}

/// Pulls files with `rsync --relative`, from a remote host or, when `host`
/// is empty, from the local filesystem.
///
/// The file list goes to rsync on stdin (`--files-from=-`), NUL separated,
/// so neither its length nor unusual file names reach the command line.
#[derive(Clone, Debug)]
pub struct RsyncTransfer {
    pub user: String,
    pub host: String,
    /// Account that owns the copied files at the destination.
    pub dest_user: Option<String>,
    pub program: String,
}

impl RsyncTransfer {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            dest_user: None,
            program: "rsync".to_string(),
        }
    }

    pub fn with_dest_user(mut self, dest_user: Option<String>) -> Self {
        self.dest_user = dest_user;
        self
    }

    /// The root the listed absolute paths are read relative to.
    fn source_root(&self) -> String {
        match (self.host.is_empty(), self.user.is_empty()) {
            (true, _) => "/".to_string(),
            (false, true) => format!("{}:/", self.host),
            (false, false) => format!("{}@{}:/", self.user, self.host),
        }
    }

    fn command(&self, dest_dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args([
            "--archive",
            "--relative",
            "--protect-args",
            "--from0",
            "--files-from=-",
        ]);
        if let Some(owner) = &self.dest_user {
            command.arg(format!("--chown={}", owner));
        }
        command.arg(self.source_root()).arg(dest_dir);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

/// The `--files-from` payload: every path followed by a NUL byte.
fn file_list(files: &[PathBuf]) -> Vec<u8> {
    let mut list = Vec::new();
    for file in files {
        list.extend_from_slice(file.as_os_str().as_encoded_bytes());
        list.push(0);
    }
    list
}

impl FileTransfer for RsyncTransfer {
    fn transfer(&self, files: &[PathBuf], dest_dir: &Path) -> Result<Vec<PathBuf>, MigrateError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(dest_dir)?;
        info!(
            "Copying {} file(s) from {} to {}",
            files.len(),
            self.source_root(),
            dest_dir.display()
        );

        let mut child = self.command(dest_dir).spawn().map_err(|e| {
            MigrateError::Transfer(format!("failed to execute {}: {}", self.program, e))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            // Dropping stdin at the end of this block closes the list.
            stdin.write_all(&file_list(files)).map_err(|e| {
                MigrateError::Transfer(format!(
                    "cannot send file list to {}: {}",
                    self.program, e
                ))
            })?;
        }
        let output = child.wait_with_output().map_err(|e| {
            MigrateError::Transfer(format!("failed waiting for {}: {}", self.program, e))
        })?;
        if !output.status.success() {
            return Err(MigrateError::Transfer(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(files
            .iter()
            .map(|file| destination_path(dest_dir, file))
            .collect())
    }
}

/// Copies files on the local filesystem, keeping the same layout as
/// [`RsyncTransfer`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCopy;

impl FileTransfer for LocalCopy {
    fn transfer(&self, files: &[PathBuf], dest_dir: &Path) -> Result<Vec<PathBuf>, MigrateError> {
        let mut copied = Vec::with_capacity(files.len());
        for file in files {
            let target = destination_path(dest_dir, file);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(file, &target).map_err(|e| {
                MigrateError::Transfer(format!(
                    "cannot copy {} to {}: {}",
                    file.display(),
                    target.display(),
                    e
                ))
            })?;
            debug!("Copied {} -> {}", file.display(), target.display());
            copied.push(target);
        }
        Ok(copied)
    }
}

/// Registers one copied file at the destination.
///
/// Implementations are shared across import workers.
pub trait Importer: Sync {
    /// Imports `path` and returns the created image IDs in the order the
    /// tool reported them.
    fn import(&self, path: &Path, mode: ImportMode) -> Result<Vec<DestId>, MigrateError>;
}

/// Runs the server's command-line importer (`omero import`).
#[derive(Clone, Debug)]
pub struct CliImporter {
    pub program: String,
    pub extra_args: Vec<String>,
}

impl Default for CliImporter {
    fn default() -> Self {
        Self {
            program: "omero".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl CliImporter {
    fn command(&self, path: &Path, mode: ImportMode) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("import");
        if mode == ImportMode::Link {
            command.arg("--transfer=ln_s");
        }
        command.args(&self.extra_args).arg(path);
        command
    }
}

impl Importer for CliImporter {
    fn import(&self, path: &Path, mode: ImportMode) -> Result<Vec<DestId>, MigrateError> {
        let import_error = |message: String| MigrateError::Import {
            path: path.to_path_buf(),
            message,
        };

        debug!("Importing {} ({:?})", path.display(), mode);
        let output = self
            .command(path, mode)
            .output()
            .map_err(|e| import_error(format!("failed to execute {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(import_error(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_import_output(&String::from_utf8_lossy(&output.stdout)).map_err(import_error)
    }
}

/// Extracts image IDs from importer output lines such as `Image:12,13`.
///
/// Other lines (filesets, pixels, progress) are ignored.
pub fn parse_import_output(stdout: &str) -> Result<Vec<DestId>, String> {
    let mut ids = Vec::new();
    for line in stdout.lines() {
        let Some(list) = line.trim().strip_prefix("Image:") else {
            continue;
        };
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let id = raw
                .parse::<u64>()
                .map_err(|_| format!("invalid image id '{}' in importer output", raw))?;
            ids.push(DestId(id));
        }
    }
    Ok(ids)
}

/// Imports every file on a pool of `workers` threads (0 picks the number of
/// CPUs) and returns path -> created image IDs.
///
/// Returns only after every import has finished. The first failure is
/// reported; imports already running are allowed to complete.
pub fn import_files(
    files: &[PathBuf],
    importer: &dyn Importer,
    mode: ImportMode,
    workers: usize,
) -> Result<DestinationFiles, MigrateError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| MigrateError::Transfer(format!("cannot start import workers: {}", e)))?;
    info!(
        "Importing {} file(s) on {} worker(s)",
        files.len(),
        pool.current_num_threads()
    );

    let imported: Vec<(PathBuf, Vec<DestId>)> = pool.install(|| {
        files
            .par_iter()
            .map(|path| importer.import(path, mode).map(|ids| (path.clone(), ids)))
            .collect::<Result<Vec<_>, MigrateError>>()
    })?;

    let mut by_path = DestinationFiles::new();
    for (path, ids) in imported {
        if ids.is_empty() {
            warn!("Import of {} reported no images", path.display());
        }
        by_path.insert(path, ids);
    }
    Ok(by_path)
}
