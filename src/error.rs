use std::path::PathBuf;
use thiserror::Error;

use crate::correlate::CorrelationError;
use crate::ir::{EntityKind, EntityRef};
use crate::validation::ValidationReport;

/// The main error type for migration runs.
///
/// Every variant is fatal for the stage that raised it. Nothing is rolled
/// back on the destination server.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot reach {service} server: {message}")]
    Connection {
        service: &'static str,
        message: String,
    },

    #[error("{target} is not accessible on the source server: {message}")]
    NotFound { target: EntityRef, message: String },

    #[error("Failed to parse metadata document from {path}: {source}")]
    ImdParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Metadata document does not round-trip: {0}")]
    RoundTrip(String),

    #[error("Metadata document is invalid ({error_count} error(s), {warning_count} warning(s))")]
    InvalidDocument {
        error_count: usize,
        warning_count: usize,
        report: ValidationReport,
    },

    #[error("Image correlation failed: {0}")]
    CorrelationMismatch(#[from] CorrelationError),

    #[error("Destination rejected creation of {target}: {message}")]
    Creation { target: EntityRef, message: String },

    #[error("Destination rejected link {parent} -> {child}: {message}")]
    Link {
        parent: EntityRef,
        child: EntityRef,
        message: String,
    },

    #[error("Configuration error in {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("File transfer failed: {0}")]
    Transfer(String),

    #[error("Import of {path} failed: {message}")]
    Import { path: PathBuf, message: String },

    #[error("Cannot read or write {path}: {message}")]
    Artifact { path: PathBuf, message: String },

    #[error("Cannot export from a {0} root (expected Project, Dataset or Image)")]
    UnsupportedRoot(EntityKind),
}
