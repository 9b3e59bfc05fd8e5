//! Interfaces to the source and destination image-data servers.
//!
//! The migration stages never hold an ambient connection. Each stage takes
//! the service handle it needs as an explicit parameter and drops it when it
//! returns. [`SnapshotServer`] implements both sides in memory and can be
//! loaded from (and saved to) a JSON file. [`SharedSnapshot`] lets the
//! import workers and rehydration share one destination snapshot.

mod shared;
mod snapshot;

pub use shared::{SharedSnapshot, SnapshotImporter};
pub use snapshot::{
    AnnotationLink, SnapshotAnnotation, SnapshotContainer, SnapshotImage, SnapshotRoi,
    SnapshotServer,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::{
    Annotation, Dataset, DestId, DestRef, EntityRef, Image, Pixels, Project, Roi, SourceId,
};

/// Errors reported by a remote server call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Which recorded path to report for an image's backing files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathView {
    /// The path on the machine that originally uploaded the file.
    Client,
    /// The path inside the server's managed repository.
    #[default]
    Server,
}

/// Name and description of a project or dataset as the server reports it.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteContainer {
    pub id: SourceId,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteImage {
    pub id: SourceId,
    pub name: String,
    pub description: Option<String>,
    pub pixels: Pixels,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteRoi {
    pub id: SourceId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub shapes: Vec<RemoteShape>,
}

/// A shape exactly as stored server-side: every shared field is optional,
/// and the channel may carry the negative "all channels" sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteShape {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub the_c: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub the_z: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub the_t: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    pub kind: RemoteShapeKind,
}

impl RemoteShape {
    pub fn new(id: u64, kind: RemoteShapeKind) -> Self {
        Self {
            id,
            text: None,
            the_c: None,
            the_z: None,
            the_t: None,
            fill_color: None,
            stroke_color: None,
            locked: None,
            kind,
        }
    }
}

/// Every shape kind the server can store, including ones the document does
/// not carry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteShapeKind {
    Point { x: f64, y: f64 },
    Line { x1: f64, y1: f64, x2: f64, y2: f64 },
    Rectangle { x: f64, y: f64, width: f64, height: f64 },
    Ellipse { x: f64, y: f64, radius_x: f64, radius_y: f64 },
    Polygon { points: String },
    Polyline { points: String },
    Label { x: f64, y: f64 },
    Mask { x: f64, y: f64, width: f64, height: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteAnnotation {
    pub id: SourceId,
    pub kind: RemoteAnnotationKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteAnnotationKind {
    Tag { text: String },
    /// Key-value pairs are fetched separately with
    /// [`SourceService::map_values`].
    Map {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    /// Comments, file attachments, ratings and anything else the document
    /// does not migrate.
    Other { type_name: String },
}

/// Read-only operations consumed from the source server.
pub trait SourceService {
    /// Fetches a project or dataset.
    fn container(&self, target: EntityRef) -> Result<RemoteContainer, ServiceError>;

    fn image(&self, id: SourceId) -> Result<RemoteImage, ServiceError>;

    /// Lists the children of a project (datasets) or dataset (images).
    fn children(&self, parent: EntityRef) -> Result<Vec<SourceId>, ServiceError>;

    /// Lists the ROIs of an image, shapes included.
    fn rois(&self, image: SourceId) -> Result<Vec<RemoteRoi>, ServiceError>;

    /// Lists annotations linked to any entity.
    fn annotations(&self, target: EntityRef) -> Result<Vec<RemoteAnnotation>, ServiceError>;

    /// Resolves the ordered key-value pairs of a map annotation.
    fn map_values(&self, annotation: SourceId) -> Result<Vec<(String, String)>, ServiceError>;

    /// Paths of the original files backing an image.
    fn original_file_paths(
        &self,
        image: SourceId,
        view: PathView,
    ) -> Result<Vec<String>, ServiceError>;
}

/// Create, link and query operations consumed from the destination server.
pub trait DestinationService {
    fn create_project(&mut self, project: &Project) -> Result<DestId, ServiceError>;

    fn create_dataset(&mut self, dataset: &Dataset) -> Result<DestId, ServiceError>;

    /// Registers a metadata-only image with no backing files.
    fn create_image(&mut self, image: &Image) -> Result<DestId, ServiceError>;

    fn create_annotation(&mut self, annotation: &Annotation) -> Result<DestId, ServiceError>;

    /// Creates a ROI, with all of its shapes, on an existing image.
    fn create_roi(&mut self, roi: &Roi, image: DestId) -> Result<DestId, ServiceError>;

    /// Links a child container to its parent (project-dataset or
    /// dataset-image).
    fn link(&mut self, parent: DestRef, child: DestRef) -> Result<(), ServiceError>;

    /// Attaches an annotation to an entity.
    fn annotate(&mut self, target: DestRef, annotation: DestId) -> Result<(), ServiceError>;

    /// Images whose backing file was uploaded from `client_path`.
    fn image_ids_by_client_path(&self, client_path: &str) -> Result<Vec<DestId>, ServiceError>;
}
