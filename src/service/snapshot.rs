//! In-memory server backed by a JSON snapshot.
//!
//! A snapshot holds the same graph a live server would expose: containers
//! with ordered children, images with their recorded file paths, ROIs with
//! raw shapes, annotations and annotation links. It serves as the source
//! for offline exports, as the destination for dry-run rehydrations, and as
//! the fixture for tests.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    DestinationService, PathView, RemoteAnnotation, RemoteAnnotationKind, RemoteContainer,
    RemoteImage, RemoteRoi, RemoteShape, RemoteShapeKind, ServiceError, SourceService,
};
use crate::error::MigrateError;
use crate::ir::{
    Annotation, Dataset, DestId, DestRef, EntityKind, EntityRef, Geometry, Image, Pixels, Project,
    Roi, Shape, SourceId,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotServer {
    #[serde(default)]
    pub projects: Vec<SnapshotContainer>,

    #[serde(default)]
    pub datasets: Vec<SnapshotContainer>,

    #[serde(default)]
    pub images: Vec<SnapshotImage>,

    #[serde(default)]
    pub rois: Vec<SnapshotRoi>,

    #[serde(default)]
    pub annotations: Vec<SnapshotAnnotation>,

    #[serde(default)]
    pub annotation_links: Vec<AnnotationLink>,

    /// Entities that exist but the connected user may not read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restricted: Vec<EntityRef>,
}

/// A project (children are dataset IDs) or dataset (children are image IDs).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContainer {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub children: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub pixels: Pixels,
    #[serde(default)]
    pub client_paths: Vec<String>,
    #[serde(default)]
    pub server_paths: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRoi {
    pub id: u64,
    pub image: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub shapes: Vec<RemoteShape>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotAnnotation {
    pub id: u64,
    pub kind: RemoteAnnotationKind,
    /// Key-value pairs, for map annotations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<(String, String)>,
}

/// Attachment of an annotation to an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationLink {
    pub kind: EntityKind,
    pub id: u64,
    pub annotation: u64,
}

impl SnapshotServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let file = File::open(path).map_err(|e| MigrateError::Connection {
            service: "snapshot",
            message: format!("{}: {}", path.display(), e),
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| MigrateError::Artifact {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Writes the snapshot to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), MigrateError> {
        let file = File::create(path).map_err(MigrateError::Io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| {
            MigrateError::Artifact {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })
    }

    /// Number of entities of `kind` on this server.
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Project => self.projects.len(),
            EntityKind::Dataset => self.datasets.len(),
            EntityKind::Image => self.images.len(),
            EntityKind::Roi => self.rois.len(),
            EntityKind::Shape => self.rois.iter().map(|r| r.shapes.len()).sum(),
            EntityKind::Annotation => self.annotations.len(),
        }
    }

    /// Annotation IDs attached to an entity, in link order.
    pub fn annotations_of(&self, kind: EntityKind, id: u64) -> Vec<u64> {
        self.annotation_links
            .iter()
            .filter(|link| link.kind == kind && link.id == id)
            .map(|link| link.annotation)
            .collect()
    }

    /// Registers the images an import of `client_path` would produce, one
    /// per series, and returns their IDs in creation order.
    pub fn register_import(&mut self, client_path: &str, series: usize) -> Vec<DestId> {
        let base = client_path.rsplit('/').next().unwrap_or(client_path).to_string();
        (0..series)
            .map(|n| {
                let id = self.next_id();
                let name = if series > 1 {
                    format!("{} [{}]", base, n)
                } else {
                    base.clone()
                };
                self.images.push(SnapshotImage {
                    id,
                    name,
                    description: None,
                    pixels: Pixels::new("XYZCT", (1, 1, 1, 1, 1), "uint8"),
                    client_paths: vec![client_path.to_string()],
                    server_paths: Vec::new(),
                });
                DestId(id)
            })
            .collect()
    }

    fn next_id(&self) -> u64 {
        let shape_ids = self.rois.iter().flat_map(|r| r.shapes.iter().map(|s| s.id));
        self.projects
            .iter()
            .chain(self.datasets.iter())
            .map(|c| c.id)
            .chain(self.images.iter().map(|i| i.id))
            .chain(self.rois.iter().map(|r| r.id))
            .chain(self.annotations.iter().map(|a| a.id))
            .chain(shape_ids)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn check_access(&self, target: EntityRef) -> Result<(), ServiceError> {
        if self.restricted.contains(&target) {
            return Err(ServiceError::PermissionDenied(target.to_string()));
        }
        Ok(())
    }

    fn find_container(&self, target: EntityRef) -> Result<&SnapshotContainer, ServiceError> {
        self.check_access(target)?;
        let pool = match target.kind {
            EntityKind::Project => &self.projects,
            EntityKind::Dataset => &self.datasets,
            other => {
                return Err(ServiceError::Rejected(format!(
                    "{} is not a container kind",
                    other
                )))
            }
        };
        pool.iter()
            .find(|c| c.id == target.id.as_u64())
            .ok_or_else(|| ServiceError::NotFound(target.to_string()))
    }

    fn find_image(&self, id: u64) -> Result<&SnapshotImage, ServiceError> {
        self.check_access(EntityRef::image(id))?;
        self.images
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| ServiceError::NotFound(EntityRef::image(id).to_string()))
    }

    fn find_annotation(&self, id: u64) -> Result<&SnapshotAnnotation, ServiceError> {
        self.annotations
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| ServiceError::NotFound(EntityRef::annotation(id).to_string()))
    }

    fn exists(&self, target: DestRef) -> bool {
        let id = target.id.as_u64();
        match target.kind {
            EntityKind::Project => self.projects.iter().any(|c| c.id == id),
            EntityKind::Dataset => self.datasets.iter().any(|c| c.id == id),
            EntityKind::Image => self.images.iter().any(|i| i.id == id),
            EntityKind::Roi => self.rois.iter().any(|r| r.id == id),
            EntityKind::Annotation => self.annotations.iter().any(|a| a.id == id),
            EntityKind::Shape => false,
        }
    }
}

impl SourceService for SnapshotServer {
    fn container(&self, target: EntityRef) -> Result<RemoteContainer, ServiceError> {
        let container = self.find_container(target)?;
        Ok(RemoteContainer {
            id: target.id,
            name: container.name.clone(),
            description: container.description.clone(),
        })
    }

    fn image(&self, id: SourceId) -> Result<RemoteImage, ServiceError> {
        let image = self.find_image(id.as_u64())?;
        Ok(RemoteImage {
            id,
            name: image.name.clone(),
            description: image.description.clone(),
            pixels: image.pixels.clone(),
        })
    }

    fn children(&self, parent: EntityRef) -> Result<Vec<SourceId>, ServiceError> {
        let container = self.find_container(parent)?;
        Ok(container.children.iter().copied().map(SourceId).collect())
    }

    fn rois(&self, image: SourceId) -> Result<Vec<RemoteRoi>, ServiceError> {
        self.find_image(image.as_u64())?;
        let mut rois = Vec::new();
        for roi in self.rois.iter().filter(|r| r.image == image.as_u64()) {
            self.check_access(EntityRef::roi(roi.id))?;
            rois.push(RemoteRoi {
                id: SourceId(roi.id),
                name: roi.name.clone(),
                description: roi.description.clone(),
                shapes: roi.shapes.clone(),
            });
        }
        Ok(rois)
    }

    fn annotations(&self, target: EntityRef) -> Result<Vec<RemoteAnnotation>, ServiceError> {
        self.check_access(target)?;
        self.annotations_of(target.kind, target.id.as_u64())
            .into_iter()
            .map(|id| {
                let annotation = self.find_annotation(id)?;
                Ok(RemoteAnnotation {
                    id: SourceId(id),
                    kind: annotation.kind.clone(),
                })
            })
            .collect()
    }

    fn map_values(&self, annotation: SourceId) -> Result<Vec<(String, String)>, ServiceError> {
        Ok(self.find_annotation(annotation.as_u64())?.values.clone())
    }

    fn original_file_paths(
        &self,
        image: SourceId,
        view: PathView,
    ) -> Result<Vec<String>, ServiceError> {
        let image = self.find_image(image.as_u64())?;
        Ok(match view {
            PathView::Client => image.client_paths.clone(),
            PathView::Server => image.server_paths.clone(),
        })
    }
}

impl DestinationService for SnapshotServer {
    fn create_project(&mut self, project: &Project) -> Result<DestId, ServiceError> {
        let id = self.next_id();
        self.projects.push(SnapshotContainer {
            id,
            name: project.name.clone(),
            description: project.description.clone(),
            children: Vec::new(),
        });
        Ok(DestId(id))
    }

    fn create_dataset(&mut self, dataset: &Dataset) -> Result<DestId, ServiceError> {
        let id = self.next_id();
        self.datasets.push(SnapshotContainer {
            id,
            name: dataset.name.clone(),
            description: dataset.description.clone(),
            children: Vec::new(),
        });
        Ok(DestId(id))
    }

    fn create_image(&mut self, image: &Image) -> Result<DestId, ServiceError> {
        let id = self.next_id();
        self.images.push(SnapshotImage {
            id,
            name: image.name.clone(),
            description: image.description.clone(),
            pixels: image.pixels.clone(),
            client_paths: Vec::new(),
            server_paths: Vec::new(),
        });
        Ok(DestId(id))
    }

    fn create_annotation(&mut self, annotation: &Annotation) -> Result<DestId, ServiceError> {
        let id = self.next_id();
        let created = match annotation {
            Annotation::Tag(tag) => SnapshotAnnotation {
                id,
                kind: RemoteAnnotationKind::Tag {
                    text: tag.value.clone(),
                },
                values: Vec::new(),
            },
            Annotation::Map(map) => SnapshotAnnotation {
                id,
                kind: RemoteAnnotationKind::Map {
                    namespace: map.namespace.clone(),
                },
                values: map
                    .values
                    .iter()
                    .map(|pair| (pair.key.clone(), pair.value.clone()))
                    .collect(),
            },
        };
        self.annotations.push(created);
        Ok(DestId(id))
    }

    fn create_roi(&mut self, roi: &Roi, image: DestId) -> Result<DestId, ServiceError> {
        if !self.exists(DestRef::new(EntityKind::Image, image)) {
            return Err(ServiceError::NotFound(format!("Image:{}", image)));
        }
        let id = self.next_id();
        let shapes = roi
            .shapes
            .iter()
            .zip(id + 1..)
            .map(|(shape, shape_id)| remote_shape(shape, shape_id))
            .collect();
        self.rois.push(SnapshotRoi {
            id,
            image: image.as_u64(),
            name: roi.name.clone(),
            description: roi.description.clone(),
            shapes,
        });
        Ok(DestId(id))
    }

    fn link(&mut self, parent: DestRef, child: DestRef) -> Result<(), ServiceError> {
        let expected_child = match parent.kind {
            EntityKind::Project => EntityKind::Dataset,
            EntityKind::Dataset => EntityKind::Image,
            other => {
                return Err(ServiceError::Rejected(format!(
                    "{} cannot contain other entities",
                    other
                )))
            }
        };
        if child.kind != expected_child {
            return Err(ServiceError::Rejected(format!(
                "cannot link {} into {}",
                child, parent
            )));
        }
        if !self.exists(child) {
            return Err(ServiceError::NotFound(child.to_string()));
        }

        let pool = match parent.kind {
            EntityKind::Project => &mut self.projects,
            _ => &mut self.datasets,
        };
        let container = pool
            .iter_mut()
            .find(|c| c.id == parent.id.as_u64())
            .ok_or_else(|| ServiceError::NotFound(parent.to_string()))?;
        if !container.children.contains(&child.id.as_u64()) {
            container.children.push(child.id.as_u64());
        }
        Ok(())
    }

    fn annotate(&mut self, target: DestRef, annotation: DestId) -> Result<(), ServiceError> {
        if !self.exists(target) {
            return Err(ServiceError::NotFound(target.to_string()));
        }
        if !self.exists(DestRef::new(EntityKind::Annotation, annotation)) {
            return Err(ServiceError::NotFound(format!("Annotation:{}", annotation)));
        }
        let link = AnnotationLink {
            kind: target.kind,
            id: target.id.as_u64(),
            annotation: annotation.as_u64(),
        };
        if !self.annotation_links.contains(&link) {
            self.annotation_links.push(link);
        }
        Ok(())
    }

    fn image_ids_by_client_path(&self, client_path: &str) -> Result<Vec<DestId>, ServiceError> {
        let mut ids: Vec<DestId> = self
            .images
            .iter()
            .filter(|image| image.client_paths.iter().any(|p| p == client_path))
            .map(|image| DestId(image.id))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn remote_shape(shape: &Shape, id: u64) -> RemoteShape {
    let kind = match &shape.geometry {
        Geometry::Point { x, y } => RemoteShapeKind::Point { x: *x, y: *y },
        Geometry::Line { x1, y1, x2, y2 } => RemoteShapeKind::Line {
            x1: *x1,
            y1: *y1,
            x2: *x2,
            y2: *y2,
        },
        Geometry::Rectangle {
            x,
            y,
            width,
            height,
        } => RemoteShapeKind::Rectangle {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
        },
        Geometry::Ellipse {
            x,
            y,
            radius_x,
            radius_y,
        } => RemoteShapeKind::Ellipse {
            x: *x,
            y: *y,
            radius_x: *radius_x,
            radius_y: *radius_y,
        },
        Geometry::Polygon { points } => RemoteShapeKind::Polygon {
            points: points.clone(),
        },
    };
    RemoteShape {
        id,
        text: Some(shape.text.clone()),
        the_c: Some(shape.the_c),
        the_z: Some(shape.the_z),
        the_t: Some(shape.the_t),
        fill_color: shape.fill_color,
        stroke_color: shape.stroke_color,
        locked: shape.locked,
        kind,
    }
}
