//! Graph export: source server -> intermediate metadata document.
//!
//! The exporter walks the source hierarchy depth-first from a root project,
//! dataset or image, collecting every descendant and every annotation
//! attached along the way. Each entity is visited at most once per run;
//! annotations land in the shared pool once and are referenced from every
//! parent that carries them.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::MigrateError;
use crate::ir::{
    Annotation, Dataset, Document, EntityKind, EntityRef, Geometry, Image, MapAnnotation, Project,
    Roi, Shape, SourceId, TagAnnotation,
};
use crate::service::{
    RemoteAnnotationKind, RemoteRoi, RemoteShape, RemoteShapeKind, ServiceError, SourceService,
};

/// Exports `root` and everything beneath it.
///
/// # Errors
/// Any entity reachable from the root that cannot be read is fatal: no
/// partial document is returned.
pub fn export_graph<S>(source: &S, root: EntityRef) -> Result<Document, MigrateError>
where
    S: SourceService + ?Sized,
{
    info!("Exporting {} from source server", root);
    let mut exporter = Exporter::new(source);

    match root.kind {
        EntityKind::Project => {
            exporter.project(root.id)?;
        }
        EntityKind::Dataset => {
            exporter.dataset(root.id)?;
        }
        EntityKind::Image => {
            exporter.image(root.id)?;
        }
        other => return Err(MigrateError::UnsupportedRoot(other)),
    }

    let document = exporter.finish();
    info!(
        "Exported {} project(s), {} dataset(s), {} image(s), {} ROI(s), {} annotation(s)",
        document.projects.len(),
        document.datasets.len(),
        document.images.len(),
        document.rois.len(),
        document.annotations.len()
    );
    Ok(document)
}

/// Per-run traversal state: the document under construction and the set of
/// `(kind, source id)` pairs already visited.
struct Exporter<'a, S: ?Sized> {
    source: &'a S,
    document: Document,
    seen: HashSet<EntityRef>,
}

impl<'a, S> Exporter<'a, S>
where
    S: SourceService + ?Sized,
{
    fn new(source: &'a S) -> Self {
        Self {
            source,
            document: Document::new(),
            seen: HashSet::new(),
        }
    }

    fn finish(self) -> Document {
        self.document
    }

    /// Marks `target` visited. Returns false if it already was.
    fn visit(&mut self, target: EntityRef) -> bool {
        self.seen.insert(target)
    }

    fn project(&mut self, id: SourceId) -> Result<EntityRef, MigrateError> {
        let target = EntityRef::project(id);
        if !self.visit(target) {
            return Ok(target);
        }
        debug!("Exporting {}", target);

        let remote = self.source.container(target).map_err(|e| source_error(target, e))?;
        let mut project = Project::new(id, remote.name);
        project.description = remote.description;
        project.annotation_refs = self.annotations(target)?;

        let children = self.source.children(target).map_err(|e| source_error(target, e))?;
        for child in children {
            let dataset_ref = self.dataset(child)?;
            project.dataset_refs.push(dataset_ref);
        }

        self.document.projects.push(project);
        Ok(target)
    }

    fn dataset(&mut self, id: SourceId) -> Result<EntityRef, MigrateError> {
        let target = EntityRef::dataset(id);
        if !self.visit(target) {
            return Ok(target);
        }
        debug!("Exporting {}", target);

        let remote = self.source.container(target).map_err(|e| source_error(target, e))?;
        let mut dataset = Dataset::new(id, remote.name);
        dataset.description = remote.description;
        dataset.annotation_refs = self.annotations(target)?;

        let children = self.source.children(target).map_err(|e| source_error(target, e))?;
        for child in children {
            let image_ref = self.image(child)?;
            dataset.image_refs.push(image_ref);
        }

        self.document.datasets.push(dataset);
        Ok(target)
    }

    fn image(&mut self, id: SourceId) -> Result<EntityRef, MigrateError> {
        let target = EntityRef::image(id);
        if !self.visit(target) {
            return Ok(target);
        }
        debug!("Exporting {}", target);

        let remote = self.source.image(id).map_err(|e| source_error(target, e))?;
        let mut image = Image::new(id, remote.name, remote.pixels);
        image.description = remote.description;
        image.pixels.metadata_only = true;
        image.annotation_refs = self.annotations(target)?;

        let rois = self.source.rois(id).map_err(|e| source_error(target, e))?;
        for remote_roi in rois {
            let roi_ref = self.roi(remote_roi)?;
            image.roi_refs.push(roi_ref);
        }

        self.document.images.push(image);
        Ok(target)
    }

    fn roi(&mut self, remote: RemoteRoi) -> Result<EntityRef, MigrateError> {
        let target = EntityRef::roi(remote.id);
        if !self.visit(target) {
            return Ok(target);
        }

        let mut roi = Roi::new(remote.id);
        roi.name = remote.name;
        roi.description = remote.description;
        roi.shapes = remote.shapes.iter().filter_map(classify_shape).collect();
        roi.annotation_refs = self.annotations(target)?;

        debug!("Exporting {} with {} shape(s)", target, roi.shapes.len());
        self.document.rois.push(roi);
        Ok(target)
    }

    /// Pools every supported annotation on `target` and returns the
    /// references to attach to it.
    fn annotations(&mut self, target: EntityRef) -> Result<Vec<EntityRef>, MigrateError> {
        let remote = self
            .source
            .annotations(target)
            .map_err(|e| source_error(target, e))?;

        let mut refs = Vec::with_capacity(remote.len());
        for annotation in remote {
            let ann_ref = EntityRef::annotation(annotation.id);
            match annotation.kind {
                RemoteAnnotationKind::Tag { text } => {
                    if self.visit(ann_ref) {
                        self.document
                            .annotations
                            .push(Annotation::Tag(TagAnnotation::new(annotation.id, text)));
                    }
                }
                RemoteAnnotationKind::Map { namespace } => {
                    if self.visit(ann_ref) {
                        let pairs = self
                            .source
                            .map_values(annotation.id)
                            .map_err(|e| source_error(ann_ref, e))?;
                        self.document.annotations.push(Annotation::Map(MapAnnotation::new(
                            annotation.id,
                            namespace,
                            pairs,
                        )));
                    }
                }
                RemoteAnnotationKind::Other { type_name } => {
                    debug!("Skipping {} ({}) on {}", ann_ref, type_name, target);
                    continue;
                }
            }
            refs.push(ann_ref);
        }
        Ok(refs)
    }
}

/// Converts a server shape into its document form.
///
/// Exactly one arm handles each server kind. Kinds the document does not
/// carry yield `None`.
pub fn classify_shape(remote: &RemoteShape) -> Option<Shape> {
    let geometry = match &remote.kind {
        RemoteShapeKind::Point { x, y } => Geometry::Point { x: *x, y: *y },
        RemoteShapeKind::Line { x1, y1, x2, y2 } => Geometry::Line {
            x1: *x1,
            y1: *y1,
            x2: *x2,
            y2: *y2,
        },
        RemoteShapeKind::Rectangle {
            x,
            y,
            width,
            height,
        } => Geometry::Rectangle {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
        },
        RemoteShapeKind::Ellipse {
            x,
            y,
            radius_x,
            radius_y,
        } => Geometry::Ellipse {
            x: *x,
            y: *y,
            radius_x: *radius_x,
            radius_y: *radius_y,
        },
        RemoteShapeKind::Polygon { points } => Geometry::Polygon {
            points: points.clone(),
        },
        RemoteShapeKind::Polyline { .. }
        | RemoteShapeKind::Label { .. }
        | RemoteShapeKind::Mask { .. } => {
            debug!("Skipping unsupported shape {}", remote.id);
            return None;
        }
    };

    let mut shape = Shape::new(remote.id, geometry).with_channel(remote.the_c.unwrap_or(0));
    shape.text = remote.text.clone().unwrap_or_default();
    shape.the_z = remote.the_z.unwrap_or(0);
    shape.the_t = remote.the_t.unwrap_or(0);
    shape.fill_color = remote.fill_color;
    shape.stroke_color = remote.stroke_color;
    shape.locked = remote.locked;
    Some(shape)
}

fn source_error(target: EntityRef, err: ServiceError) -> MigrateError {
    match err {
        ServiceError::Connection(message) => MigrateError::Connection {
            service: "source",
            message,
        },
        ServiceError::NotFound(message)
        | ServiceError::PermissionDenied(message)
        | ServiceError::Rejected(message) => MigrateError::NotFound { target, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Pixels;
    use crate::service::{
        AnnotationLink, SnapshotAnnotation, SnapshotContainer, SnapshotImage, SnapshotRoi,
        SnapshotServer,
    };

    fn image(id: u64, name: &str) -> SnapshotImage {
        SnapshotImage {
            id,
            name: name.into(),
            description: None,
            pixels: Pixels::new("XYZCT", (64, 64, 1, 2, 1), "uint16"),
            client_paths: vec![format!("/home/u/{}", name)],
            server_paths: vec![format!("u_1/{}", name)],
        }
    }

    fn link(kind: EntityKind, id: u64, annotation: u64) -> AnnotationLink {
        AnnotationLink {
            kind,
            id,
            annotation,
        }
    }

    fn source() -> SnapshotServer {
        SnapshotServer {
            projects: vec![SnapshotContainer {
                id: 1,
                name: "Screen".into(),
                description: Some("primary".into()),
                children: vec![10, 11],
            }],
            datasets: vec![
                SnapshotContainer {
                    id: 10,
                    name: "Plate A".into(),
                    description: None,
                    children: vec![100, 101],
                },
                SnapshotContainer {
                    id: 11,
                    name: "Plate B".into(),
                    description: None,
                    children: vec![101],
                },
            ],
            images: vec![image(100, "a.tif"), image(101, "b.tif")],
            rois: vec![SnapshotRoi {
                id: 1000,
                image: 100,
                name: Some("cell".into()),
                description: None,
                shapes: vec![
                    RemoteShape::new(1, RemoteShapeKind::Point { x: 1.0, y: 2.0 }),
                    RemoteShape::new(
                        2,
                        RemoteShapeKind::Polyline {
                            points: "0,0 1,1".into(),
                        },
                    ),
                    RemoteShape::new(
                        3,
                        RemoteShapeKind::Polygon {
                            points: "0,0 4,0 4,4".into(),
                        },
                    ),
                ],
            }],
            annotations: vec![
                SnapshotAnnotation {
                    id: 500,
                    kind: RemoteAnnotationKind::Tag {
                        text: "qc-pass".into(),
                    },
                    values: vec![],
                },
                SnapshotAnnotation {
                    id: 501,
                    kind: RemoteAnnotationKind::Map { namespace: None },
                    values: vec![("stain".into(), "DAPI".into()), ("note".into(), "".into())],
                },
                SnapshotAnnotation {
                    id: 502,
                    kind: RemoteAnnotationKind::Other {
                        type_name: "CommentAnnotation".into(),
                    },
                    values: vec![],
                },
            ],
            annotation_links: vec![
                link(EntityKind::Project, 1, 500),
                link(EntityKind::Dataset, 10, 500),
                link(EntityKind::Image, 100, 500),
                link(EntityKind::Image, 100, 501),
                link(EntityKind::Image, 101, 502),
                link(EntityKind::Roi, 1000, 501),
            ],
            restricted: vec![],
        }
    }

    #[test]
    fn test_export_project_collects_hierarchy() {
        let doc = export_graph(&source(), EntityRef::project(1u64)).unwrap();

        assert_eq!(doc.projects.len(), 1);
        assert_eq!(doc.datasets.len(), 2);
        assert_eq!(doc.images.len(), 2);
        assert_eq!(doc.rois.len(), 1);
        assert_eq!(doc.annotations.len(), 2);

        let project = &doc.projects[0];
        assert_eq!(project.description.as_deref(), Some("primary"));
        assert_eq!(
            project.dataset_refs,
            vec![EntityRef::dataset(10u64), EntityRef::dataset(11u64)]
        );
    }

    #[test]
    fn test_shared_annotation_is_pooled_once() {
        let doc = export_graph(&source(), EntityRef::project(1u64)).unwrap();

        let tag_ref = EntityRef::annotation(500u64);
        let pooled = doc
            .annotations
            .iter()
            .filter(|a| a.entity_ref() == tag_ref)
            .count();
        assert_eq!(pooled, 1);

        let references = doc.projects[0]
            .annotation_refs
            .iter()
            .chain(doc.datasets.iter().flat_map(|d| d.annotation_refs.iter()))
            .chain(doc.images.iter().flat_map(|i| i.annotation_refs.iter()))
            .filter(|r| **r == tag_ref)
            .count();
        assert_eq!(references, 3);
    }

    #[test]
    fn test_image_in_two_datasets_exported_once() {
        let doc = export_graph(&source(), EntityRef::project(1u64)).unwrap();

        assert_eq!(
            doc.images
                .iter()
                .filter(|i| i.id == SourceId(101))
                .count(),
            1
        );
        assert!(doc.datasets[0].image_refs.contains(&EntityRef::image(101u64)));
        assert!(doc.datasets[1].image_refs.contains(&EntityRef::image(101u64)));
    }

    #[test]
    fn test_unsupported_annotations_are_not_referenced() {
        let doc = export_graph(&source(), EntityRef::image(101u64)).unwrap();
        assert!(doc.images[0].annotation_refs.is_empty());
        assert!(doc.annotations.is_empty());
    }

    #[test]
    fn test_map_values_normalized_on_export() {
        let doc = export_graph(&source(), EntityRef::image(100u64)).unwrap();
        let map = doc
            .annotations
            .iter()
            .find_map(|a| match a {
                Annotation::Map(map) => Some(map),
                Annotation::Tag(_) => None,
            })
            .unwrap();
        assert_eq!(map.get("stain"), Some("DAPI"));
        assert_eq!(map.get("note"), Some(" "));
    }

    #[test]
    fn test_roi_shapes_classified_in_order() {
        let doc = export_graph(&source(), EntityRef::image(100u64)).unwrap();
        let roi = &doc.rois[0];

        let kinds: Vec<&str> = roi.shapes.iter().map(|s| s.geometry.name()).collect();
        assert_eq!(kinds, vec!["point", "polygon"]);
        assert_eq!(roi.annotation_refs, vec![EntityRef::annotation(501u64)]);
        assert_eq!(doc.images[0].roi_refs, vec![EntityRef::roi(1000u64)]);
    }

    #[test]
    fn test_each_shape_kind_yields_exactly_one_variant() {
        let kinds = vec![
            RemoteShapeKind::Point { x: 0.0, y: 0.0 },
            RemoteShapeKind::Line {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
            RemoteShapeKind::Rectangle {
                x: 0.0,
                y: 0.0,
                width: 2.0,
                height: 3.0,
            },
            RemoteShapeKind::Ellipse {
                x: 0.0,
                y: 0.0,
                radius_x: 2.0,
                radius_y: 3.0,
            },
            RemoteShapeKind::Polygon {
                points: "0,0 1,0 1,1".into(),
            },
        ];
        let expected = ["point", "line", "rectangle", "ellipse", "polygon"];

        for (kind, name) in kinds.into_iter().zip(expected) {
            let shape = classify_shape(&RemoteShape::new(7, kind)).expect("supported shape");
            assert_eq!(shape.geometry.name(), name);
        }
    }

    #[test]
    fn test_shape_defaults_and_clamping() {
        let mut remote = RemoteShape::new(9, RemoteShapeKind::Point { x: 3.0, y: 4.0 });
        remote.the_c = Some(-1);
        remote.the_t = Some(2);
        remote.stroke_color = Some(-16776961);

        let shape = classify_shape(&remote).unwrap();
        assert_eq!(shape.text, "");
        assert_eq!(shape.the_c, 0);
        assert_eq!(shape.the_z, 0);
        assert_eq!(shape.the_t, 2);
        assert_eq!(shape.stroke_color, Some(-16776961));
        assert_eq!(shape.fill_color, None);
        assert_eq!(shape.locked, None);
    }

    #[test]
    fn test_missing_child_is_fatal() {
        let mut server = source();
        server.datasets[1].children.push(999);

        let err = export_graph(&server, EntityRef::project(1u64)).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::NotFound { target, .. } if target == EntityRef::image(999u64)
        ));
    }

    #[test]
    fn test_restricted_entity_is_fatal() {
        let mut server = source();
        server.restricted.push(EntityRef::dataset(11u64));

        let err = export_graph(&server, EntityRef::project(1u64)).unwrap_err();
        assert!(matches!(err, MigrateError::NotFound { .. }));
    }

    #[test]
    fn test_unsupported_root() {
        let err = export_graph(&source(), EntityRef::roi(1000u64)).unwrap_err();
        assert!(matches!(err, MigrateError::UnsupportedRoot(EntityKind::Roi)));
    }

    #[test]
    fn test_export_is_deterministic() {
        let first = export_graph(&source(), EntityRef::project(1u64)).unwrap();
        let second = export_graph(&source(), EntityRef::project(1u64)).unwrap();
        assert_eq!(first, second);
    }
}
