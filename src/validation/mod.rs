//! Document validation.
//!
//! Checks an intermediate metadata document for:
//! - Structural integrity (unique entities, resolvable references of the
//!   right kind)
//! - Nesting (an entity contained by more than one parent)
//! - Content that the destination would reject or silently alter

mod report;

pub use report::{IssueCode, IssueContext, Severity, ValidationIssue, ValidationReport};

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ir::{Annotation, Document, EntityKind, EntityRef, SourceId};

/// Options for validation behavior.
#[derive(Clone, Debug, Default)]
pub struct ValidateOptions {
    /// If true, treat warnings as errors.
    pub strict: bool,
}

/// Validates a document and returns a report of all issues found.
pub fn validate_document(document: &Document, _opts: &ValidateOptions) -> ValidationReport {
    let mut report = ValidationReport::new();

    let present = collect_entities(document, &mut report);

    let mut parents: BTreeMap<EntityRef, Vec<EntityRef>> = BTreeMap::new();
    for project in &document.projects {
        let owner = project.entity_ref();
        check_refs(owner, &project.dataset_refs, EntityKind::Dataset, &present, &mut report);
        check_refs(owner, &project.annotation_refs, EntityKind::Annotation, &present, &mut report);
        record_parents(owner, &project.dataset_refs, &mut parents);
    }
    for dataset in &document.datasets {
        let owner = dataset.entity_ref();
        check_refs(owner, &dataset.image_refs, EntityKind::Image, &present, &mut report);
        check_refs(owner, &dataset.annotation_refs, EntityKind::Annotation, &present, &mut report);
        record_parents(owner, &dataset.image_refs, &mut parents);
    }
    for image in &document.images {
        let owner = image.entity_ref();
        check_refs(owner, &image.roi_refs, EntityKind::Roi, &present, &mut report);
        check_refs(owner, &image.annotation_refs, EntityKind::Annotation, &present, &mut report);
        record_parents(owner, &image.roi_refs, &mut parents);
    }
    for roi in &document.rois {
        let owner = roi.entity_ref();
        check_refs(owner, &roi.annotation_refs, EntityKind::Annotation, &present, &mut report);
    }

    for (child, owners) in &parents {
        if owners.len() > 1 {
            let listed: Vec<String> = owners.iter().map(|o| o.to_string()).collect();
            report.add(ValidationIssue::warning(
                IssueCode::MultipleParents,
                format!("Contained by {} parents: {}", owners.len(), listed.join(", ")),
                IssueContext::Entity { target: *child },
            ));
        }
    }

    validate_annotations(document, &mut report);
    validate_shapes(document, &mut report);

    report
}

/// Collects every top-level entity, reporting duplicates.
fn collect_entities(document: &Document, report: &mut ValidationReport) -> HashSet<EntityRef> {
    let refs = document
        .projects
        .iter()
        .map(|p| p.entity_ref())
        .chain(document.datasets.iter().map(|d| d.entity_ref()))
        .chain(document.images.iter().map(|i| i.entity_ref()))
        .chain(document.rois.iter().map(|r| r.entity_ref()))
        .chain(document.annotations.iter().map(|a| a.entity_ref()));

    let mut seen: HashMap<EntityRef, usize> = HashMap::new();
    for (idx, target) in refs.enumerate() {
        if let Some(first_idx) = seen.get(&target) {
            report.add(ValidationIssue::error(
                IssueCode::DuplicateEntity,
                format!(
                    "Duplicate entity (first seen at position {} of the document)",
                    first_idx
                ),
                IssueContext::Entity { target },
            ));
        } else {
            seen.insert(target, idx);
        }
    }

    seen.into_keys().collect()
}

fn check_refs(
    owner: EntityRef,
    refs: &[EntityRef],
    expected: EntityKind,
    present: &HashSet<EntityRef>,
    report: &mut ValidationReport,
) {
    let mut listed: HashSet<EntityRef> = HashSet::new();
    for target in refs {
        if target.kind != expected {
            report.add(ValidationIssue::error(
                IssueCode::WrongReferenceKind,
                format!("References {} where a {} was expected", target, expected),
                IssueContext::Entity { target: owner },
            ));
            continue;
        }

        if !present.contains(target) {
            report.add(ValidationIssue::error(
                IssueCode::DanglingReference,
                format!("References non-existent {}", target),
                IssueContext::Entity { target: owner },
            ));
        }

        if !listed.insert(*target) {
            report.add(ValidationIssue::warning(
                IssueCode::RepeatedReference,
                format!("Lists {} more than once", target),
                IssueContext::Entity { target: owner },
            ));
        }
    }
}

fn record_parents(
    owner: EntityRef,
    children: &[EntityRef],
    parents: &mut BTreeMap<EntityRef, Vec<EntityRef>>,
) {
    for child in children {
        let owners = parents.entry(*child).or_default();
        if !owners.contains(&owner) {
            owners.push(owner);
        }
    }
}

fn validate_annotations(document: &Document, report: &mut ValidationReport) {
    for annotation in &document.annotations {
        let Annotation::Map(map) = annotation else {
            continue;
        };
        for pair in map.values.iter().filter(|pair| pair.value.is_empty()) {
            report.add(ValidationIssue::warning(
                IssueCode::EmptyMapValue,
                format!("Key '{}' has an empty value", pair.key),
                IssueContext::Entity {
                    target: annotation.entity_ref(),
                },
            ));
        }
    }
}

fn validate_shapes(document: &Document, report: &mut ValidationReport) {
    for roi in &document.rois {
        let mut seen: HashSet<SourceId> = HashSet::new();
        for shape in &roi.shapes {
            let context = IssueContext::Shape {
                roi: roi.id,
                id: shape.id,
            };

            if !seen.insert(shape.id) {
                report.add(ValidationIssue::error(
                    IssueCode::DuplicateShapeId,
                    format!("Shape ID {} appears more than once", shape.id),
                    context.clone(),
                ));
            }

            if shape.the_c < 0 || shape.the_z < 0 || shape.the_t < 0 {
                report.add(ValidationIssue::error(
                    IssueCode::NegativePlaneIndex,
                    format!(
                        "Negative plane index (c={}, z={}, t={})",
                        shape.the_c, shape.the_z, shape.the_t
                    ),
                    context,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Dataset, Geometry, Image, MapAnnotation, MapPair, Pixels, Project, Roi, Shape,
        TagAnnotation,
    };

    fn pixels() -> Pixels {
        Pixels::new("XYZCT", (256, 256, 1, 1, 1), "uint8")
    }

    fn valid_document() -> Document {
        let mut project = Project::new(1u64, "P");
        project.dataset_refs.push(EntityRef::dataset(2u64));
        let mut dataset = Dataset::new(2u64, "D");
        dataset.image_refs.push(EntityRef::image(3u64));
        let mut image = Image::new(3u64, "img.tif", pixels());
        image.roi_refs.push(EntityRef::roi(4u64));
        image.annotation_refs.push(EntityRef::annotation(5u64));
        let roi = Roi::new(4u64).with_shape(Shape::new(6u64, Geometry::Point { x: 1.0, y: 1.0 }));

        Document {
            projects: vec![project],
            datasets: vec![dataset],
            images: vec![image],
            rois: vec![roi],
            annotations: vec![Annotation::Tag(TagAnnotation::new(5u64, "t"))],
        }
    }

    #[test]
    fn test_valid_document() {
        let report = validate_document(&valid_document(), &ValidateOptions::default());
        assert!(
            report.is_clean(),
            "Expected no issues, got: {:?}",
            report.issues
        );
    }

    #[test]
    fn test_duplicate_entity() {
        let mut doc = valid_document();
        doc.images.push(Image::new(3u64, "again.tif", pixels()));

        let report = validate_document(&doc, &ValidateOptions::default());
        assert_eq!(report.error_count(), 1);
        assert!(report.has(IssueCode::DuplicateEntity));
    }

    #[test]
    fn test_same_id_different_kind_is_not_duplicate() {
        let mut doc = valid_document();
        doc.annotations
            .push(Annotation::Tag(TagAnnotation::new(3u64, "shares id with image")));

        let report = validate_document(&doc, &ValidateOptions::default());
        assert!(!report.has(IssueCode::DuplicateEntity));
    }

    #[test]
    fn test_dangling_reference() {
        let mut doc = valid_document();
        doc.datasets[0].image_refs.push(EntityRef::image(999u64));

        let report = validate_document(&doc, &ValidateOptions::default());
        assert_eq!(report.error_count(), 1);
        assert!(report.has(IssueCode::DanglingReference));
    }

    #[test]
    fn test_wrong_reference_kind() {
        let mut doc = valid_document();
        doc.projects[0].dataset_refs.push(EntityRef::image(3u64));

        let report = validate_document(&doc, &ValidateOptions::default());
        assert!(report.has(IssueCode::WrongReferenceKind));
    }

    #[test]
    fn test_multiple_parents_warns() {
        let mut doc = valid_document();
        let mut second = Dataset::new(7u64, "D2");
        second.image_refs.push(EntityRef::image(3u64));
        doc.datasets.push(second);

        let report = validate_document(&doc, &ValidateOptions::default());
        assert!(report.is_ok());
        assert_eq!(report.warning_count(), 1);
        assert!(report.has(IssueCode::MultipleParents));
    }

    #[test]
    fn test_empty_map_value_warns() {
        let mut doc = valid_document();
        let mut map = MapAnnotation::new(8u64, None, [("k", "v")]);
        // Bypass the constructor's normalization, as a hand-edited file would.
        map.values.push(MapPair {
            key: "blank".into(),
            value: String::new(),
        });
        doc.annotations.push(Annotation::Map(map));

        let report = validate_document(&doc, &ValidateOptions::default());
        assert!(report.has(IssueCode::EmptyMapValue));
    }

    #[test]
    fn test_negative_plane_index() {
        let mut doc = valid_document();
        doc.rois[0].shapes[0].the_z = -1;

        let report = validate_document(&doc, &ValidateOptions::default());
        assert!(report.has(IssueCode::NegativePlaneIndex));
    }

    #[test]
    fn test_duplicate_shape_id() {
        let mut doc = valid_document();
        let copy = doc.rois[0].shapes[0].clone();
        doc.rois[0].shapes.push(copy);

        let report = validate_document(&doc, &ValidateOptions::default());
        assert!(report.has(IssueCode::DuplicateShapeId));
    }
}
