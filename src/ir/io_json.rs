//! JSON persistence for the intermediate metadata document.
//!
//! The document written here is the hand-off between the export process and
//! everything downstream: a later process must be able to locate files,
//! correlate and rehydrate from it without talking to the source server.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use tracing::debug;

use super::model::Document;
use crate::error::MigrateError;
use crate::validation::{self, ValidateOptions};

/// Reads a document from a JSON file.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn read_imd(path: &Path) -> Result<Document, MigrateError> {
    let file = File::open(path).map_err(MigrateError::Io)?;
    let reader = BufReader::new(file);

    serde_json::from_reader(reader).map_err(|source| MigrateError::ImdParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes a document to a JSON file.
///
/// The document is validated and checked for a stable round-trip before
/// anything is written, so a file on disk is always loadable.
///
/// # Errors
/// Returns [`MigrateError::InvalidDocument`] for dangling or duplicate
/// references, [`MigrateError::RoundTrip`] if the serialized form is not
/// stable, or an IO error if the file cannot be written.
pub fn write_imd(path: &Path, document: &Document) -> Result<(), MigrateError> {
    let report = validation::validate_document(document, &ValidateOptions::default());
    if !report.is_ok() {
        return Err(MigrateError::InvalidDocument {
            error_count: report.error_count(),
            warning_count: report.warning_count(),
            report,
        });
    }

    let json = verify_round_trip(document)?;
    fs::write(path, json).map_err(MigrateError::Io)?;
    debug!(
        "Wrote {} entities to {}",
        document.entity_count(),
        path.display()
    );
    Ok(())
}

/// Serializes, parses and re-serializes `document`, returning the
/// serialized text if both passes agree byte for byte.
pub fn verify_round_trip(document: &Document) -> Result<String, MigrateError> {
    let first = to_json_string(document)
        .map_err(|e| MigrateError::RoundTrip(format!("serialization failed: {e}")))?;
    let parsed = from_json_str(&first)
        .map_err(|e| MigrateError::RoundTrip(format!("re-parse failed: {e}")))?;
    let second = to_json_string(&parsed)
        .map_err(|e| MigrateError::RoundTrip(format!("re-serialization failed: {e}")))?;

    if first != second {
        return Err(MigrateError::RoundTrip(
            "second serialization differs from the first".to_string(),
        ));
    }
    Ok(first)
}

/// Reads a document from a JSON string.
///
/// Useful for testing without file I/O.
pub fn from_json_str(json: &str) -> Result<Document, serde_json::Error> {
    serde_json::from_str(json)
}

/// Reads a document from JSON bytes.
pub fn from_json_slice(bytes: &[u8]) -> Result<Document, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Writes a document to a pretty-printed JSON string.
pub fn to_json_string(document: &Document) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Annotation, Dataset, EntityRef, Geometry, Image, MapAnnotation, Pixels, Project, Roi,
        Shape, TagAnnotation,
    };

    fn sample_document() -> Document {
        let mut project = Project::new(1u64, "Screening").with_description("2024 batch");
        project.dataset_refs.push(EntityRef::dataset(10u64));
        project.annotation_refs.push(EntityRef::annotation(500u64));

        let mut dataset = Dataset::new(10u64, "Plate A");
        dataset.image_refs.push(EntityRef::image(100u64));

        let mut image = Image::new(
            100u64,
            "well_A1.tif",
            Pixels::new("XYZCT", (512, 512, 3, 2, 1), "uint16"),
        );
        image.roi_refs.push(EntityRef::roi(1000u64));
        image.annotation_refs.push(EntityRef::annotation(500u64));
        image.annotation_refs.push(EntityRef::annotation(501u64));

        let roi = Roi::new(1000u64)
            .with_name("nucleus")
            .with_shape(Shape::new(
                2000u64,
                Geometry::Rectangle {
                    x: 10.0,
                    y: 12.5,
                    width: 30.0,
                    height: 40.0,
                },
            ))
            .with_shape(
                Shape::new(
                    2001u64,
                    Geometry::Polygon {
                        points: "1,1 5,1 5,5".into(),
                    },
                )
                .with_text("outline"),
            );

        Document {
            projects: vec![project],
            datasets: vec![dataset],
            images: vec![image],
            rois: vec![roi],
            annotations: vec![
                Annotation::Tag(TagAnnotation::new(500u64, "reviewed")),
                Annotation::Map(MapAnnotation::new(
                    501u64,
                    Some("openmicroscopy.org/omero/client/mapAnnotation".into()),
                    [("stain", "DAPI"), ("comment", "")],
                )),
            ],
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let original = sample_document();

        let json = to_json_string(&original).expect("serialization failed");
        let restored = from_json_str(&json).expect("deserialization failed");

        assert_eq!(original, restored);
    }

    #[test]
    fn test_verify_round_trip_returns_stable_text() {
        let doc = sample_document();
        let json = verify_round_trip(&doc).expect("round trip");
        assert_eq!(json, to_json_string(&doc).unwrap());
    }

    #[test]
    fn test_json_format() {
        let json = to_json_string(&sample_document()).expect("serialization failed");

        assert!(json.contains("\"projects\""));
        assert!(json.contains("\"annotations\""));
        assert!(json.contains("\"Dataset:10\""));
        assert!(json.contains("\"type\": \"Polygon\""));
        assert!(json.contains("\"value\": \" \""));
    }

    #[test]
    fn test_write_rejects_dangling_reference() {
        let mut doc = sample_document();
        doc.images[0]
            .annotation_refs
            .push(EntityRef::annotation(999u64));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let err = write_imd(&path, &doc).unwrap_err();

        assert!(matches!(err, MigrateError::InvalidDocument { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_write_then_read() {
        let doc = sample_document();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_imd(&path, &doc).expect("write");
        let restored = read_imd(&path).expect("read");

        assert_eq!(doc, restored);
    }

    #[test]
    fn test_write_to_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("doc.json");

        let err = write_imd(&path, &sample_document()).unwrap_err();
        assert!(matches!(err, MigrateError::Io(_)), "{:?}", err);
    }
}
