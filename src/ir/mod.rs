//! Intermediate metadata document (IMD).
//!
//! This module defines the serialized snapshot that sits between the source
//! and destination servers. An export writes it, and every later stage
//! (file location, correlation, rehydration) reads it back.
//!
//! # Design Principles
//!
//! 1. **Two ID spaces**: [`SourceId`] and [`DestId`] are distinct newtypes,
//!    so identifiers from the two servers cannot be mixed up.
//!
//! 2. **Flat collections, typed references**: parents hold [`EntityRef`]s
//!    (`"<Kind>:<id>"`) to their children. Every entity appears exactly once
//!    in its top-level collection, and annotations live in a shared pool.
//!
//! 3. **Closed variants**: shapes and annotations are sum types, so every
//!    consumer matches exhaustively over the kinds it can receive.
//!
//! # Example
//!
//! ```
//! use omero_transfer::ir::{Document, Dataset, EntityRef, Image, Pixels, Project};
//!
//! let mut project = Project::new(1u64, "Screening");
//! project.dataset_refs.push(EntityRef::dataset(10u64));
//!
//! let document = Document {
//!     projects: vec![project],
//!     datasets: vec![Dataset::new(10u64, "Plate A")],
//!     ..Default::default()
//! };
//! assert!(document.contains(EntityRef::dataset(10u64)));
//! ```

mod ids;
pub mod io_json;
mod model;

// Re-export core types for convenient access
pub use ids::{DestId, DestRef, EntityKind, EntityRef, ParseRefError, SourceId};
pub use model::{
    Annotation, Dataset, Document, Geometry, Image, MapAnnotation, MapPair, Pixels, Project, Roi,
    Shape, TagAnnotation, EMPTY_VALUE_PLACEHOLDER,
};
