//! Newtype IDs and typed references for the intermediate metadata document.
//!
//! The source and destination servers number their entities independently.
//! Keeping the two ID spaces as separate types makes it a compile error to
//! hand a source ID to a destination call (or the other way around).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An entity ID as numbered by the source server.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl SourceId {
    /// Creates a new SourceId.
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SourceId {
    fn from(id: u64) -> Self {
        SourceId::new(id)
    }
}

/// An entity ID as numbered by the destination server.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestId(pub u64);

impl DestId {
    /// Creates a new DestId.
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestId({})", self.0)
    }
}

impl fmt::Display for DestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DestId {
    fn from(id: u64) -> Self {
        DestId::new(id)
    }
}

/// The kind of an entity in the metadata graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Project,
    Dataset,
    Image,
    Roi,
    Shape,
    Annotation,
}

impl EntityKind {
    /// The name used in the `<Kind>:<id>` reference syntax.
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Project => "Project",
            EntityKind::Dataset => "Dataset",
            EntityKind::Image => "Image",
            EntityKind::Roi => "ROI",
            EntityKind::Shape => "Shape",
            EntityKind::Annotation => "Annotation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityKind {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Project" | "project" => Ok(EntityKind::Project),
            "Dataset" | "dataset" => Ok(EntityKind::Dataset),
            "Image" | "image" => Ok(EntityKind::Image),
            "ROI" | "Roi" | "roi" => Ok(EntityKind::Roi),
            "Shape" | "shape" => Ok(EntityKind::Shape),
            "Annotation" | "annotation" => Ok(EntityKind::Annotation),
            other => Err(ParseRefError::UnknownKind(other.to_string())),
        }
    }
}

/// Errors from parsing the `<Kind>:<id>` reference syntax.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseRefError {
    #[error("reference '{0}' is not of the form <Kind>:<id>")]
    Malformed(String),

    #[error("unknown entity kind '{0}'")]
    UnknownKind(String),

    #[error("invalid numeric id in reference '{0}'")]
    InvalidId(String),
}

/// A typed pointer to a source-side entity: `(kind, source id)`.
///
/// References never imply ownership. In the document they serialize as a
/// single `"<Kind>:<id>"` string, e.g. `"Dataset:101"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: SourceId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<SourceId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn project(id: impl Into<SourceId>) -> Self {
        Self::new(EntityKind::Project, id)
    }

    pub fn dataset(id: impl Into<SourceId>) -> Self {
        Self::new(EntityKind::Dataset, id)
    }

    pub fn image(id: impl Into<SourceId>) -> Self {
        Self::new(EntityKind::Image, id)
    }

    pub fn roi(id: impl Into<SourceId>) -> Self {
        Self::new(EntityKind::Roi, id)
    }

    pub fn annotation(id: impl Into<SourceId>) -> Self {
        Self::new(EntityKind::Annotation, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseRefError::Malformed(s.to_string()))?;
        let kind: EntityKind = kind.trim().parse()?;
        let id: u64 = id
            .trim()
            .parse()
            .map_err(|_| ParseRefError::InvalidId(s.to_string()))?;
        Ok(EntityRef::new(kind, id))
    }
}

impl From<EntityRef> for String {
    fn from(r: EntityRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for EntityRef {
    type Error = ParseRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A typed handle to an entity that exists on the destination server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DestRef {
    pub kind: EntityKind,
    pub id: DestId,
}

impl DestRef {
    pub fn new(kind: EntityKind, id: impl Into<DestId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for DestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_equality() {
        assert_eq!(SourceId(1), SourceId(1));
        assert_ne!(DestId(1), DestId(2));
    }

    #[test]
    fn test_id_ordering() {
        assert!(SourceId(1) < SourceId(2));
        assert!(DestId(10) > DestId(5));
    }

    #[test]
    fn test_ref_display_and_parse() {
        let r = EntityRef::roi(42u64);
        assert_eq!(r.to_string(), "ROI:42");
        assert_eq!("ROI:42".parse::<EntityRef>().unwrap(), r);
        assert_eq!("image:7".parse::<EntityRef>().unwrap(), EntityRef::image(7u64));
    }

    #[test]
    fn test_ref_parse_errors() {
        assert!(matches!(
            "Project".parse::<EntityRef>(),
            Err(ParseRefError::Malformed(_))
        ));
        assert!(matches!(
            "Plate:1".parse::<EntityRef>(),
            Err(ParseRefError::UnknownKind(_))
        ));
        assert!(matches!(
            "Image:abc".parse::<EntityRef>(),
            Err(ParseRefError::InvalidId(_))
        ));
    }

    #[test]
    fn test_ref_serializes_as_string() {
        let json = serde_json::to_string(&EntityRef::dataset(101u64)).unwrap();
        assert_eq!(json, "\"Dataset:101\"");
        let back: EntityRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntityRef::dataset(101u64));
    }

    #[test]
    fn test_ref_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(EntityRef::image(1u64));
        set.insert(EntityRef::annotation(1u64));
        set.insert(EntityRef::image(1u64)); // duplicate
        assert_eq!(set.len(), 2);
    }
}
