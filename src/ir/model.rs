//! Core document model for the intermediate metadata representation.
//!
//! The document is a flat snapshot of an exported graph: five top-level
//! collections, with parents pointing at children through [`EntityRef`]s
//! rather than owning them. Collections keep insertion order so that two
//! exports of the same graph produce byte-identical files.

use serde::{Deserialize, Serialize};

use super::ids::{EntityKind, EntityRef, SourceId};

/// Value substituted for empty map-annotation values.
///
/// The wire format cannot distinguish an empty value from a missing one.
pub const EMPTY_VALUE_PLACEHOLDER: &str = " ";

/// A complete exported metadata graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub projects: Vec<Project>,

    #[serde(default)]
    pub datasets: Vec<Dataset>,

    #[serde(default)]
    pub images: Vec<Image>,

    #[serde(default)]
    pub rois: Vec<Roi>,

    /// The annotation pool, shared by reference across all entities.
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the collection for `r.kind` already holds `r.id`.
    ///
    /// Membership is by ID only. Shapes are owned by their ROI and never
    /// appear at the top level.
    pub fn contains(&self, r: EntityRef) -> bool {
        match r.kind {
            EntityKind::Project => self.project(r.id).is_some(),
            EntityKind::Dataset => self.dataset(r.id).is_some(),
            EntityKind::Image => self.image(r.id).is_some(),
            EntityKind::Roi => self.roi(r.id).is_some(),
            EntityKind::Annotation => self.annotation(r.id).is_some(),
            EntityKind::Shape => false,
        }
    }

    pub fn project(&self, id: SourceId) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn dataset(&self, id: SourceId) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.id == id)
    }

    pub fn image(&self, id: SourceId) -> Option<&Image> {
        self.images.iter().find(|i| i.id == id)
    }

    pub fn roi(&self, id: SourceId) -> Option<&Roi> {
        self.rois.iter().find(|r| r.id == id)
    }

    pub fn annotation(&self, id: SourceId) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.id() == id)
    }

    /// Total number of top-level entities across all five collections.
    pub fn entity_count(&self) -> usize {
        self.projects.len()
            + self.datasets.len()
            + self.images.len()
            + self.rois.len()
            + self.annotations.len()
    }
}

/// A project: the top of the container hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: SourceId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Datasets contained in this project, in server order.
    #[serde(default)]
    pub dataset_refs: Vec<EntityRef>,

    #[serde(default)]
    pub annotation_refs: Vec<EntityRef>,
}

impl Project {
    pub fn new(id: impl Into<SourceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            dataset_refs: Vec::new(),
            annotation_refs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::project(self.id)
    }
}

/// A dataset: a container of images.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: SourceId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub image_refs: Vec<EntityRef>,

    #[serde(default)]
    pub annotation_refs: Vec<EntityRef>,
}

impl Dataset {
    pub fn new(id: impl Into<SourceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            image_refs: Vec::new(),
            annotation_refs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::dataset(self.id)
    }
}

/// An image. Pixel data never travels through the document; only the
/// descriptor does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: SourceId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub pixels: Pixels,

    #[serde(default)]
    pub roi_refs: Vec<EntityRef>,

    #[serde(default)]
    pub annotation_refs: Vec<EntityRef>,
}

impl Image {
    pub fn new(id: impl Into<SourceId>, name: impl Into<String>, pixels: Pixels) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            pixels,
            roi_refs: Vec::new(),
            annotation_refs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::image(self.id)
    }
}

/// Pixel descriptor for an image (a single pixel set per image).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixels {
    /// Dimension order, e.g. `XYZCT`.
    pub dimension_order: String,
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_c: u32,
    pub size_t: u32,
    /// Pixel type, e.g. `uint16`.
    pub pixel_type: String,
    /// Always true for exported images: no raw payload is carried.
    #[serde(default = "default_metadata_only")]
    pub metadata_only: bool,
}

fn default_metadata_only() -> bool {
    true
}

impl Pixels {
    pub fn new(
        dimension_order: impl Into<String>,
        (size_x, size_y, size_z, size_c, size_t): (u32, u32, u32, u32, u32),
        pixel_type: impl Into<String>,
    ) -> Self {
        Self {
            dimension_order: dimension_order.into(),
            size_x,
            size_y,
            size_z,
            size_c,
            size_t,
            pixel_type: pixel_type.into(),
            metadata_only: true,
        }
    }
}

/// A region of interest: a named group of shapes on one image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub id: SourceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub shapes: Vec<Shape>,

    #[serde(default)]
    pub annotation_refs: Vec<EntityRef>,
}

impl Roi {
    pub fn new(id: impl Into<SourceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            shapes: Vec::new(),
            annotation_refs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shapes.push(shape);
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::roi(self.id)
    }
}

/// A single shape inside a ROI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: SourceId,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub the_c: i32,

    #[serde(default)]
    pub the_z: i32,

    #[serde(default)]
    pub the_t: i32,

    /// Packed RGBA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<i32>,

    /// Packed RGBA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,

    pub geometry: Geometry,
}

impl Shape {
    /// Creates a shape with default text and plane indices.
    pub fn new(id: impl Into<SourceId>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            text: String::new(),
            the_c: 0,
            the_z: 0,
            the_t: 0,
            fill_color: None,
            stroke_color: None,
            locked: None,
            geometry,
        }
    }

    /// Sets the channel index, clamping negatives (the server's "all
    /// channels" sentinel) to 0.
    pub fn with_channel(mut self, the_c: i32) -> Self {
        self.the_c = the_c.max(0);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

/// Variant-specific geometry of a [`Shape`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point {
        x: f64,
        y: f64,
    },
    Line {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    },
    Rectangle {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    Ellipse {
        x: f64,
        y: f64,
        radius_x: f64,
        radius_y: f64,
    },
    /// Vertices as `"x1,y1 x2,y2 ..."`.
    Polygon {
        points: String,
    },
}

impl Geometry {
    pub fn name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "point",
            Geometry::Line { .. } => "line",
            Geometry::Rectangle { .. } => "rectangle",
            Geometry::Ellipse { .. } => "ellipse",
            Geometry::Polygon { .. } => "polygon",
        }
    }
}

/// A pooled annotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Annotation {
    Tag(TagAnnotation),
    Map(MapAnnotation),
}

impl Annotation {
    pub fn id(&self) -> SourceId {
        match self {
            Annotation::Tag(tag) => tag.id,
            Annotation::Map(map) => map.id,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::annotation(self.id())
    }
}

/// A tag: a single text label.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAnnotation {
    pub id: SourceId,
    pub value: String,
}

impl TagAnnotation {
    pub fn new(id: impl Into<SourceId>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }
}

/// A key-value annotation with an optional namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapAnnotation {
    pub id: SourceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Ordered pairs; keys may repeat.
    #[serde(default)]
    pub values: Vec<MapPair>,
}

impl MapAnnotation {
    /// Builds a map annotation, replacing empty values with
    /// [`EMPTY_VALUE_PLACEHOLDER`].
    pub fn new<K, V>(
        id: impl Into<SourceId>,
        namespace: Option<String>,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(key, value)| MapPair::new(key, value))
            .collect();
        Self {
            id: id.into(),
            namespace,
            values,
        }
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|pair| pair.key == key)
            .map(|pair| pair.value.as_str())
    }
}

/// One key-value entry of a [`MapAnnotation`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapPair {
    pub key: String,
    pub value: String,
}

impl MapPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut value = value.into();
        if value.is_empty() {
            value = EMPTY_VALUE_PLACEHOLDER.to_string();
        }
        Self {
            key: key.into(),
            value,
        }
    }
}
