#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use omero_transfer::ir::{
    Annotation, Dataset, DestId, Document, EntityKind, EntityRef, Geometry, Image, MapAnnotation,
    Pixels, Project, Roi, Shape, SourceId, TagAnnotation,
};
use omero_transfer::service::{
    AnnotationLink, RemoteAnnotationKind, SnapshotAnnotation, SnapshotContainer, SnapshotImage,
    SnapshotServer,
};
use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;
use proptest::test_runner::{Config as ProptestConfig, FileFailurePersistence};

pub fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);

    let mut config = ProptestConfig::with_failure_persistence(FileFailurePersistence::WithSource(
        "proptest-regressions",
    ));
    config.cases = cases;
    config.max_shrink_iters = 1024;
    config
}

/// Coordinates on a quarter-pixel grid, so they survive a JSON round-trip
/// bit for bit.
fn coord() -> impl Strategy<Value = f64> {
    (0i32..40_000).prop_map(|v| f64::from(v) / 4.0)
}

pub fn arb_geometry() -> BoxedStrategy<Geometry> {
    prop_oneof![
        (coord(), coord()).prop_map(|(x, y)| Geometry::Point { x, y }),
        (coord(), coord(), coord(), coord())
            .prop_map(|(x1, y1, x2, y2)| Geometry::Line { x1, y1, x2, y2 }),
        (coord(), coord(), coord(), coord()).prop_map(|(x, y, width, height)| {
            Geometry::Rectangle {
                x,
                y,
                width,
                height,
            }
        }),
        (coord(), coord(), coord(), coord()).prop_map(|(x, y, radius_x, radius_y)| {
            Geometry::Ellipse {
                x,
                y,
                radius_x,
                radius_y,
            }
        }),
        proptest::collection::vec((0u16..512, 0u16..512), 3..6).prop_map(|points| {
            let points: Vec<String> = points.iter().map(|(x, y)| format!("{},{}", x, y)).collect();
            Geometry::Polygon {
                points: points.join(" "),
            }
        }),
    ]
    .boxed()
}

#[derive(Clone, Debug)]
struct ImageSeed {
    name: String,
    size_c: u32,
    shapes: Vec<(Geometry, i32, String)>,
    annotation_picks: Vec<usize>,
}

fn image_seed_strategy() -> impl Strategy<Value = ImageSeed> {
    (
        "[a-z][a-z0-9_]{0,10}\\.(tif|czi|lif)",
        1u32..=4,
        proptest::collection::vec((arb_geometry(), -1i32..4, "[A-Za-z ]{0,8}"), 0..4),
        proptest::collection::vec(any::<usize>(), 0..3),
    )
        .prop_map(|(name, size_c, shapes, annotation_picks)| ImageSeed {
            name,
            size_c,
            shapes,
            annotation_picks,
        })
}

#[derive(Clone, Debug)]
enum AnnotationSeed {
    Tag(String),
    Map(Option<String>, Vec<(String, String)>),
}

fn annotation_seed_strategy() -> impl Strategy<Value = AnnotationSeed> {
    prop_oneof![
        "[A-Za-z0-9 ]{0,12}".prop_map(AnnotationSeed::Tag),
        (
            proptest::option::of("[a-z.]{1,16}"),
            proptest::collection::vec(("[a-z]{1,6}", "[A-Za-z0-9]{0,6}"), 0..4),
        )
            .prop_map(|(namespace, pairs)| AnnotationSeed::Map(namespace, pairs)),
    ]
}

/// A referentially consistent document: one project, up to `max_datasets`
/// datasets with up to `max_images` images each, and a shared pool of up to
/// `max_annotations` annotations that images pick from.
pub fn arb_document(
    max_datasets: usize,
    max_images: usize,
    max_annotations: usize,
) -> BoxedStrategy<Document> {
    assert!(max_datasets > 0, "max_datasets must be > 0");

    (
        proptest::collection::vec(
            proptest::collection::vec(image_seed_strategy(), 0..=max_images),
            1..=max_datasets,
        ),
        proptest::collection::vec(annotation_seed_strategy(), 0..=max_annotations),
    )
        .prop_map(|(datasets, annotations)| build_document(datasets, annotations))
        .boxed()
}

fn build_document(datasets: Vec<Vec<ImageSeed>>, annotations: Vec<AnnotationSeed>) -> Document {
    let mut document = Document::new();
    let mut project = Project::new(1u64, "Generated");

    for (seed, annotation) in annotations.into_iter().enumerate() {
        let id = 9000 + seed as u64;
        document.annotations.push(match annotation {
            AnnotationSeed::Tag(value) => Annotation::Tag(TagAnnotation::new(id, value)),
            AnnotationSeed::Map(namespace, pairs) => {
                Annotation::Map(MapAnnotation::new(id, namespace, pairs))
            }
        });
    }
    let pool_size = document.annotations.len();

    let mut next_image = 1000u64;
    let mut next_shape = 6000u64;
    for (d, images) in datasets.into_iter().enumerate() {
        let mut dataset = Dataset::new(100 + d as u64, format!("dataset {}", d));
        for seed in images {
            let id = next_image;
            next_image += 1;

            let pixels = Pixels::new("XYZCT", (256, 256, 1, seed.size_c, 1), "uint16");
            let mut image = Image::new(id, seed.name, pixels);

            if !seed.shapes.is_empty() {
                let mut roi = Roi::new(5000 + id);
                for (geometry, the_c, text) in seed.shapes {
                    roi = roi.with_shape(
                        Shape::new(next_shape, geometry)
                            .with_channel(the_c)
                            .with_text(text),
                    );
                    next_shape += 1;
                }
                image.roi_refs.push(roi.entity_ref());
                document.rois.push(roi);
            }

            if pool_size > 0 {
                for pick in seed.annotation_picks {
                    let target = document.annotations[pick % pool_size].entity_ref();
                    if !image.annotation_refs.contains(&target) {
                        image.annotation_refs.push(target);
                    }
                }
            }

            dataset.image_refs.push(image.entity_ref());
            document.images.push(image);
        }
        project.dataset_refs.push(dataset.entity_ref());
        document.datasets.push(dataset);
    }

    document.projects.push(project);
    document
}

type Picks = BTreeSet<usize>;

/// A source server holding project 1 with up to `max_datasets` datasets of
/// up to `max_images` images, and a pool of up to `max_tags` tags linked to
/// any of them. A dataset may also list the first image of the dataset
/// before it, so images can be reached twice.
pub fn arb_source_snapshot(
    max_datasets: usize,
    max_images: usize,
    max_tags: usize,
) -> BoxedStrategy<SnapshotServer> {
    assert!(max_tags > 0, "max_tags must be > 0");

    let picks = || proptest::collection::btree_set(0..max_tags, 0..=max_tags);
    (
        1..=max_tags,
        picks(),
        proptest::collection::vec(
            (
                picks(),
                any::<bool>(),
                proptest::collection::vec(picks(), 0..=max_images),
            ),
            1..=max_datasets,
        ),
    )
        .prop_map(|(tags, project_picks, datasets)| build_snapshot(tags, project_picks, datasets))
        .boxed()
}

fn build_snapshot(
    tags: usize,
    project_picks: Picks,
    datasets: Vec<(Picks, bool, Vec<Picks>)>,
) -> SnapshotServer {
    let mut server = SnapshotServer::new();
    let tag_ids: Vec<u64> = (0..tags as u64).map(|t| 9000 + t).collect();
    for &id in &tag_ids {
        server.annotations.push(SnapshotAnnotation {
            id,
            kind: RemoteAnnotationKind::Tag {
                text: format!("tag {}", id),
            },
            values: Vec::new(),
        });
    }
    let link = |server: &mut SnapshotServer, kind: EntityKind, id: u64, picks: &Picks| {
        let chosen: BTreeSet<u64> = picks.iter().map(|p| tag_ids[p % tags]).collect();
        for annotation in chosen {
            server.annotation_links.push(AnnotationLink {
                kind,
                id,
                annotation,
            });
        }
    };

    let mut project = SnapshotContainer {
        id: 1,
        name: "Generated".to_string(),
        description: None,
        children: Vec::new(),
    };
    link(&mut server, EntityKind::Project, 1, &project_picks);

    let mut next_image = 1000u64;
    let mut previous_first: Option<u64> = None;
    for (d, (dataset_picks, share_previous, images)) in datasets.into_iter().enumerate() {
        let id = 100 + d as u64;
        let mut dataset = SnapshotContainer {
            id,
            name: format!("dataset {}", d),
            description: None,
            children: Vec::new(),
        };
        link(&mut server, EntityKind::Dataset, id, &dataset_picks);

        let mut first = None;
        for image_picks in images {
            let image_id = next_image;
            next_image += 1;
            server.images.push(SnapshotImage {
                id: image_id,
                name: format!("{}.tif", image_id),
                description: None,
                pixels: Pixels::new("XYZCT", (64, 64, 1, 1, 1), "uint8"),
                client_paths: Vec::new(),
                server_paths: vec![format!("u_1/{}.tif", image_id)],
            });
            link(&mut server, EntityKind::Image, image_id, &image_picks);
            dataset.children.push(image_id);
            first.get_or_insert(image_id);
        }
        if let (true, Some(shared)) = (share_previous, previous_first) {
            dataset.children.push(shared);
        }
        previous_first = first;

        project.children.push(id);
        server.datasets.push(dataset);
    }

    server.projects.push(project);
    server
}

/// Source and destination file maps for the same set of imported files.
///
/// Each file backs `1..=max_series` images. Source IDs are listed in
/// descending order; destination IDs follow the matching ascending source
/// order, offset by 10000.
#[derive(Clone, Debug)]
pub struct FilePair {
    pub source: BTreeMap<PathBuf, Vec<SourceId>>,
    pub destination: BTreeMap<PathBuf, Vec<DestId>>,
}

pub fn arb_file_pair(max_files: usize, max_series: usize) -> BoxedStrategy<FilePair> {
    proptest::collection::btree_map("[a-z]{1,8}", 1..=max_series, 1..=max_files)
        .prop_map(|files| {
            let mut source = BTreeMap::new();
            let mut destination = BTreeMap::new();
            for (i, (stem, series)) in files.into_iter().enumerate() {
                let base = i as u64 * 100;
                let mut source_ids: Vec<SourceId> =
                    (0..series as u64).map(|k| SourceId(base + k)).collect();
                source_ids.reverse();
                let dest_ids = (0..series as u64)
                    .map(|k| DestId(10_000 + base + k))
                    .collect();

                source.insert(
                    PathBuf::from(format!("/repo/u_{}/{}.tif", i, stem)),
                    source_ids,
                );
                destination.insert(
                    PathBuf::from(format!("/data/in/repo/u_{}/{}.tif", i, stem)),
                    dest_ids,
                );
            }
            FilePair {
                source,
                destination,
            }
        })
        .boxed()
}

/// Every entity reference held anywhere in the document.
pub fn all_refs(document: &Document) -> Vec<EntityRef> {
    let mut refs = Vec::new();
    for project in &document.projects {
        refs.extend(&project.dataset_refs);
        refs.extend(&project.annotation_refs);
    }
    for dataset in &document.datasets {
        refs.extend(&dataset.image_refs);
        refs.extend(&dataset.annotation_refs);
    }
    for image in &document.images {
        refs.extend(&image.roi_refs);
        refs.extend(&image.annotation_refs);
    }
    for roi in &document.rois {
        refs.extend(&roi.annotation_refs);
    }
    refs
}
