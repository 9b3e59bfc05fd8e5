//! Graph rehydration: replay a metadata document against the destination.
//!
//! Entities are handled in dependency order: projects, datasets, images,
//! annotations, ROIs, and finally the link edges between them. Every entity
//! moves through `NotCreated -> Created -> Linked`. The [`RehydrationCache`]
//! records the destination handle of each created entity and every link
//! edge already issued, so a shared reference (or a re-run with the same
//! cache) never creates or links anything twice.
//!
//! A rejected call is fatal. Nothing already created is rolled back; keep
//! the cache and run again to resume.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::correlate::ImageMap;
use crate::error::MigrateError;
use crate::ir::{DestId, DestRef, Document, EntityKind, EntityRef, SourceId};
use crate::service::{DestinationService, ServiceError};

/// How document images obtain their destination identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageResolution {
    /// Look the image up in the correlation map. Unmapped images are
    /// skipped together with their ROIs and links.
    #[default]
    Correlated,
    /// Create a metadata-only image for every document image.
    CreateNew,
}

#[derive(Clone, Debug, Default)]
pub struct RehydrateOptions {
    pub images: ImageResolution,
}

/// Lifecycle of one document entity during rehydration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    NotCreated,
    Created,
    Linked,
}

/// A parent-child link or an annotation attachment, by source identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkEdge {
    pub parent: EntityRef,
    pub child: EntityRef,
}

/// Per-run record of what already exists at the destination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RehydrationCache {
    #[serde(default)]
    created: BTreeMap<EntityRef, DestId>,

    #[serde(default)]
    edges: BTreeSet<LinkEdge>,

    /// Entities whose outgoing references are all re-pointed.
    #[serde(default)]
    linked: BTreeSet<EntityRef>,
}

impl RehydrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, entity: EntityRef) -> EntityState {
        if self.linked.contains(&entity) {
            EntityState::Linked
        } else if self.created.contains_key(&entity) {
            EntityState::Created
        } else {
            EntityState::NotCreated
        }
    }

    /// Destination handle of a created entity.
    pub fn resolve(&self, entity: EntityRef) -> Option<DestId> {
        self.created.get(&entity).copied()
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn read(path: &Path) -> Result<Self, MigrateError> {
        let file = File::open(path).map_err(MigrateError::Io)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| MigrateError::Artifact {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), MigrateError> {
        let file = File::create(path).map_err(MigrateError::Io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| {
            MigrateError::Artifact {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })
    }
}

/// Counts for one rehydration pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RehydrationSummary {
    /// Entities created by this pass.
    pub created: usize,
    /// Images resolved through the correlation map.
    pub resolved_images: usize,
    /// Link and annotation calls issued by this pass.
    pub linked: usize,
    /// Images with no destination identity, left out of the graph.
    pub skipped_images: Vec<SourceId>,
}

/// Replays documents against one destination.
pub struct Rehydrator<'a, D: DestinationService + ?Sized> {
    destination: &'a mut D,
    image_map: &'a ImageMap,
    options: RehydrateOptions,
    cache: RehydrationCache,
    summary: RehydrationSummary,
}

impl<'a, D: DestinationService + ?Sized> Rehydrator<'a, D> {
    pub fn new(destination: &'a mut D, image_map: &'a ImageMap, options: RehydrateOptions) -> Self {
        Self {
            destination,
            image_map,
            options,
            cache: RehydrationCache::new(),
            summary: RehydrationSummary::default(),
        }
    }

    /// Resumes from the cache of an earlier, possibly failed, run.
    pub fn with_cache(mut self, cache: RehydrationCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &RehydrationCache {
        &self.cache
    }

    pub fn into_cache(self) -> RehydrationCache {
        self.cache
    }

    /// Recreates every entity of `document` and relinks them.
    pub fn rehydrate(&mut self, document: &Document) -> Result<RehydrationSummary, MigrateError> {
        self.summary = RehydrationSummary::default();
        info!(
            "Rehydrating {} entities ({:?} images)",
            document.entity_count(),
            self.options.images
        );

        for project in &document.projects {
            let target = project.entity_ref();
            self.create(target, |dest| dest.create_project(project))?;
        }
        for dataset in &document.datasets {
            let target = dataset.entity_ref();
            self.create(target, |dest| dest.create_dataset(dataset))?;
        }
        for image in &document.images {
            let target = image.entity_ref();
            match self.options.images {
                ImageResolution::CreateNew => {
                    self.create(target, |dest| dest.create_image(image))?;
                }
                ImageResolution::Correlated => self.resolve_image(target),
            }
        }

        let roi_parents = roi_parents(document, &self.cache);
        let wanted = referenced_annotations(document, &self.cache, &roi_parents);
        for annotation in &document.annotations {
            let target = annotation.entity_ref();
            if !wanted.contains(&target) {
                debug!("{} is only attached to skipped entities", target);
                continue;
            }
            self.create(target, |dest| dest.create_annotation(annotation))?;
        }

        for roi in &document.rois {
            let target = roi.entity_ref();
            let Some(image) = roi_parents.get(&target).copied() else {
                debug!("{} has no migrated parent image", target);
                continue;
            };
            self.create(target, |dest| dest.create_roi(roi, image))?;
        }

        for project in &document.projects {
            let parent = project.entity_ref();
            self.link_all(parent, &project.dataset_refs, &project.annotation_refs)?;
        }
        for dataset in &document.datasets {
            let parent = dataset.entity_ref();
            self.link_all(parent, &dataset.image_refs, &dataset.annotation_refs)?;
        }
        for image in &document.images {
            self.link_all(image.entity_ref(), &[], &image.annotation_refs)?;
        }
        for roi in &document.rois {
            self.link_all(roi.entity_ref(), &[], &roi.annotation_refs)?;
        }

        info!(
            "Rehydration finished: {} created, {} image(s) resolved, {} link(s), {} image(s) skipped",
            self.summary.created,
            self.summary.resolved_images,
            self.summary.linked,
            self.summary.skipped_images.len()
        );
        Ok(self.summary.clone())
    }

    fn create<F>(&mut self, target: EntityRef, call: F) -> Result<DestId, MigrateError>
    where
        F: FnOnce(&mut D) -> Result<DestId, ServiceError>,
    {
        if let Some(existing) = self.cache.resolve(target) {
            debug!("{} already exists as {}", target, existing);
            return Ok(existing);
        }
        let id = call(&mut *self.destination).map_err(|e| match e {
            ServiceError::Connection(message) => MigrateError::Connection {
                service: "destination",
                message,
            },
            other => MigrateError::Creation {
                target,
                message: other.to_string(),
            },
        })?;
        debug!("Created {} as {}", target, id);
        self.cache.created.insert(target, id);
        self.summary.created += 1;
        Ok(id)
    }

    fn resolve_image(&mut self, target: EntityRef) {
        if self.cache.resolve(target).is_some() {
            return;
        }
        match self.image_map.get(target.id) {
            Some(id) => {
                debug!("{} resolves to imported image {}", target, id);
                self.cache.created.insert(target, id);
                self.summary.resolved_images += 1;
            }
            None => {
                warn!(
                    "{} has no imported counterpart; skipping it with its ROIs and links",
                    target
                );
                self.summary.skipped_images.push(target.id);
            }
        }
    }

    /// Issues every outgoing edge of `parent`, then marks it linked.
    fn link_all(
        &mut self,
        parent: EntityRef,
        children: &[EntityRef],
        annotations: &[EntityRef],
    ) -> Result<(), MigrateError> {
        if self.cache.state(parent) == EntityState::Linked {
            return Ok(());
        }
        let Some(parent_id) = self.cache.resolve(parent) else {
            return Ok(());
        };
        let parent_handle = DestRef::new(parent.kind, parent_id);

        for &child in children.iter().chain(annotations) {
            let edge = LinkEdge { parent, child };
            if self.cache.edges.contains(&edge) {
                continue;
            }
            let Some(child_id) = self.cache.resolve(child) else {
                if child.kind == EntityKind::Image && self.summary.skipped_images.contains(&child.id)
                {
                    continue;
                }
                return Err(MigrateError::Link {
                    parent,
                    child,
                    message: "child was never created".to_string(),
                });
            };

            let result = if child.kind == EntityKind::Annotation {
                self.destination.annotate(parent_handle, child_id)
            } else {
                self.destination
                    .link(parent_handle, DestRef::new(child.kind, child_id))
            };
            result.map_err(|e| match e {
                ServiceError::Connection(message) => MigrateError::Connection {
                    service: "destination",
                    message,
                },
                other => MigrateError::Link {
                    parent,
                    child,
                    message: other.to_string(),
                },
            })?;
            debug!("Linked {} -> {}", parent, child);
            self.cache.edges.insert(edge);
            self.summary.linked += 1;
        }

        self.cache.linked.insert(parent);
        Ok(())
    }
}

/// Rehydrates `document` with a fresh cache, returning the cache for reuse.
pub fn rehydrate<D>(
    document: &Document,
    image_map: &ImageMap,
    destination: &mut D,
    options: RehydrateOptions,
) -> Result<(RehydrationSummary, RehydrationCache), MigrateError>
where
    D: DestinationService + ?Sized,
{
    let mut rehydrator = Rehydrator::new(destination, image_map, options);
    let summary = rehydrator.rehydrate(document)?;
    Ok((summary, rehydrator.into_cache()))
}

/// Each ROI's destination parent: the first migrated image that lists it.
fn roi_parents(document: &Document, cache: &RehydrationCache) -> BTreeMap<EntityRef, DestId> {
    let mut parents = BTreeMap::new();
    for image in &document.images {
        let Some(image_id) = cache.resolve(image.entity_ref()) else {
            continue;
        };
        for roi in &image.roi_refs {
            if let Some(first) = parents.get(roi) {
                if *first != image_id {
                    warn!(
                        "{} belongs to several images; keeping it on {}",
                        roi, first
                    );
                }
                continue;
            }
            parents.insert(*roi, image_id);
        }
    }
    parents
}

/// Annotations attached to at least one entity that will exist.
fn referenced_annotations(
    document: &Document,
    cache: &RehydrationCache,
    roi_parents: &BTreeMap<EntityRef, DestId>,
) -> BTreeSet<EntityRef> {
    let mut wanted = BTreeSet::new();
    let containers = document
        .projects
        .iter()
        .map(|p| &p.annotation_refs)
        .chain(document.datasets.iter().map(|d| &d.annotation_refs));
    for refs in containers {
        wanted.extend(refs.iter().copied());
    }
    for image in &document.images {
        if cache.resolve(image.entity_ref()).is_some() {
            wanted.extend(image.annotation_refs.iter().copied());
        }
    }
    for roi in &document.rois {
        if roi_parents.contains_key(&roi.entity_ref()) {
            wanted.extend(roi.annotation_refs.iter().copied());
        }
    }
    wanted
}
