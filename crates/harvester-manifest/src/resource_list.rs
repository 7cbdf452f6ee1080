//! Parsed resource list: the candidate graph for one harvester run.

use crate::model::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Everything the remote side currently exposes for one namespace.
///
/// Entities that are not newer than the watermark stay in the maps: their
/// connections may still be needed to resolve edges of newer entities.
#[derive(Debug, Clone)]
pub struct ResourceList {
    /// Local namespace the identifiers were rewritten into.
    pub local_space: String,
    pub watermark: DateTime<Utc>,
    /// `rs:md@at` of the document, if the source advertised one.
    pub resource_list_timestamp: Option<DateTime<Utc>>,
    pub projects: BTreeMap<PermId, IncomingProject>,
    pub experiments: BTreeMap<PermId, IncomingExperiment>,
    pub samples: BTreeMap<PermId, IncomingSample>,
    pub data_sets: BTreeMap<PermId, IncomingDataSet>,
    pub materials: Vec<IncomingMaterial>,
}

impl ResourceList {
    pub fn new(local_space: impl Into<String>, watermark: DateTime<Utc>) -> Self {
        Self {
            local_space: local_space.into(),
            watermark,
            resource_list_timestamp: None,
            projects: BTreeMap::new(),
            experiments: BTreeMap::new(),
            samples: BTreeMap::new(),
            data_sets: BTreeMap::new(),
            materials: Vec::new(),
        }
    }

    pub fn contains_perm_id(&self, perm_id: &str) -> bool {
        self.projects.contains_key(perm_id)
            || self.experiments.contains_key(perm_id)
            || self.samples.contains_key(perm_id)
            || self.data_sets.contains_key(perm_id)
    }

    /// Which map holds `perm_id`, if any.
    pub fn kind_of(&self, perm_id: &str) -> Option<EntityKind> {
        if self.projects.contains_key(perm_id) {
            Some(EntityKind::Project)
        } else if self.experiments.contains_key(perm_id) {
            Some(EntityKind::Experiment)
        } else if self.samples.contains_key(perm_id) {
            Some(EntityKind::Sample)
        } else if self.data_sets.contains_key(perm_id) {
            Some(EntityKind::DataSet)
        } else {
            None
        }
    }

    /// Physical data sets whose content has to be (re-)registered, keyed by code.
    ///
    /// A data set qualifies when it is newer than the watermark or its code is
    /// in `retry`; black-listed codes never qualify.
    pub fn physical_data_sets_to_register(
        &self,
        retry: &HashSet<String>,
        black_listed: &HashSet<String>,
    ) -> BTreeMap<String, IncomingDataSet> {
        self.data_sets
            .values()
            .filter(|ds| ds.entity.is_physical())
            .filter(|ds| ds.is_modified_since(self.watermark) || retry.contains(&ds.entity.code))
            .filter(|ds| !black_listed.contains(&ds.entity.code))
            .map(|ds| (ds.entity.code.clone(), ds.clone()))
            .collect()
    }

    /// Projects, experiments and samples whose attachments need a look.
    ///
    /// An entity qualifies when it is newer than the watermark or its holder key
    /// is in `retry`. Identifiers are read as they stand, so call this after
    /// experiment propagation.
    pub fn attachment_holders(&self, retry: &HashSet<String>) -> Vec<AttachmentHolder> {
        let watermark = self.watermark;
        let wanted = |kind: EntityKind, perm_id: &str, last_modified: DateTime<Utc>| {
            last_modified > watermark || retry.contains(&holder_key(kind, perm_id))
        };
        let mut holders = Vec::new();
        for p in self.projects.values() {
            if wanted(EntityKind::Project, &p.perm_id, p.last_modified) {
                holders.push(AttachmentHolder {
                    kind: EntityKind::Project,
                    perm_id: p.perm_id.clone(),
                    identifier: p.entity.identifier.clone(),
                    has_attachments: p.has_attachments,
                });
            }
        }
        for e in self.experiments.values() {
            if wanted(EntityKind::Experiment, &e.perm_id, e.last_modified) {
                holders.push(AttachmentHolder {
                    kind: EntityKind::Experiment,
                    perm_id: e.perm_id.clone(),
                    identifier: e.entity.identifier.clone(),
                    has_attachments: e.has_attachments,
                });
            }
        }
        for s in self.samples.values() {
            if wanted(EntityKind::Sample, &s.perm_id, s.last_modified) {
                holders.push(AttachmentHolder {
                    kind: EntityKind::Sample,
                    perm_id: s.perm_id.clone(),
                    identifier: s.entity.identifier.clone(),
                    has_attachments: s.has_attachments,
                });
            }
        }
        holders
    }

    pub fn summary(&self) -> ResourceListSummary {
        let watermark = self.watermark;
        let physical = self
            .data_sets
            .values()
            .filter(|ds| ds.entity.is_physical())
            .count();
        ResourceListSummary {
            local_space: self.local_space.clone(),
            watermark,
            resource_list_timestamp: self.resource_list_timestamp,
            projects: EntityCount::of(self.projects.values().map(|p| p.last_modified), watermark),
            experiments: EntityCount::of(
                self.experiments.values().map(|e| e.last_modified),
                watermark,
            ),
            samples: EntityCount::of(self.samples.values().map(|s| s.last_modified), watermark),
            data_sets: EntityCount::of(
                self.data_sets.values().map(|d| d.last_modified),
                watermark,
            ),
            physical_data_sets: physical,
            container_data_sets: self.data_sets.len() - physical,
            materials: EntityCount::of(self.materials.iter().map(|m| m.last_modified), watermark),
            connections: self.connection_count(),
        }
    }

    fn connection_count(&self) -> usize {
        self.projects.values().map(|e| e.connections.len()).sum::<usize>()
            + self.experiments.values().map(|e| e.connections.len()).sum::<usize>()
            + self.samples.values().map(|e| e.connections.len()).sum::<usize>()
            + self.data_sets.values().map(|e| e.connections.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityCount {
    pub total: usize,
    /// Strictly newer than the watermark.
    pub modified: usize,
}

impl EntityCount {
    fn of(timestamps: impl Iterator<Item = DateTime<Utc>>, watermark: DateTime<Utc>) -> Self {
        let mut count = EntityCount {
            total: 0,
            modified: 0,
        };
        for ts in timestamps {
            count.total += 1;
            if ts > watermark {
                count.modified += 1;
            }
        }
        count
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceListSummary {
    pub local_space: String,
    pub watermark: DateTime<Utc>,
    pub resource_list_timestamp: Option<DateTime<Utc>>,
    pub projects: EntityCount,
    pub experiments: EntityCount,
    pub samples: EntityCount,
    pub data_sets: EntityCount,
    pub physical_data_sets: usize,
    pub container_data_sets: usize,
    pub materials: EntityCount,
    pub connections: usize,
}
