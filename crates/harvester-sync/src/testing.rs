//! In-memory collaborators for tests.
//!
//! [`InMemoryEntityService`] applies batches atomically with optimistic
//! version checks, like the real destination does. [`InMemoryFileService`]
//! serves byte payloads and attachments, and can be told to fail or lie
//! about lengths.
//! [`ManifestBuilder`] writes resource-list XML the parser accepts.

use crate::error::ServiceError;
use crate::graph::{GraphEdge, GraphNode, SpaceListing};
use crate::service::{
    Attachment, AttachmentChanges, DataSetFile, EntityService, LocalDataSet, LocalEntity,
    ManifestSource, OperationBatch, OperationResult, RemoteFileService, SessionToken,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use harvester_manifest::{ConnectionKind, DataSetKind, EntityKind, Properties};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::io::{AsyncWrite, AsyncWriteExt};

// ============================================================================
// Entity service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSample {
    pub entity: LocalEntity,
    pub properties: Properties,
    pub experiment_identifier: Option<String>,
    pub container_identifier: Option<String>,
    pub parent_identifiers: Vec<String>,
}

/// One attachment as the destination keeps it: latest version only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub attachment: Attachment,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct EntityState {
    spaces: BTreeSet<String>,
    /// holder identifier → file name → attachment
    attachments: BTreeMap<String, BTreeMap<String, StoredAttachment>>,
    projects: BTreeMap<String, (LocalEntity, Option<String>)>,
    experiments: BTreeMap<String, (LocalEntity, Properties)>,
    samples: BTreeMap<String, StoredSample>,
    materials: BTreeMap<(String, String), (LocalEntity, Properties)>,
    data_sets: BTreeMap<String, LocalDataSet>,
}

impl EntityState {
    fn apply(&mut self, batch: &OperationBatch) -> Result<OperationResult, String> {
        for space in &batch.space_registrations {
            if !self.spaces.insert(space.code.clone()) {
                return Err(format!("space {} already exists", space.code));
            }
        }

        for p in &batch.project_registrations {
            if self.projects.contains_key(&p.identifier) {
                return Err(format!("project {} already exists", p.identifier));
            }
            self.check_space(&p.space, &p.identifier)?;
            self.projects.insert(
                p.identifier.clone(),
                (local(EntityKind::Project, &p.perm_id, &p.identifier), p.description.clone()),
            );
        }
        for u in &batch.project_updates {
            let (entity, description) = self
                .projects
                .get_mut(&u.identifier)
                .ok_or_else(|| format!("project {} not found", u.identifier))?;
            bump(entity, u.version)?;
            *description = u.description.clone();
        }

        for e in &batch.experiment_registrations {
            if self.experiments.contains_key(&e.identifier) {
                return Err(format!("experiment {} already exists", e.identifier));
            }
            if !self.projects.contains_key(e.project_identifier()) {
                return Err(format!("project {} of experiment {} not found", e.project_identifier(), e.identifier));
            }
            self.experiments.insert(
                e.identifier.clone(),
                (local(EntityKind::Experiment, &e.perm_id, &e.identifier), e.properties.clone()),
            );
        }
        for u in &batch.experiment_updates {
            let current = self
                .experiments
                .iter()
                .find(|(_, (entity, _))| entity.perm_id == u.perm_id)
                .map(|(identifier, _)| identifier.clone())
                .ok_or_else(|| format!("experiment {} not found", u.perm_id))?;
            let (mut entity, _) = self
                .experiments
                .remove(&current)
                .ok_or_else(|| format!("experiment {current} not found"))?;
            bump(&mut entity, u.version)?;
            entity.identifier = u.identifier.clone();
            self.experiments.insert(u.identifier.clone(), (entity, u.properties.clone()));
        }

        for s in &batch.sample_registrations {
            if self.samples.contains_key(&s.identifier) {
                return Err(format!("sample {} already exists", s.identifier));
            }
            self.check_space(first_segment(&s.identifier), &s.identifier)?;
            self.samples.insert(
                s.identifier.clone(),
                StoredSample {
                    entity: local(EntityKind::Sample, &s.perm_id, &s.identifier),
                    properties: s.properties.clone(),
                    experiment_identifier: s.experiment_identifier.clone(),
                    container_identifier: s.container_identifier.clone(),
                    parent_identifiers: s.parent_identifiers.clone().unwrap_or_default(),
                },
            );
        }
        for u in &batch.sample_updates {
            let sample = self
                .samples
                .get_mut(&u.identifier)
                .ok_or_else(|| format!("sample {} not found", u.identifier))?;
            bump(&mut sample.entity, u.version)?;
            sample.properties = u.properties.clone();
            sample.experiment_identifier = u.experiment_identifier.clone();
            sample.container_identifier = u.container_identifier.clone();
            if let Some(parents) = &u.parent_identifiers {
                sample.parent_identifiers = parents.clone();
            }
        }

        for m in &batch.material_registrations {
            let key = (m.code.clone(), m.material_type.clone());
            if self.materials.contains_key(&key) {
                return Err(format!("material {} already exists", m.identifier()));
            }
            self.materials.insert(
                key,
                (local(EntityKind::Material, &m.code, &m.identifier()), m.properties.clone()),
            );
        }
        for u in &batch.material_updates {
            let (entity, properties) = self
                .materials
                .get_mut(&(u.code.clone(), u.material_type.clone()))
                .ok_or_else(|| format!("material {} not found", u.code))?;
            bump(entity, u.version)?;
            *properties = u.properties.clone();
        }

        for d in &batch.data_set_registrations {
            if self.data_sets.contains_key(&d.code) {
                return Err(format!("data set {} already exists", d.code));
            }
            self.check_owners(&d.code, d.sample_identifier.as_deref(), d.experiment_identifier.as_deref())?;
            let contained_codes = match &d.kind {
                DataSetKind::Container { contained_codes } => contained_codes.clone(),
                DataSetKind::Physical => Vec::new(),
            };
            self.data_sets.insert(
                d.code.clone(),
                LocalDataSet {
                    code: d.code.clone(),
                    data_set_type: d.data_set_type.clone(),
                    version: 1,
                    is_container: d.is_container(),
                    properties: d.properties.clone(),
                    sample_identifier: d.sample_identifier.clone(),
                    experiment_identifier: d.experiment_identifier.clone(),
                    parent_codes: d.parent_codes.clone(),
                    contained_codes,
                },
            );
        }
        for u in &batch.data_set_updates {
            self.check_owners(&u.code, u.sample_identifier.as_deref(), u.experiment_identifier.as_deref())?;
            let ds = self
                .data_sets
                .get_mut(&u.code)
                .ok_or_else(|| format!("data set {} not found", u.code))?;
            if ds.version != u.version {
                return Err(format!(
                    "data set {} was modified concurrently (version {} expected {})",
                    u.code, ds.version, u.version
                ));
            }
            ds.version += 1;
            ds.properties = u.properties.clone();
            ds.sample_identifier = u.sample_identifier.clone();
            ds.experiment_identifier = u.experiment_identifier.clone();
            ds.parent_codes = u.modified_parent_codes.clone();
            if let Some(contained) = &u.modified_contained_codes {
                ds.contained_codes = contained.clone();
            }
        }

        // Data set edges may point at siblings registered in the same batch.
        for ds in self.data_sets.values() {
            for code in ds.parent_codes.iter().chain(ds.contained_codes.iter()) {
                if !self.data_sets.contains_key(code) {
                    return Err(format!("data set {} references unknown data set {code}", ds.code));
                }
            }
        }

        Ok(OperationResult {
            registered: batch.registration_count(),
            updated: batch.update_count(),
        })
    }

    fn has_holder(&self, kind: EntityKind, identifier: &str) -> bool {
        match kind {
            EntityKind::Project => self.projects.contains_key(identifier),
            EntityKind::Experiment => self.experiments.contains_key(identifier),
            EntityKind::Sample => self.samples.contains_key(identifier),
            EntityKind::DataSet | EntityKind::Material => false,
        }
    }

    fn apply_attachments(
        &mut self,
        kind: EntityKind,
        identifier: &str,
        changes: AttachmentChanges,
    ) -> Result<(), String> {
        if !self.has_holder(kind, identifier) {
            return Err(format!("{kind} {identifier} not found"));
        }
        let stored = self.attachments.entry(identifier.to_string()).or_default();
        for name in &changes.deleted {
            if stored.remove(name).is_none() {
                return Err(format!("attachment {name} of {identifier} not found"));
            }
        }
        for new in changes.added {
            if stored.contains_key(&new.file_name) {
                return Err(format!("attachment {} of {identifier} already exists", new.file_name));
            }
            stored.insert(new.file_name.clone(), stored_attachment(new, 1));
        }
        for new in changes.updated {
            let version = stored
                .get(&new.file_name)
                .map(|a| a.attachment.version + 1)
                .ok_or_else(|| format!("attachment {} of {identifier} not found", new.file_name))?;
            stored.insert(new.file_name.clone(), stored_attachment(new, version));
        }
        Ok(())
    }

    fn check_space(&self, space: &str, identifier: &str) -> Result<(), String> {
        if self.spaces.contains(space) {
            Ok(())
        } else {
            Err(format!("space {space} of {identifier} not found"))
        }
    }

    fn check_owners(&self, code: &str, sample: Option<&str>, experiment: Option<&str>) -> Result<(), String> {
        if let Some(sample) = sample {
            if !self.samples.contains_key(sample) {
                return Err(format!("sample {sample} of data set {code} not found"));
            }
        }
        if let Some(experiment) = experiment {
            if !self.experiments.contains_key(experiment) {
                return Err(format!("experiment {experiment} of data set {code} not found"));
            }
        }
        Ok(())
    }

    fn listing(&self, space: &str) -> Option<SpaceListing> {
        if !self.spaces.contains(space) {
            return None;
        }
        let prefix = format!("/{space}/");
        let mut listing = SpaceListing {
            space: space.to_string(),
            ..SpaceListing::default()
        };
        let push_node = |listing: &mut SpaceListing, entity: &LocalEntity, code: &str| {
            listing.nodes.push(GraphNode {
                identifier: entity.identifier.clone(),
                perm_id: entity.perm_id.clone(),
                code: code.to_string(),
                kind: entity.kind,
            });
        };
        let edge = |from: &str, to: &str, kind: ConnectionKind| GraphEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        };

        for (identifier, (entity, _)) in self.projects.range(prefix.clone()..) {
            if !identifier.starts_with(&prefix) {
                break;
            }
            push_node(&mut listing, entity, last_segment(identifier));
        }
        for (identifier, (entity, _)) in &self.experiments {
            if !identifier.starts_with(&prefix) {
                continue;
            }
            push_node(&mut listing, entity, last_segment(identifier));
            if let Some((project, _)) = identifier.rsplit_once('/') {
                listing.edges.push(edge(project, identifier, ConnectionKind::Connection));
            }
        }
        let mut space_samples = HashSet::new();
        for (identifier, sample) in &self.samples {
            if !identifier.starts_with(&prefix) {
                continue;
            }
            space_samples.insert(identifier.as_str());
            push_node(&mut listing, &sample.entity, last_segment(identifier));
            if let Some(experiment) = &sample.experiment_identifier {
                listing.edges.push(edge(experiment, identifier, ConnectionKind::Connection));
            }
            for parent in &sample.parent_identifiers {
                listing.edges.push(edge(parent, identifier, ConnectionKind::Child));
            }
            if let Some(container) = &sample.container_identifier {
                listing.edges.push(edge(container, identifier, ConnectionKind::Component));
            }
        }
        for ds in self.data_sets.values() {
            let in_space = ds.sample_identifier.as_deref().is_some_and(|s| space_samples.contains(s))
                || ds.experiment_identifier.as_deref().is_some_and(|e| e.starts_with(&prefix));
            if !in_space {
                continue;
            }
            listing.nodes.push(GraphNode {
                identifier: ds.code.clone(),
                perm_id: ds.code.clone(),
                code: ds.code.clone(),
                kind: EntityKind::DataSet,
            });
            for parent in &ds.parent_codes {
                listing.edges.push(edge(parent, &ds.code, ConnectionKind::Child));
            }
            for contained in &ds.contained_codes {
                listing.edges.push(edge(&ds.code, contained, ConnectionKind::Component));
            }
        }
        Some(listing)
    }
}

fn local(kind: EntityKind, perm_id: &str, identifier: &str) -> LocalEntity {
    LocalEntity {
        kind,
        perm_id: perm_id.to_string(),
        identifier: identifier.to_string(),
        version: 1,
    }
}

fn bump(entity: &mut LocalEntity, expected: i64) -> Result<(), String> {
    if entity.version != expected {
        return Err(format!(
            "{} {} was modified concurrently (version {} expected {expected})",
            entity.kind, entity.identifier, entity.version
        ));
    }
    entity.version += 1;
    Ok(())
}

fn stored_attachment(new: crate::service::NewAttachment, version: i32) -> StoredAttachment {
    StoredAttachment {
        attachment: Attachment {
            file_name: new.file_name,
            version,
            registration_date: Utc::now(),
            title: new.title,
            description: new.description,
        },
        content: new.content,
    }
}

fn last_segment(identifier: &str) -> &str {
    identifier.rsplit('/').next().unwrap_or(identifier)
}

/// `DST` of `/DST/S1`.
fn first_segment(identifier: &str) -> &str {
    identifier.trim_start_matches('/').split('/').next().unwrap_or(identifier)
}

/// Destination double. Batches are all-or-nothing.
#[derive(Default)]
pub struct InMemoryEntityService {
    state: Mutex<EntityState>,
    batches: Mutex<Vec<OperationBatch>>,
    fail_next: Mutex<usize>,
    logins: Mutex<usize>,
}

impl InMemoryEntityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_space(self, space: &str) -> Self {
        self.state.lock().spaces.insert(space.to_string());
        self
    }

    /// Apply `batch` directly, bypassing recording and failure injection.
    pub fn seed(&self, batch: &OperationBatch) {
        let mut state = self.state.lock();
        let mut next = state.clone();
        match next.apply(batch) {
            Ok(_) => *state = next,
            Err(message) => panic!("invalid seed batch: {message}"),
        }
    }

    /// The next `n` batch submissions fail without touching state.
    pub fn fail_next_batches(&self, n: usize) {
        *self.fail_next.lock() = n;
    }

    /// Successfully applied batches, in submission order.
    pub fn batches(&self) -> Vec<OperationBatch> {
        self.batches.lock().clone()
    }

    pub fn login_count(&self) -> usize {
        *self.logins.lock()
    }

    pub fn data_set(&self, code: &str) -> Option<LocalDataSet> {
        self.state.lock().data_sets.get(code).cloned()
    }

    pub fn sample(&self, identifier: &str) -> Option<StoredSample> {
        self.state.lock().samples.get(identifier).cloned()
    }

    pub fn has_space(&self, code: &str) -> bool {
        self.state.lock().spaces.contains(code)
    }

    pub fn has_project(&self, identifier: &str) -> bool {
        self.state.lock().projects.contains_key(identifier)
    }

    pub fn has_experiment(&self, identifier: &str) -> bool {
        self.state.lock().experiments.contains_key(identifier)
    }

    pub fn has_material(&self, code: &str, material_type: &str) -> bool {
        self.state
            .lock()
            .materials
            .contains_key(&(code.to_string(), material_type.to_string()))
    }

    pub fn data_set_codes(&self) -> Vec<String> {
        self.state.lock().data_sets.keys().cloned().collect()
    }

    pub fn attachment(&self, identifier: &str, file_name: &str) -> Option<StoredAttachment> {
        self.state
            .lock()
            .attachments
            .get(identifier)
            .and_then(|stored| stored.get(file_name))
            .cloned()
    }

    pub fn attachment_names(&self, identifier: &str) -> Vec<String> {
        self.state
            .lock()
            .attachments
            .get(identifier)
            .map(|stored| stored.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EntityService for InMemoryEntityService {
    async fn login(&self) -> Result<SessionToken, ServiceError> {
        let mut logins = self.logins.lock();
        *logins += 1;
        Ok(format!("session-{}", *logins))
    }

    async fn list_space(&self, _session: &str, space: &str) -> Result<Option<SpaceListing>, ServiceError> {
        Ok(self.state.lock().listing(space))
    }

    async fn try_get_project(&self, _session: &str, identifier: &str) -> Result<Option<LocalEntity>, ServiceError> {
        Ok(self.state.lock().projects.get(identifier).map(|(e, _)| e.clone()))
    }

    async fn try_get_experiment(&self, _session: &str, identifier: &str) -> Result<Option<LocalEntity>, ServiceError> {
        Ok(self.state.lock().experiments.get(identifier).map(|(e, _)| e.clone()))
    }

    async fn try_get_experiment_by_perm_id(
        &self,
        _session: &str,
        perm_id: &str,
    ) -> Result<Option<LocalEntity>, ServiceError> {
        Ok(self
            .state
            .lock()
            .experiments
            .values()
            .find(|(e, _)| e.perm_id == perm_id)
            .map(|(e, _)| e.clone()))
    }

    async fn try_get_sample(&self, _session: &str, identifier: &str) -> Result<Option<LocalEntity>, ServiceError> {
        Ok(self.state.lock().samples.get(identifier).map(|s| s.entity.clone()))
    }

    async fn try_get_material(
        &self,
        _session: &str,
        code: &str,
        material_type: &str,
    ) -> Result<Option<LocalEntity>, ServiceError> {
        Ok(self
            .state
            .lock()
            .materials
            .get(&(code.to_string(), material_type.to_string()))
            .map(|(e, _)| e.clone()))
    }

    async fn try_get_data_set(&self, _session: &str, code: &str) -> Result<Option<LocalDataSet>, ServiceError> {
        Ok(self.state.lock().data_sets.get(code).cloned())
    }

    async fn perform_entity_operations(
        &self,
        _session: &str,
        batch: OperationBatch,
    ) -> Result<OperationResult, ServiceError> {
        {
            let mut fail_next = self.fail_next.lock();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(ServiceError::Remote {
                    method: "performEntityOperations".to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }
        let mut state = self.state.lock();
        let mut next = state.clone();
        let result = next.apply(&batch).map_err(|message| ServiceError::Remote {
            method: "performEntityOperations".to_string(),
            message,
        })?;
        *state = next;
        drop(state);
        self.batches.lock().push(batch);
        Ok(result)
    }

    async fn list_attachments(
        &self,
        _session: &str,
        kind: EntityKind,
        identifier: &str,
    ) -> Result<Vec<Attachment>, ServiceError> {
        let state = self.state.lock();
        if !state.has_holder(kind, identifier) {
            return Err(ServiceError::Remote {
                method: "listAttachments".to_string(),
                message: format!("{kind} {identifier} not found"),
            });
        }
        Ok(state
            .attachments
            .get(identifier)
            .map(|stored| stored.values().map(|a| a.attachment.clone()).collect())
            .unwrap_or_default())
    }

    async fn update_attachments(
        &self,
        _session: &str,
        kind: EntityKind,
        identifier: &str,
        changes: AttachmentChanges,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        next.apply_attachments(kind, identifier, changes)
            .map_err(|message| ServiceError::Remote {
                method: "updateAttachments".to_string(),
                message,
            })?;
        *state = next;
        Ok(())
    }
}

// ============================================================================
// File service
// ============================================================================

#[derive(Debug, Clone)]
struct StoredFile {
    listing: DataSetFile,
    content: Bytes,
}

/// Source data store double. Attachments are keyed by holder permId.
#[derive(Default)]
pub struct InMemoryFileService {
    data_sets: Mutex<BTreeMap<String, Vec<StoredFile>>>,
    attachments: Mutex<BTreeMap<String, BTreeMap<String, (Attachment, Bytes)>>>,
    failing: Mutex<HashSet<String>>,
    downloads: Mutex<Vec<String>>,
}

impl InMemoryFileService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `files`: `(relative path, content)`; directories are implied.
    pub fn with_data_set(self, code: &str, files: &[(&str, &[u8])]) -> Self {
        let stored = files
            .iter()
            .map(|(path, content)| StoredFile {
                listing: DataSetFile {
                    path: (*path).to_string(),
                    is_directory: false,
                    length: content.len() as u64,
                },
                content: Bytes::copy_from_slice(content),
            })
            .collect();
        self.data_sets.lock().insert(code.to_string(), stored);
        self
    }

    pub fn with_directory(self, code: &str, path: &str) -> Self {
        self.data_sets
            .lock()
            .entry(code.to_string())
            .or_default()
            .insert(
                0,
                StoredFile {
                    listing: DataSetFile {
                        path: path.to_string(),
                        is_directory: true,
                        length: 0,
                    },
                    content: Bytes::new(),
                },
            );
        self
    }

    pub fn with_attachment(
        self,
        perm_id: &str,
        file_name: &str,
        registered: DateTime<Utc>,
        content: &[u8],
    ) -> Self {
        self.put_attachment(perm_id, file_name, registered, content);
        self
    }

    /// Adds `file_name` or stores a new version of it.
    pub fn put_attachment(
        &self,
        perm_id: &str,
        file_name: &str,
        registered: DateTime<Utc>,
        content: &[u8],
    ) {
        let mut attachments = self.attachments.lock();
        let holder = attachments.entry(perm_id.to_string()).or_default();
        let version = holder.get(file_name).map_or(1, |(a, _)| a.version + 1);
        holder.insert(
            file_name.to_string(),
            (
                Attachment {
                    file_name: file_name.to_string(),
                    version,
                    registration_date: registered,
                    title: None,
                    description: None,
                },
                Bytes::copy_from_slice(content),
            ),
        );
    }

    pub fn remove_attachment(&self, perm_id: &str, file_name: &str) {
        if let Some(holder) = self.attachments.lock().get_mut(perm_id) {
            holder.remove(file_name);
        }
    }

    /// Every download of `code` (data set code or holder permId) fails.
    pub fn fail_downloads_for(&self, code: &str) {
        self.failing.lock().insert(code.to_string());
    }

    pub fn heal(&self, code: &str) {
        self.failing.lock().remove(code);
    }

    /// Advertise one byte more than is actually served for every file of `code`.
    pub fn misreport_length(&self, code: &str) {
        if let Some(files) = self.data_sets.lock().get_mut(code) {
            for file in files.iter_mut().filter(|f| !f.listing.is_directory) {
                file.listing.length += 1;
            }
        }
    }

    /// `code/path` of every completed download, `permId/file@version` for
    /// attachments.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }
}

#[async_trait]
impl RemoteFileService for InMemoryFileService {
    async fn login(&self) -> Result<SessionToken, ServiceError> {
        Ok("remote-session".to_string())
    }

    async fn search_files(&self, _session: &str, code: &str) -> Result<Vec<DataSetFile>, ServiceError> {
        Ok(self
            .data_sets
            .lock()
            .get(code)
            .map(|files| files.iter().map(|f| f.listing.clone()).collect())
            .unwrap_or_default())
    }

    async fn download_file(
        &self,
        _session: &str,
        code: &str,
        file: &DataSetFile,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ServiceError> {
        if self.failing.lock().contains(code) {
            return Err(ServiceError::Transport(format!("connection reset while reading {code}/{}", file.path)));
        }
        let content = self
            .data_sets
            .lock()
            .get(code)
            .and_then(|files| files.iter().find(|f| f.listing.path == file.path))
            .map(|f| f.content.clone())
            .ok_or_else(|| ServiceError::Status {
                status: 404,
                url: format!("{code}/{}", file.path),
            })?;
        sink.write_all(&content).await?;
        sink.flush().await?;
        self.downloads.lock().push(format!("{code}/{}", file.path));
        Ok(content.len() as u64)
    }

    async fn list_attachments(
        &self,
        _session: &str,
        _kind: EntityKind,
        perm_id: &str,
    ) -> Result<Vec<Attachment>, ServiceError> {
        Ok(self
            .attachments
            .lock()
            .get(perm_id)
            .map(|holder| holder.values().map(|(a, _)| a.clone()).collect())
            .unwrap_or_default())
    }

    async fn download_attachment(
        &self,
        _session: &str,
        _kind: EntityKind,
        perm_id: &str,
        attachment: &Attachment,
    ) -> Result<Bytes, ServiceError> {
        if self.failing.lock().contains(perm_id) {
            return Err(ServiceError::Transport(format!(
                "connection reset while reading {perm_id}/{}",
                attachment.file_name
            )));
        }
        let content = self
            .attachments
            .lock()
            .get(perm_id)
            .and_then(|holder| holder.get(&attachment.file_name))
            .filter(|(a, _)| a.version == attachment.version)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| ServiceError::Status {
                status: 404,
                url: format!("{perm_id}/{}?version={}", attachment.file_name, attachment.version),
            })?;
        self.downloads.lock().push(format!(
            "{perm_id}/{}@{}",
            attachment.file_name, attachment.version
        ));
        Ok(content)
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Serves a fixed document; can be swapped between runs.
#[derive(Default)]
pub struct StaticManifestSource {
    document: Mutex<Bytes>,
    fail: Mutex<bool>,
}

impl StaticManifestSource {
    pub fn new(document: impl Into<Bytes>) -> Self {
        Self {
            document: Mutex::new(document.into()),
            fail: Mutex::new(false),
        }
    }

    pub fn set(&self, document: impl Into<Bytes>) {
        *self.document.lock() = document.into();
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn fetch(&self) -> Result<Bytes, ServiceError> {
        if *self.fail.lock() {
            return Err(ServiceError::Status {
                status: 503,
                url: "static://resource-list".to_string(),
            });
        }
        Ok(self.document.lock().clone())
    }
}

#[derive(Debug, Clone)]
struct EntryDraft {
    kind: EntityKind,
    perm_id: String,
    last_modified: DateTime<Utc>,
    attributes: Vec<(String, String)>,
    properties: Properties,
    connections: Vec<(String, ConnectionKind)>,
}

/// Resource-list XML writer.
///
/// ```ignore
/// let xml = ManifestBuilder::new("SRC")
///     .project("p1", "P1", ts)
///     .experiment("e1", "E1", "P1", ts)
///     .connect("p1", "e1", ConnectionKind::Connection)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    source_space: String,
    entries: Vec<EntryDraft>,
}

impl ManifestBuilder {
    pub fn new(source_space: &str) -> Self {
        Self {
            source_space: source_space.to_string(),
            entries: Vec::new(),
        }
    }

    fn entry(mut self, kind: EntityKind, perm_id: &str, last_modified: DateTime<Utc>, attributes: &[(&str, &str)]) -> Self {
        self.entries.push(EntryDraft {
            kind,
            perm_id: perm_id.to_string(),
            last_modified,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            properties: Properties::new(),
            connections: Vec::new(),
        });
        self
    }

    pub fn project(self, perm_id: &str, code: &str, last_modified: DateTime<Utc>) -> Self {
        let space = self.source_space.clone();
        self.entry(EntityKind::Project, perm_id, last_modified, &[("code", code), ("space", space.as_str())])
    }

    pub fn experiment(self, perm_id: &str, code: &str, project: &str, last_modified: DateTime<Utc>) -> Self {
        let space = self.source_space.clone();
        self.entry(
            EntityKind::Experiment,
            perm_id,
            last_modified,
            &[("code", code), ("type", "SIRNA_HCS"), ("space", space.as_str()), ("project", project)],
        )
    }

    pub fn sample(self, perm_id: &str, code: &str, last_modified: DateTime<Utc>) -> Self {
        let space = self.source_space.clone();
        self.entry(EntityKind::Sample, perm_id, last_modified, &[("code", code), ("type", "PLATE"), ("space", space.as_str())])
    }

    /// Physical data set; the code doubles as permId.
    pub fn data_set(self, code: &str, last_modified: DateTime<Utc>) -> Self {
        self.entry(
            EntityKind::DataSet,
            code,
            last_modified,
            &[("code", code), ("type", "HCS_IMAGE"), ("dsKind", "PHYSICAL")],
        )
    }

    pub fn container(self, code: &str, last_modified: DateTime<Utc>) -> Self {
        self.entry(
            EntityKind::DataSet,
            code,
            last_modified,
            &[("code", code), ("type", "HCS_CONTAINER"), ("dsKind", "CONTAINER")],
        )
    }

    pub fn material(self, code: &str, material_type: &str, last_modified: DateTime<Utc>) -> Self {
        let perm_id = format!("{code}%20({material_type})");
        self.entry(EntityKind::Material, &perm_id, last_modified, &[("code", code), ("type", material_type)])
    }

    /// Adds a property to the most recently added entity.
    pub fn property(mut self, code: &str, value: &str) -> Self {
        if let Some(entry) = self.entries.last_mut() {
            entry.properties.insert(code.to_string(), value.to_string());
        }
        self
    }

    /// Flags the most recently added entity as holding attachments.
    pub fn attachments(mut self) -> Self {
        if let Some(entry) = self.entries.last_mut() {
            entry.attributes.push(("attachments".to_string(), "true".to_string()));
        }
        self
    }

    /// Edge `from → to`; `from` must already have been added.
    pub fn connect(mut self, from: &str, to: &str, kind: ConnectionKind) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.perm_id == from) {
            entry.connections.push((to.to_string(), kind));
        }
        self
    }

    pub fn build(&self) -> String {
        use quick_xml::escape::escape;

        let mut xml = String::from(concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\"",
            " xmlns:rs=\"http://www.openarchives.org/rs/terms/\"",
            " xmlns:x=\"https://sis.id.ethz.ch/software/#openbis/xdterms/\">\n",
            "  <rs:md capability=\"resourcelist\"/>\n",
        ));
        for entry in &self.entries {
            xml.push_str("  <url>\n");
            xml.push_str(&format!(
                "    <loc>https://source:8444/datastore_server/re-sync/{}/{}/M</loc>\n",
                entry.kind.label(),
                escape(entry.perm_id.as_str())
            ));
            xml.push_str(&format!(
                "    <lastmod>{}</lastmod>\n",
                entry.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true)
            ));
            xml.push_str(&format!("    <x:xd kind=\"{}\"", entry.kind.label()));
            for (key, value) in &entry.attributes {
                xml.push_str(&format!(" {key}=\"{}\"", escape(value.as_str())));
            }
            xml.push_str(">\n");
            if !entry.properties.is_empty() {
                xml.push_str("      <x:properties>\n");
                for (code, value) in &entry.properties {
                    xml.push_str(&format!(
                        "        <x:property><x:code>{}</x:code><x:value>{}</x:value></x:property>\n",
                        escape(code.as_str()),
                        escape(value.as_str())
                    ));
                }
                xml.push_str("      </x:properties>\n");
            }
            if !entry.connections.is_empty() {
                xml.push_str("      <x:connections>\n");
                for (to, kind) in &entry.connections {
                    xml.push_str(&format!(
                        "        <x:connection to=\"{}\" type=\"{}\"/>\n",
                        escape(to.as_str()),
                        kind.label()
                    ));
                }
                xml.push_str("      </x:connections>\n");
            }
            xml.push_str("    </x:xd>\n  </url>\n");
        }
        xml.push_str("</urlset>\n");
        xml
    }
}
