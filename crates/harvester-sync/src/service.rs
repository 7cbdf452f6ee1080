//! Collaborator interfaces and the operation-batch model.
//!
//! ```text
//!   ManifestSource ──► bytes of the resource list
//!   EntityService  ──► destination: lookups, space listing, atomic batches
//!   RemoteFileService ─► source: file listing, streamed download, attachments
//! ```
//!
//! All three are object-safe async traits so the engine can hold them as
//! `Arc<dyn …>` and tests can swap in the in-memory doubles.

use crate::error::ServiceError;
use crate::graph::SpaceListing;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use harvester_manifest::{
    EntityKind, NewDataSet, NewExperiment, NewMaterial, NewProject, NewSample, Properties,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

pub type SessionToken = String;

// ============================================================================
// Local entity views
// ============================================================================

/// Just enough of a local entity to issue an optimistic-concurrency update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub kind: EntityKind,
    pub perm_id: String,
    pub identifier: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDataSet {
    pub code: String,
    pub data_set_type: String,
    pub version: i64,
    pub is_container: bool,
    pub properties: Properties,
    pub sample_identifier: Option<String>,
    pub experiment_identifier: Option<String>,
    pub parent_codes: Vec<String>,
    pub contained_codes: Vec<String>,
}

/// One entry of a remote data set's file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetFile {
    /// Relative to the data set root, `/`-separated.
    pub path: String,
    pub is_directory: bool,
    pub length: u64,
}

/// Namespace created when the first run finds none to write into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSpace {
    pub code: String,
    pub description: Option<String>,
}

// ============================================================================
// Attachments
// ============================================================================

/// Latest version of one attachment, as either side lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub version: i32,
    pub registration_date: DateTime<Utc>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Attachment content on its way to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttachment {
    pub file_name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Vec<u8>,
}

/// Attachment edits for one holder, applied in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentChanges {
    pub added: Vec<NewAttachment>,
    /// Stored as a new version on the destination.
    pub updated: Vec<NewAttachment>,
    /// File names.
    pub deleted: Vec<String>,
}

impl AttachmentChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

// ============================================================================
// Updates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub identifier: String,
    pub version: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentUpdate {
    pub perm_id: String,
    pub identifier: String,
    pub project_identifier: String,
    pub version: i64,
    /// Replaces the local property set.
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleUpdate {
    pub identifier: String,
    pub version: i64,
    /// Replaces the local property set.
    pub properties: Properties,
    pub experiment_identifier: Option<String>,
    pub container_identifier: Option<String>,
    /// `None` leaves parents alone, `Some(vec![])` removes them all.
    pub parent_identifiers: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialUpdate {
    pub code: String,
    pub material_type: String,
    pub version: i64,
    /// Replaces the local property set.
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetUpdate {
    pub code: String,
    pub version: i64,
    /// Replaces the local property set.
    pub properties: Properties,
    pub sample_identifier: Option<String>,
    pub experiment_identifier: Option<String>,
    /// Always sent; empty clears the parents.
    pub modified_parent_codes: Vec<String>,
    /// Containers only.
    pub modified_contained_codes: Option<Vec<String>>,
}

// ============================================================================
// Batch
// ============================================================================

/// One atomic entity-operation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub user: Option<String>,
    pub space_registrations: Vec<NewSpace>,
    pub project_registrations: Vec<NewProject>,
    pub project_updates: Vec<ProjectUpdate>,
    pub experiment_registrations: Vec<NewExperiment>,
    pub experiment_updates: Vec<ExperimentUpdate>,
    pub sample_registrations: Vec<NewSample>,
    pub sample_updates: Vec<SampleUpdate>,
    pub material_registrations: Vec<NewMaterial>,
    pub material_updates: Vec<MaterialUpdate>,
    pub data_set_registrations: Vec<NewDataSet>,
    pub data_set_updates: Vec<DataSetUpdate>,
}

impl OperationBatch {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn registration_count(&self) -> usize {
        self.space_registrations.len()
            + self.project_registrations.len()
            + self.experiment_registrations.len()
            + self.sample_registrations.len()
            + self.material_registrations.len()
            + self.data_set_registrations.len()
    }

    pub fn update_count(&self) -> usize {
        self.project_updates.len()
            + self.experiment_updates.len()
            + self.sample_updates.len()
            + self.material_updates.len()
            + self.data_set_updates.len()
    }

    pub fn operation_count(&self) -> usize {
        self.registration_count() + self.update_count()
    }

    pub fn is_empty(&self) -> bool {
        self.operation_count() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub registered: usize,
    pub updated: usize,
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self) -> Result<Bytes, ServiceError>;
}

/// The destination system.
#[async_trait]
pub trait EntityService: Send + Sync {
    async fn login(&self) -> Result<SessionToken, ServiceError>;

    /// `None` when the namespace does not exist yet.
    async fn list_space(
        &self,
        session: &str,
        space: &str,
    ) -> Result<Option<SpaceListing>, ServiceError>;

    async fn try_get_project(
        &self,
        session: &str,
        identifier: &str,
    ) -> Result<Option<LocalEntity>, ServiceError>;

    async fn try_get_experiment(
        &self,
        session: &str,
        identifier: &str,
    ) -> Result<Option<LocalEntity>, ServiceError>;

    async fn try_get_experiment_by_perm_id(
        &self,
        session: &str,
        perm_id: &str,
    ) -> Result<Option<LocalEntity>, ServiceError>;

    async fn try_get_sample(
        &self,
        session: &str,
        identifier: &str,
    ) -> Result<Option<LocalEntity>, ServiceError>;

    async fn try_get_material(
        &self,
        session: &str,
        code: &str,
        material_type: &str,
    ) -> Result<Option<LocalEntity>, ServiceError>;

    async fn try_get_data_set(
        &self,
        session: &str,
        code: &str,
    ) -> Result<Option<LocalDataSet>, ServiceError>;

    /// All or nothing.
    async fn perform_entity_operations(
        &self,
        session: &str,
        batch: OperationBatch,
    ) -> Result<OperationResult, ServiceError>;

    /// Latest version of each attachment of a project, experiment or sample.
    async fn list_attachments(
        &self,
        session: &str,
        kind: EntityKind,
        identifier: &str,
    ) -> Result<Vec<Attachment>, ServiceError>;

    async fn update_attachments(
        &self,
        session: &str,
        kind: EntityKind,
        identifier: &str,
        changes: AttachmentChanges,
    ) -> Result<(), ServiceError>;
}

/// The source data store.
#[async_trait]
pub trait RemoteFileService: Send + Sync {
    async fn login(&self) -> Result<SessionToken, ServiceError>;

    async fn search_files(&self, session: &str, code: &str)
        -> Result<Vec<DataSetFile>, ServiceError>;

    /// Streams one file into `sink`, returning the number of bytes written.
    async fn download_file(
        &self,
        session: &str,
        code: &str,
        file: &DataSetFile,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ServiceError>;

    async fn list_attachments(
        &self,
        session: &str,
        kind: EntityKind,
        perm_id: &str,
    ) -> Result<Vec<Attachment>, ServiceError>;

    async fn download_attachment(
        &self,
        session: &str,
        kind: EntityKind,
        perm_id: &str,
        attachment: &Attachment,
    ) -> Result<Bytes, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_registrations_and_updates() {
        let mut batch = OperationBatch::for_user("harvester");
        assert!(batch.is_empty());
        batch.project_registrations.push(NewProject {
            perm_id: "20160630-1".into(),
            code: "P1".into(),
            space: "DST".into(),
            identifier: "/DST/P1".into(),
            description: None,
        });
        batch.material_updates.push(MaterialUpdate {
            code: "GENE_1".into(),
            material_type: "GENE".into(),
            version: 3,
            properties: Properties::new(),
        });
        assert_eq!(batch.registration_count(), 1);
        assert_eq!(batch.update_count(), 1);
        assert_eq!(batch.operation_count(), 2);
        assert!(!batch.is_empty());
    }

    #[test]
    fn space_alone_is_worth_submitting() {
        let mut batch = OperationBatch::for_user("harvester");
        batch.space_registrations.push(NewSpace {
            code: "DST".into(),
            description: Some("Synchronized from: https://source:8444".into()),
        });
        assert_eq!(batch.registration_count(), 1);
        assert!(!batch.is_empty());
    }

    #[test]
    fn attachment_changes_know_when_there_is_nothing_to_send() {
        let mut changes = AttachmentChanges::default();
        assert!(changes.is_empty());
        changes.deleted.push("old.txt".into());
        assert!(!changes.is_empty());
    }

    #[test]
    fn batch_serializes_for_the_wire() {
        let batch = OperationBatch::for_user("harvester");
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["user"], "harvester");
        let back: OperationBatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, batch);
    }
}
