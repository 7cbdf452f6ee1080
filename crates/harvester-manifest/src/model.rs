//! Candidate entity graph produced by the resource-list parser.
//!
//! Every remote entity arrives as an [`Incoming`] wrapper: the creation payload
//! the destination would accept, the source permId, the source
//! last-modification time, and the outgoing [`Connection`]s. Connections are
//! kept as a closed enum so the planner can match on them exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Permanent, system-assigned identifier of an entity in the source system.
pub type PermId = String;

/// Property code → value, ordered for deterministic batches.
pub type Properties = BTreeMap<String, String>;

// ============================================================================
// Entity kinds & connections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Project,
    Experiment,
    Sample,
    DataSet,
    Material,
}

impl EntityKind {
    /// Label used on the wire (`kind="DATA_SET"`) and in the mapping table.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Project => "PROJECT",
            EntityKind::Experiment => "EXPERIMENT",
            EntityKind::Sample => "SAMPLE",
            EntityKind::DataSet => "DATA_SET",
            EntityKind::Material => "MATERIAL",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "PROJECT" => Some(EntityKind::Project),
            "EXPERIMENT" => Some(EntityKind::Experiment),
            "SAMPLE" => Some(EntityKind::Sample),
            "DATA_SET" => Some(EntityKind::DataSet),
            "MATERIAL" => Some(EntityKind::Material),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kind of a directed edge between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Parent → child (samples or data sets).
    Child,
    /// Container → contained (container samples or data sets).
    Component,
    /// Structural ownership (project → experiment, experiment → sample, ...).
    /// Resolved into attribute fields by the planner, never kept as an edge.
    Connection,
}

impl ConnectionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionKind::Child => "Child",
            ConnectionKind::Component => "Component",
            ConnectionKind::Connection => "Connection",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Child" => Some(ConnectionKind::Child),
            "Component" => Some(ConnectionKind::Component),
            "Connection" => Some(ConnectionKind::Connection),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from: PermId,
    pub to: PermId,
    pub kind: ConnectionKind,
}

impl Connection {
    pub fn new(from: impl Into<PermId>, to: impl Into<PermId>, kind: ConnectionKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
        }
    }
}

// ============================================================================
// Creation payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProject {
    /// Source permId, kept by the destination on registration.
    pub perm_id: PermId,
    pub code: String,
    pub space: String,
    /// `/SPACE/CODE`
    pub identifier: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    /// Source permId, kept by the destination on registration.
    pub perm_id: PermId,
    pub code: String,
    pub experiment_type: String,
    /// `/SPACE/PROJECT/CODE`; the project segment may be rewritten by the
    /// planner to the local parent path.
    pub identifier: String,
    pub properties: Properties,
}

impl NewExperiment {
    /// Identifier of the owning project (everything before the last `/`).
    pub fn project_identifier(&self) -> &str {
        match self.identifier.rfind('/') {
            Some(idx) => &self.identifier[..idx],
            None => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSample {
    /// Source permId, kept by the destination on registration.
    pub perm_id: PermId,
    pub code: String,
    pub sample_type: String,
    /// `/SPACE/CODE`
    pub identifier: String,
    pub properties: Properties,
    pub experiment_identifier: Option<String>,
    pub container_identifier: Option<String>,
    /// `None` means "parents not touched"; `Some(vec![])` clears them.
    pub parent_identifiers: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMaterial {
    pub code: String,
    pub material_type: String,
    pub properties: Properties,
}

impl NewMaterial {
    pub fn identifier(&self) -> String {
        format!("{} ({})", self.code, self.material_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSetKind {
    /// Owns a file payload.
    Physical,
    /// References other data sets as components; no payload of its own.
    Container { contained_codes: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataSet {
    /// Source permId, kept by the destination on registration.
    pub perm_id: PermId,
    pub code: String,
    pub data_set_type: String,
    pub kind: DataSetKind,
    pub properties: Properties,
    pub sample_identifier: Option<String>,
    pub experiment_identifier: Option<String>,
    pub parent_codes: Vec<String>,
}

impl NewDataSet {
    pub fn is_physical(&self) -> bool {
        matches!(self.kind, DataSetKind::Physical)
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, DataSetKind::Container { .. })
    }
}

// ============================================================================
// Incoming wrappers
// ============================================================================

/// A remote entity as described by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incoming<T> {
    pub perm_id: PermId,
    pub last_modified: DateTime<Utc>,
    pub entity: T,
    pub connections: Vec<Connection>,
    /// The source holds file attachments for this entity.
    #[serde(default)]
    pub has_attachments: bool,
}

impl<T> Incoming<T> {
    pub fn new(perm_id: impl Into<PermId>, last_modified: DateTime<Utc>, entity: T) -> Self {
        Self {
            perm_id: perm_id.into(),
            last_modified,
            entity,
            connections: Vec::new(),
            has_attachments: false,
        }
    }

    pub fn with_attachments(mut self) -> Self {
        self.has_attachments = true;
        self
    }

    pub fn with_connection(mut self, to: impl Into<PermId>, kind: ConnectionKind) -> Self {
        let from = self.perm_id.clone();
        self.connections.push(Connection::new(from, to, kind));
        self
    }

    /// Strictly newer than the watermark.
    pub fn is_modified_since(&self, watermark: DateTime<Utc>) -> bool {
        self.last_modified > watermark
    }
}

pub type IncomingProject = Incoming<NewProject>;
pub type IncomingExperiment = Incoming<NewExperiment>;
pub type IncomingSample = Incoming<NewSample>;
pub type IncomingDataSet = Incoming<NewDataSet>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMaterial {
    pub last_modified: DateTime<Utc>,
    pub material: NewMaterial,
}

impl IncomingMaterial {
    pub fn is_modified_since(&self, watermark: DateTime<Utc>) -> bool {
        self.last_modified > watermark
    }
}

// ============================================================================
// Attachment holders
// ============================================================================

/// A project, experiment or sample whose attachments are to be mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentHolder {
    pub kind: EntityKind,
    /// Source permId, used against the remote side.
    pub perm_id: PermId,
    /// Local identifier, used against the destination.
    pub identifier: String,
    pub has_attachments: bool,
}

impl AttachmentHolder {
    /// `EXPERIMENT-20160630100000000-2`, the form kept in the not-synced file.
    pub fn key(&self) -> String {
        holder_key(self.kind, &self.perm_id)
    }
}

pub fn holder_key(kind: EntityKind, perm_id: &str) -> String {
    format!("{}-{perm_id}", kind.label())
}
