//! Harvester sync: incremental entity synchronization from a remote system
//! into a local namespace.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ONE RUN                                   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  Checkpoint ──► ManifestSource ──► ResourceListParser                │
//! │  (watermark,      (HTTP GET,         (harvester-manifest)            │
//! │   .new file)       basic auth)              │                        │
//! │                                             ▼                        │
//! │  LocalGraph ◄── EntityService ──►  SyncPlanner ──► batch #1          │
//! │  IdentifierMapper (sqlite)         projects, experiments,            │
//! │                                    samples, materials                │
//! │                                             │                        │
//! │                                             ▼                        │
//! │  RemoteFileService ──────────────► AttachmentSynchronizer (pool)     │
//! │  (attachments, files)              projects, experiments, samples    │
//! │                                             │                        │
//! │                                             ▼                        │
//! │                                    ContentRegistrar (worker pool)    │
//! │                                    physical data sets, one tx each   │
//! │                                             │                        │
//! │  NotSyncedEntities (retry/black-list) ◄─────┤                        │
//! │                                             ▼                        │
//! │                                    RelationshipReconciler ► batch #2 │
//! │                                    parents, containers               │
//! │                                             │                        │
//! │                                             ▼                        │
//! │                                    commit watermark (rename)         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At least once**: the watermark only moves after every stage
//!   succeeded, so a failed run is retried over the same window.
//! - **Per-item isolation**: one data set's content failure, or one holder's
//!   attachment failure, is reported, recorded for retry, and never aborts
//!   its siblings.
//! - **Known limitation**: data sets are registered without topological
//!   ordering. Edges between data sets of the same run are only set in the
//!   second batch.

pub mod attachments;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod http;
pub mod ledger;
pub mod mapping;
pub mod planner;
pub mod pool;
pub mod reconciler;
pub mod registrar;
pub mod report;
pub mod rpc;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use attachments::AttachmentSynchronizer;
pub use checkpoint::{format_watermark, parse_watermark, Checkpoint, PendingWatermark};
pub use config::{DataSourceConfig, DestinationConfig, HarvestSettings, HarvesterConfig};
pub use engine::{Harvester, Stage};
pub use error::{
    AttachmentSyncError, ContentRegistrationError, HarvestError, MappingError, Result,
    ServiceError,
};
pub use graph::{GraphEdge, GraphNode, LocalGraph, SpaceListing};
pub use ledger::NotSyncedEntities;
pub use mapping::{
    IdentifierMapper, IdentityMapper, PermIdMap, PermIdMapping, SqliteIdentifierMapper,
    StaticIdentifierMapper,
};
pub use planner::{propagate_connections, PlanAction, PlanDecision, SyncPlan, SyncPlanner};
pub use pool::{pool_size, run_pool};
pub use reconciler::{DataSetEdges, ReconciliationPlan, RelationshipReconciler};
pub use registrar::{ContentRegistrar, RegistrarSettings};
pub use report::{AttachmentReport, ContentReport, SyncReport};
pub use service::{
    Attachment, AttachmentChanges, DataSetFile, DataSetUpdate, EntityService, ExperimentUpdate,
    LocalDataSet, LocalEntity, ManifestSource, MaterialUpdate, NewAttachment, NewSpace,
    OperationBatch, OperationResult, ProjectUpdate, RemoteFileService, SampleUpdate,
    SessionToken,
};
