//! The run orchestrator.
//!
//! ```text
//!   load watermark ─► begin run (side file)
//!        │
//!        ▼
//!   fetch ─► parse ─► snapshot ─► plan ─► submit entities
//!                                              │
//!        ┌─────────────────────────────────────┘
//!        ▼
//!   attachments (worker pool) ─► register content (worker pool)
//!                                              │
//!        ┌─────────────────────────────────────┘
//!        ▼
//!   save ledger ─► reconcile ─► commit
//! ```
//!
//! Stages run strictly one after another. Any error before `commit` abandons
//! the side file, so the next run re-reads the previous watermark and
//! reconsiders the same window.

use crate::attachments::AttachmentSynchronizer;
use crate::checkpoint::Checkpoint;
use crate::config::HarvesterConfig;
use crate::error::{HarvestError, Result};
use crate::graph::LocalGraph;
use crate::http::HttpManifestSource;
use crate::ledger::NotSyncedEntities;
use crate::mapping::{IdentifierMapper, IdentityMapper, PermIdMapping, SqliteIdentifierMapper};
use crate::planner::{PlanAction, SyncPlanner};
use crate::pool::machine_pool_size;
use crate::reconciler::RelationshipReconciler;
use crate::registrar::{ContentRegistrar, RegistrarSettings};
use crate::report::SyncReport;
use crate::rpc::{RpcEntityService, RpcRemoteFileService};
use crate::service::{EntityService, ManifestSource, RemoteFileService};
use chrono::{DateTime, Utc};
use harvester_manifest::{EntityKind, ResourceListParser};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Checkpoint,
    Fetch,
    Parse,
    Snapshot,
    Plan,
    SubmitEntities,
    SyncAttachments,
    RegisterContent,
    Reconcile,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Checkpoint => "checkpoint",
            Stage::Fetch => "fetch resource list",
            Stage::Parse => "parse resource list",
            Stage::Snapshot => "local snapshot",
            Stage::Plan => "plan entities",
            Stage::SubmitEntities => "submit entities",
            Stage::SyncAttachments => "synchronize attachments",
            Stage::RegisterContent => "register data set content",
            Stage::Reconcile => "reconcile data set relationships",
            Stage::Commit => "commit watermark",
        };
        f.write_str(name)
    }
}

/// Logs entry into each stage and how long the previous one took.
struct StageMonitor {
    current: Stage,
    started: Instant,
}

impl StageMonitor {
    fn new() -> Self {
        Self {
            current: Stage::Checkpoint,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.finish();
        self.current = stage;
        self.started = Instant::now();
        tracing::info!(stage = %stage, "stage started");
    }

    fn finish(&self) {
        tracing::info!(
            stage = %self.current,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stage finished"
        );
    }
}

pub struct Harvester {
    config: HarvesterConfig,
    manifest: Arc<dyn ManifestSource>,
    entities: Arc<dyn EntityService>,
    files: Arc<dyn RemoteFileService>,
    mapper: Arc<dyn IdentifierMapper>,
}

impl Harvester {
    pub fn new(
        config: HarvesterConfig,
        manifest: Arc<dyn ManifestSource>,
        entities: Arc<dyn EntityService>,
        files: Arc<dyn RemoteFileService>,
        mapper: Arc<dyn IdentifierMapper>,
    ) -> Self {
        Self {
            config,
            manifest,
            entities,
            files,
            mapper,
        }
    }

    /// Wire up the HTTP/JSON-RPC collaborators described by `config`.
    pub fn from_config(config: HarvesterConfig) -> Result<Self> {
        let manifest = Arc::new(HttpManifestSource::from_config(&config)?);
        let entities = Arc::new(RpcEntityService::from_config(&config)?);
        let files = Arc::new(RpcRemoteFileService::from_config(&config)?);
        let mapper: Arc<dyn IdentifierMapper> = match &config.harvester.mapping_db {
            Some(path) => Arc::new(SqliteIdentifierMapper::open(path)?),
            None => Arc::new(IdentityMapper),
        };
        Ok(Self::new(config, manifest, entities, files, mapper))
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(&self.config.harvester.last_sync_timestamp_file)
    }

    pub async fn run(&self) -> Result<SyncReport> {
        self.run_at(Utc::now()).await
    }

    /// One run whose candidate watermark is `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        let settings = &self.config.harvester;
        let checkpoint = self.checkpoint();
        let watermark = checkpoint.load()?;
        let pending = checkpoint.begin_run_at(now)?;

        let mut report = SyncReport::new(&settings.space, settings.dry_run, watermark, pending.timestamp());
        tracing::info!(
            space = %settings.space,
            window_start = %report.window_start,
            window_end = %report.window_end,
            dry_run = settings.dry_run,
            "harvester run started"
        );

        let mut monitor = StageMonitor::new();
        match self.run_stages(watermark, &mut report, &mut monitor).await {
            Ok(()) => {
                monitor.enter(Stage::Commit);
                if settings.dry_run {
                    pending.abandon()?;
                    tracing::info!(space = %settings.space, "dry run, watermark left untouched");
                } else {
                    report.committed_watermark = Some(pending.commit()?);
                }
                monitor.finish();
                report.log_summary();
                Ok(report)
            }
            Err(err) => {
                tracing::error!(
                    space = %settings.space,
                    stage = %monitor.current,
                    window_start = %report.window_start,
                    window_end = %report.window_end,
                    error = %err,
                    "harvester run failed, watermark not advanced"
                );
                if let Err(cleanup) = pending.abandon() {
                    tracing::warn!(error = %cleanup, "could not remove candidate watermark");
                }
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        watermark: DateTime<Utc>,
        report: &mut SyncReport,
        monitor: &mut StageMonitor,
    ) -> Result<()> {
        let settings = &self.config.harvester;

        monitor.enter(Stage::Fetch);
        let bytes = self.manifest.fetch().await.map_err(HarvestError::ManifestFetch)?;
        tracing::debug!(bytes = bytes.len(), "resource list fetched");

        monitor.enter(Stage::Parse);
        let mut list = ResourceListParser::new(&settings.space, watermark).parse_bytes(&bytes)?;
        report.resource_list = Some(list.summary());

        monitor.enter(Stage::Snapshot);
        let session = self.entities.login().await?;
        let graph = match self.entities.list_space(&session, &settings.space).await? {
            Some(listing) => LocalGraph::from_listing(listing),
            None => {
                tracing::info!(space = %settings.space, "local space does not exist yet");
                LocalGraph::empty(&settings.space)
            }
        };
        let experiment_mapping = PermIdMapping::load(
            self.mapper.as_ref(),
            &self.config.data_source.prefix,
            EntityKind::Experiment,
        )?;
        let ledger = NotSyncedEntities::load(&settings.not_synced_entities_file)?;
        tracing::info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            mapped_experiments = experiment_mapping.len(),
            "local snapshot loaded"
        );

        monitor.enter(Stage::Plan);
        let mut plan = SyncPlanner::new(
            self.entities.as_ref(),
            &session,
            &graph,
            &experiment_mapping,
            watermark,
        )
        .space_description(format!("Synchronized from: {}", self.config.data_source.server_url))
        .verbose(settings.verbose)
        .plan(&mut list)
        .await?;
        plan.batch.user = Some(self.config.destination.user.clone());
        report.entity_registrations = plan.batch.registration_count();
        report.entity_updates = plan.batch.update_count();
        let created: HashSet<(EntityKind, String)> = plan
            .decisions
            .iter()
            .filter(|d| d.action == PlanAction::Create)
            .map(|d| (d.kind, d.identifier.clone()))
            .collect();

        monitor.enter(Stage::SubmitEntities);
        if settings.dry_run {
            tracing::info!(operations = plan.batch.operation_count(), "dry run, entity batch not submitted");
        } else if plan.batch.is_empty() {
            tracing::info!("no entity changes to submit");
        } else {
            let result = self
                .entities
                .perform_entity_operations(&session, plan.batch)
                .await
                .map_err(HarvestError::BatchSubmission)?;
            tracing::info!(registered = result.registered, updated = result.updated, "entity batch submitted");
        }

        monitor.enter(Stage::SyncAttachments);
        // Holders created by this run without attachments have nothing to mirror.
        let holders: Vec<_> = list
            .attachment_holders(ledger.attachment_retry())
            .into_iter()
            .filter(|h| h.has_attachments || !created.contains(&(h.kind, h.identifier.clone())))
            .collect();
        if settings.dry_run {
            if settings.verbose {
                for holder in &holders {
                    tracing::info!(holder = %holder.key(), identifier = %holder.identifier, "attachments will be processed");
                }
            }
            tracing::info!(holders = holders.len(), "dry run, attachments not synchronized");
            report.attachments.attempted = holders.iter().map(|h| h.key()).collect();
        } else {
            let synchronizer = AttachmentSynchronizer::new(
                Arc::clone(&self.entities),
                Arc::clone(&self.files),
                session.clone(),
                watermark,
                ledger.attachment_retry().clone(),
            )
            .workers(machine_pool_size(settings.machine_load, settings.max_workers))
            .job_timeout(settings.job_timeout());
            report.attachments = synchronizer.synchronize_all(holders).await;
        }

        monitor.enter(Stage::RegisterContent);
        let to_register = list.physical_data_sets_to_register(ledger.retry(), ledger.black_listed());
        let content_codes: HashSet<String> = to_register.keys().cloned().collect();
        report.black_listed = ledger.black_listed().len();
        if settings.dry_run {
            if settings.verbose {
                for code in to_register.keys() {
                    tracing::info!(code = %code, "data set content will be registered");
                }
            }
            tracing::info!(jobs = to_register.len(), "dry run, no content transferred");
            report.content.attempted = to_register.into_keys().collect();
        } else {
            let registrar = ContentRegistrar::new(
                Arc::clone(&self.entities),
                Arc::clone(&self.files),
                session.clone(),
                RegistrarSettings::from_settings(settings, Some(self.config.destination.user.clone())),
            );
            report.content = registrar.register_all(to_register).await;
            tracing::info!(
                succeeded = report.content.success_count(),
                failed = report.content.failed.len(),
                "content registration finished"
            );
            ledger.save(report.content.failed_codes(), report.attachments.failed_holders())?;
        }

        monitor.enter(Stage::Reconcile);
        let skipped: HashSet<String> = report
            .content
            .failed_codes()
            .map(str::to_string)
            .chain(ledger.black_listed().iter().cloned())
            .collect();
        let mut reconciliation = RelationshipReconciler::new(
            self.entities.as_ref(),
            &session,
            watermark,
            ledger.retry(),
            ledger.black_listed(),
        )
        .verbose(settings.verbose)
        .plan(&list, &content_codes, &skipped)
        .await?;
        reconciliation.batch.user = Some(self.config.destination.user.clone());
        report.container_registrations = reconciliation.registered.len();
        report.relationship_updates = reconciliation.updated.len();
        report.relationship_skipped = reconciliation.skipped;

        if settings.dry_run {
            tracing::info!(
                operations = reconciliation.batch.operation_count(),
                "dry run, relationship batch not submitted"
            );
        } else if !reconciliation.batch.is_empty() {
            self.entities
                .perform_entity_operations(&session, reconciliation.batch)
                .await
                .map_err(HarvestError::Reconciliation)?;
            tracing::info!(
                registered = report.container_registrations,
                updated = report.relationship_updates,
                "relationship batch submitted"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_read_as_log_text() {
        assert_eq!(Stage::Fetch.to_string(), "fetch resource list");
        assert_eq!(Stage::Reconcile.to_string(), "reconcile data set relationships");
        assert_eq!(Stage::SyncAttachments.to_string(), "synchronize attachments");
    }
}
