//! Attachment mirroring for projects, experiments and samples.
//!
//! For every holder the remote and local attachment listings are compared by
//! file name:
//!
//! ```text
//!   remote only                          ──► add (download content)
//!   both, remote newer than watermark    ──► new local version
//!   both, holder retried                 ──► new local version
//!   local only                           ──► delete
//! ```
//!
//! Holders run on the shared worker pool and fail one by one: a failure is
//! reported under the holder key and written to the not-synced file so the
//! next run looks at the holder again.

use crate::error::AttachmentSyncError;
use crate::pool::run_pool;
use crate::report::AttachmentReport;
use crate::service::{
    Attachment, AttachmentChanges, EntityService, NewAttachment, RemoteFileService, SessionToken,
};
use chrono::{DateTime, Utc};
use harvester_manifest::AttachmentHolder;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AttachmentCounts {
    added: usize,
    updated: usize,
    deleted: usize,
}

struct HolderContext {
    entities: Arc<dyn EntityService>,
    files: Arc<dyn RemoteFileService>,
    session: SessionToken,
    watermark: DateTime<Utc>,
    retry: HashSet<String>,
    job_timeout: Duration,
}

pub struct AttachmentSynchronizer {
    ctx: HolderContext,
    workers: usize,
}

impl AttachmentSynchronizer {
    /// `retry` holds the holder keys of the not-synced file; their
    /// attachments are refreshed whatever their registration date.
    pub fn new(
        entities: Arc<dyn EntityService>,
        files: Arc<dyn RemoteFileService>,
        session: SessionToken,
        watermark: DateTime<Utc>,
        retry: HashSet<String>,
    ) -> Self {
        Self {
            ctx: HolderContext {
                entities,
                files,
                session,
                watermark,
                retry,
                job_timeout: Duration::from_secs(60 * 60),
            },
            workers: 1,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.ctx.job_timeout = timeout;
        self
    }

    pub async fn synchronize_all(self, holders: Vec<AttachmentHolder>) -> AttachmentReport {
        let mut report = AttachmentReport {
            attempted: holders.iter().map(AttachmentHolder::key).collect(),
            ..AttachmentReport::default()
        };
        if holders.is_empty() {
            return report;
        }
        let workers = self.workers.min(holders.len());
        tracing::info!(holders = holders.len(), workers, "synchronizing attachments");

        let jobs: Vec<(String, AttachmentHolder)> =
            holders.into_iter().map(|h| (h.key(), h)).collect();
        let ctx = Arc::new(self.ctx);
        let outcomes = run_pool("attachments", jobs, workers, move |holder| {
            let ctx = Arc::clone(&ctx);
            async move { run_holder(&ctx, holder).await }
        })
        .await;

        for key in &report.attempted {
            match outcomes.get(key) {
                Some(Ok(counts)) => {
                    report.added += counts.added;
                    report.updated += counts.updated;
                    report.deleted += counts.deleted;
                }
                Some(Err(err)) => {
                    report.failed.insert(key.clone(), err.to_string());
                }
                None => {
                    let err = AttachmentSyncError::Worker("no outcome reported".to_string());
                    report.failed.insert(key.clone(), err.to_string());
                }
            }
        }
        report
    }
}

async fn run_holder(
    ctx: &HolderContext,
    holder: AttachmentHolder,
) -> Result<AttachmentCounts, AttachmentSyncError> {
    let started = Instant::now();
    let key = holder.key();
    let result = match tokio::time::timeout(ctx.job_timeout, synchronize_one(ctx, &holder)).await {
        Ok(result) => result,
        Err(_) => Err(AttachmentSyncError::Timeout(ctx.job_timeout)),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(counts) if *counts != AttachmentCounts::default() => tracing::info!(
            holder = %key,
            identifier = %holder.identifier,
            added = counts.added,
            updated = counts.updated,
            deleted = counts.deleted,
            elapsed_ms,
            "attachments synchronized"
        ),
        Ok(_) => tracing::debug!(holder = %key, "attachments already in sync"),
        Err(err) => tracing::warn!(holder = %key, error = %err, elapsed_ms, "attachments failed"),
    }
    result
}

async fn synchronize_one(
    ctx: &HolderContext,
    holder: &AttachmentHolder,
) -> Result<AttachmentCounts, AttachmentSyncError> {
    let remote_session = ctx
        .files
        .login()
        .await
        .map_err(AttachmentSyncError::Login)?;
    let remote = ctx
        .files
        .list_attachments(&remote_session, holder.kind, &holder.perm_id)
        .await
        .map_err(AttachmentSyncError::Listing)?;
    let local = ctx
        .entities
        .list_attachments(&ctx.session, holder.kind, &holder.identifier)
        .await
        .map_err(AttachmentSyncError::LocalListing)?;

    let plan = diff(&remote, &local, ctx.watermark, ctx.retry.contains(&holder.key()));
    let counts = AttachmentCounts {
        added: plan.added.len(),
        updated: plan.updated.len(),
        deleted: plan.deleted.len(),
    };
    if counts == AttachmentCounts::default() {
        return Ok(counts);
    }

    let mut changes = AttachmentChanges {
        deleted: plan.deleted,
        ..AttachmentChanges::default()
    };
    for attachment in plan.added {
        changes
            .added
            .push(download(ctx, &remote_session, holder, attachment).await?);
    }
    for attachment in plan.updated {
        changes
            .updated
            .push(download(ctx, &remote_session, holder, attachment).await?);
    }
    ctx.entities
        .update_attachments(&ctx.session, holder.kind, &holder.identifier, changes)
        .await
        .map_err(AttachmentSyncError::Update)?;
    Ok(counts)
}

async fn download(
    ctx: &HolderContext,
    session: &str,
    holder: &AttachmentHolder,
    attachment: &Attachment,
) -> Result<NewAttachment, AttachmentSyncError> {
    let content = ctx
        .files
        .download_attachment(session, holder.kind, &holder.perm_id, attachment)
        .await
        .map_err(|source| AttachmentSyncError::Download {
            file_name: attachment.file_name.clone(),
            source,
        })?;
    Ok(NewAttachment {
        file_name: attachment.file_name.clone(),
        title: attachment.title.clone(),
        description: attachment.description.clone(),
        content: content.to_vec(),
    })
}

#[derive(Debug, Default)]
struct AttachmentDiff<'a> {
    added: Vec<&'a Attachment>,
    updated: Vec<&'a Attachment>,
    deleted: Vec<String>,
}

fn diff<'a>(
    remote: &'a [Attachment],
    local: &[Attachment],
    watermark: DateTime<Utc>,
    retried: bool,
) -> AttachmentDiff<'a> {
    let local_by_name: HashMap<&str, &Attachment> =
        local.iter().map(|a| (a.file_name.as_str(), a)).collect();
    let remote_names: HashSet<&str> = remote.iter().map(|a| a.file_name.as_str()).collect();

    let mut plan = AttachmentDiff::default();
    for attachment in remote {
        match local_by_name.get(attachment.file_name.as_str()) {
            None => plan.added.push(attachment),
            Some(_) if retried || attachment.registration_date > watermark => {
                plan.updated.push(attachment)
            }
            Some(_) => {}
        }
    }
    plan.deleted = local
        .iter()
        .filter(|a| !remote_names.contains(a.file_name.as_str()))
        .map(|a| a.file_name.clone())
        .collect();
    plan.deleted.sort();
    plan
}
