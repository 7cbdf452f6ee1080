//! Per-run report.

use chrono::{DateTime, Utc};
use harvester_manifest::ResourceListSummary;
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of the content registration stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContentReport {
    /// Every physical data set handed to the registrar.
    pub attempted: Vec<String>,
    /// Newly created, content transferred.
    pub registered: Vec<String>,
    /// Already present; metadata updated, no transfer.
    pub updated: Vec<String>,
    /// code → reason
    pub failed: BTreeMap<String, String>,
}

impl ContentReport {
    pub fn success_count(&self) -> usize {
        self.registered.len() + self.updated.len()
    }

    pub fn failed_codes(&self) -> impl Iterator<Item = &str> {
        self.failed.keys().map(String::as_str)
    }
}

/// Outcome of the attachment stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentReport {
    /// Holder keys (`EXPERIMENT-<permId>`) looked at.
    pub attempted: Vec<String>,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// holder key → reason
    pub failed: BTreeMap<String, String>,
}

impl AttachmentReport {
    pub fn failed_holders(&self) -> impl Iterator<Item = &str> {
        self.failed.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub space: String,
    pub dry_run: bool,
    /// Previous committed watermark.
    pub window_start: DateTime<Utc>,
    /// Candidate watermark of this run.
    pub window_end: DateTime<Utc>,
    pub resource_list: Option<ResourceListSummary>,
    pub entity_registrations: usize,
    pub entity_updates: usize,
    pub attachments: AttachmentReport,
    pub content: ContentReport,
    pub black_listed: usize,
    pub container_registrations: usize,
    pub relationship_updates: usize,
    /// Data sets left out of the relationship batch (not registered locally,
    /// or owner lookup failed).
    pub relationship_skipped: Vec<String>,
    /// `None` for dry runs.
    pub committed_watermark: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn new(space: impl Into<String>, dry_run: bool, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            space: space.into(),
            dry_run,
            window_start,
            window_end,
            resource_list: None,
            entity_registrations: 0,
            entity_updates: 0,
            attachments: AttachmentReport::default(),
            content: ContentReport::default(),
            black_listed: 0,
            container_registrations: 0,
            relationship_updates: 0,
            relationship_skipped: Vec::new(),
            committed_watermark: None,
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(
            space = %self.space,
            added = self.content.registered.len(),
            updated = self.content.updated.len(),
            failed = self.content.failed.len(),
            black_listed = self.black_listed,
            "data set synchronization summary"
        );
        for (code, reason) in &self.content.failed {
            tracing::warn!(code = %code, reason = %reason, "data set FAILED to register");
        }
        if !self.attachments.attempted.is_empty() {
            tracing::info!(
                holders = self.attachments.attempted.len(),
                added = self.attachments.added,
                updated = self.attachments.updated,
                deleted = self.attachments.deleted,
                failed = self.attachments.failed.len(),
                "attachment synchronization summary"
            );
        }
        for (holder, reason) in &self.attachments.failed {
            tracing::warn!(holder = %holder, reason = %reason, "attachments FAILED to synchronize");
        }
    }
}
