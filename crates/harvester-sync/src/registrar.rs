//! Content registration of physical data sets on a bounded worker pool.
//!
//! ```text
//!   worker: login → list → download → stage → move → register
//! ```
//!
//! Each data set is its own transaction against the entity service: a
//! failure is recorded for that code and the other workers carry on. No
//! ordering between data sets is imposed; edges are set afterwards by the
//! relationship reconciler.

use crate::config::HarvestSettings;
use crate::error::ContentRegistrationError;
use crate::pool::{machine_pool_size, run_pool};
use crate::report::ContentReport;
use crate::service::{
    DataSetFile, DataSetUpdate, EntityService, LocalDataSet, OperationBatch, RemoteFileService,
    SessionToken,
};
use harvester_manifest::{IncomingDataSet, NewDataSet};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RegistrarSettings {
    pub store_root: PathBuf,
    pub staging_root: PathBuf,
    pub machine_load: f64,
    pub max_workers: usize,
    pub job_timeout: Duration,
    pub user: Option<String>,
}

impl RegistrarSettings {
    pub fn from_settings(settings: &HarvestSettings, user: Option<String>) -> Self {
        Self {
            store_root: settings.store_root.clone(),
            staging_root: settings.staging_root(),
            machine_load: settings.machine_load,
            max_workers: settings.max_workers,
            job_timeout: settings.job_timeout(),
            user,
        }
    }

    pub fn worker_count(&self) -> usize {
        machine_pool_size(self.machine_load, self.max_workers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentAction {
    Registered,
    Updated,
}

struct JobContext {
    entities: Arc<dyn EntityService>,
    files: Arc<dyn RemoteFileService>,
    session: SessionToken,
    settings: RegistrarSettings,
}

pub struct ContentRegistrar {
    ctx: Arc<JobContext>,
}

impl ContentRegistrar {
    /// `session` is the destination session of the run.
    pub fn new(
        entities: Arc<dyn EntityService>,
        files: Arc<dyn RemoteFileService>,
        session: SessionToken,
        settings: RegistrarSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(JobContext {
                entities,
                files,
                session,
                settings,
            }),
        }
    }

    /// Runs every job to completion (including stragglers) before returning.
    pub async fn register_all(&self, data_sets: BTreeMap<String, IncomingDataSet>) -> ContentReport {
        let mut report = ContentReport {
            attempted: data_sets.keys().cloned().collect(),
            ..ContentReport::default()
        };
        if data_sets.is_empty() {
            return report;
        }

        let workers = self.ctx.settings.worker_count().min(data_sets.len());
        tracing::info!(jobs = data_sets.len(), workers, "registering data sets");

        let jobs: Vec<(String, NewDataSet)> = data_sets
            .into_iter()
            .map(|(code, ds)| (code, ds.entity))
            .collect();
        let ctx = Arc::clone(&self.ctx);
        let outcomes = run_pool("content", jobs, workers, move |data_set| {
            let ctx = Arc::clone(&ctx);
            async move { run_job(&ctx, data_set).await }
        })
        .await;

        for (code, result) in outcomes {
            match result {
                Ok(ContentAction::Registered) => report.registered.push(code),
                Ok(ContentAction::Updated) => report.updated.push(code),
                Err(err) => {
                    report.failed.insert(code, err.to_string());
                }
            }
        }

        // Jobs lost with an aborted worker never reported back.
        let lost: Vec<String> = report
            .attempted
            .iter()
            .filter(|&code| {
                !report.failed.contains_key(code)
                    && !report.registered.contains(code)
                    && !report.updated.contains(code)
            })
            .cloned()
            .collect();
        for code in lost {
            let err = ContentRegistrationError::Worker("no outcome reported".to_string());
            report.failed.insert(code, err.to_string());
        }

        report.registered.sort();
        report.updated.sort();
        report
    }
}

async fn run_job(ctx: &JobContext, data_set: NewDataSet) -> Result<ContentAction, ContentRegistrationError> {
    let started = Instant::now();
    let code = data_set.code.clone();
    let timeout = ctx.settings.job_timeout;

    let result = match tokio::time::timeout(timeout, register_one(ctx, data_set)).await {
        Ok(result) => result,
        Err(_) => {
            remove_dir_quietly(&ctx.settings.staging_root.join(&code)).await;
            Err(ContentRegistrationError::Timeout(timeout))
        }
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(action) => tracing::info!(code = %code, action = ?action, elapsed_ms, "data set done"),
        Err(err) => tracing::warn!(code = %code, error = %err, elapsed_ms, "data set failed"),
    }
    result
}

async fn register_one(ctx: &JobContext, data_set: NewDataSet) -> Result<ContentAction, ContentRegistrationError> {
    let existing = ctx
        .entities
        .try_get_data_set(&ctx.session, &data_set.code)
        .await
        .map_err(ContentRegistrationError::Registration)?;
    match existing {
        Some(local) => update_existing(ctx, data_set, local).await,
        None => register_new(ctx, data_set).await,
    }
}

/// Metadata only: properties, owner linkage; parents are kept as they are
/// and reset by the reconciler.
async fn update_existing(
    ctx: &JobContext,
    data_set: NewDataSet,
    local: LocalDataSet,
) -> Result<ContentAction, ContentRegistrationError> {
    let mut batch = OperationBatch {
        user: ctx.settings.user.clone(),
        ..OperationBatch::default()
    };
    batch.data_set_updates.push(DataSetUpdate {
        code: data_set.code,
        version: local.version,
        properties: data_set.properties,
        sample_identifier: data_set.sample_identifier,
        experiment_identifier: data_set.experiment_identifier,
        modified_parent_codes: local.parent_codes,
        modified_contained_codes: None,
    });
    ctx.entities
        .perform_entity_operations(&ctx.session, batch)
        .await
        .map_err(ContentRegistrationError::Update)?;
    Ok(ContentAction::Updated)
}

async fn register_new(ctx: &JobContext, data_set: NewDataSet) -> Result<ContentAction, ContentRegistrationError> {
    let staging = ctx.settings.staging_root.join(&data_set.code);
    if let Err(err) = stage_files(ctx, &data_set.code, &staging).await {
        remove_dir_quietly(&staging).await;
        return Err(err);
    }

    let target = ctx.settings.store_root.join(&data_set.code);
    move_into_store(&staging, &target).await?;

    let mut batch = OperationBatch {
        user: ctx.settings.user.clone(),
        ..OperationBatch::default()
    };
    batch.data_set_registrations.push(data_set);
    if let Err(err) = ctx
        .entities
        .perform_entity_operations(&ctx.session, batch)
        .await
    {
        remove_dir_quietly(&target).await;
        return Err(ContentRegistrationError::Registration(err));
    }
    Ok(ContentAction::Registered)
}

async fn stage_files(ctx: &JobContext, code: &str, staging: &Path) -> Result<(), ContentRegistrationError> {
    let remote_session = ctx
        .files
        .login()
        .await
        .map_err(ContentRegistrationError::Login)?;
    let files = ctx
        .files
        .search_files(&remote_session, code)
        .await
        .map_err(ContentRegistrationError::Listing)?;

    remove_dir_quietly(staging).await;
    create_dir(staging).await?;

    for file in &files {
        let relative = safe_relative_path(&file.path)?;
        let local = staging.join(&relative);
        if file.is_directory {
            create_dir(&local).await?;
            continue;
        }
        if let Some(parent) = local.parent() {
            create_dir(parent).await?;
        }
        download(ctx, &remote_session, code, file, &local).await?;
    }
    tracing::debug!(code, files = files.len(), "data set staged");
    Ok(())
}

async fn download(
    ctx: &JobContext,
    session: &str,
    code: &str,
    file: &DataSetFile,
    local: &Path,
) -> Result<(), ContentRegistrationError> {
    let mut sink = tokio::fs::File::create(local)
        .await
        .map_err(|source| ContentRegistrationError::Staging {
            path: local.to_path_buf(),
            source,
        })?;
    let written = ctx
        .files
        .download_file(session, code, file, &mut sink)
        .await
        .map_err(|source| ContentRegistrationError::Download {
            path: file.path.clone(),
            source,
        })?;
    if written != file.length {
        return Err(ContentRegistrationError::LengthMismatch {
            path: file.path.clone(),
            expected: file.length,
            actual: written,
        });
    }
    Ok(())
}

async fn move_into_store(staging: &Path, target: &Path) -> Result<(), ContentRegistrationError> {
    let move_err = |source| ContentRegistrationError::StorageMove {
        path: target.to_path_buf(),
        source,
    };
    if tokio::fs::try_exists(target).await.map_err(move_err)? {
        // Leftover of an earlier attempt that never got registered.
        tokio::fs::remove_dir_all(target).await.map_err(move_err)?;
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(move_err)?;
    }
    tokio::fs::rename(staging, target).await.map_err(move_err)
}

async fn create_dir(path: &Path) -> Result<(), ContentRegistrationError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| ContentRegistrationError::Staging {
            path: path.to_path_buf(),
            source,
        })
}

async fn remove_dir_quietly(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "cleanup failed"),
    }
}

/// Remote paths are relative and must stay inside the data set directory.
fn safe_relative_path(path: &str) -> Result<PathBuf, ContentRegistrationError> {
    let candidate = Path::new(path.trim_start_matches('/'));
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(ContentRegistrationError::UnsafePath(path.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ContentRegistrationError::UnsafePath(path.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_cannot_escape() {
        assert_eq!(
            safe_relative_path("original/a.tif").unwrap(),
            PathBuf::from("original/a.tif")
        );
        assert_eq!(
            safe_relative_path("/original/./a.tif").unwrap(),
            PathBuf::from("original/a.tif")
        );
        assert!(safe_relative_path("../etc/passwd").is_err());
        assert!(safe_relative_path("original/../../x").is_err());
        assert!(safe_relative_path("").is_err());
    }
}
