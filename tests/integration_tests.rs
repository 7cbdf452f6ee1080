//! Integration tests for complete harvester runs
//!
//! Every test drives `Harvester::run_at` against the in-memory collaborators:
//! - resource list → planner → entity batch
//! - attachment synchronizer → ledger
//! - content registrar → managed storage → ledger
//! - relationship reconciler → watermark commit
//!
//! Run with: cargo test --test integration_tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use harvester_manifest::{ConnectionKind, Properties};
use harvester_sync::testing::{
    InMemoryEntityService, InMemoryFileService, ManifestBuilder, StaticManifestSource,
};
use harvester_sync::{
    Checkpoint, HarvestError, Harvester, HarvesterConfig, IdentityMapper, NotSyncedEntities,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

// ============================================================================
// Fixture
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 6, 30, 12, 0, 0).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

fn config(dir: &Path, dry_run: bool) -> HarvesterConfig {
    let toml = format!(
        r#"
[data-source]
server-url = "https://source:8444/datastore_server/re-sync"
openbis-url = "https://source:8443/openbis/openbis"
dss-url = "https://source:8444/datastore_server"
space = "SRC"
prefix = "SRC"
auth-user = "admin"

[destination]
openbis-url = "https://localhost:8443/openbis/openbis"
user = "harvester"

[harvester]
space = "DST"
store-root = "{store}"
last-sync-timestamp-file = "{watermark}"
not-synced-entities-file = "{ledger}"
max-workers = 4
job-timeout-secs = 30
dry-run = {dry_run}
"#,
        store = dir.join("store").display(),
        watermark = dir.join("last-sync-timestamp-file.txt").display(),
        ledger = dir.join("not-synced-entities.txt").display(),
    );
    let config = HarvesterConfig::from_toml_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

struct Fixture {
    dir: TempDir,
    manifest: Arc<StaticManifestSource>,
    entities: Arc<InMemoryEntityService>,
    files: Arc<InMemoryFileService>,
}

impl Fixture {
    fn new(manifest: &ManifestBuilder, files: InMemoryFileService) -> Self {
        Self {
            dir: tempdir().unwrap(),
            manifest: Arc::new(StaticManifestSource::new(manifest.build())),
            entities: Arc::new(InMemoryEntityService::new()),
            files: Arc::new(files),
        }
    }

    fn harvester(&self, dry_run: bool) -> Harvester {
        Harvester::new(
            config(self.dir.path(), dry_run),
            self.manifest.clone(),
            self.entities.clone(),
            self.files.clone(),
            Arc::new(IdentityMapper),
        )
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.dir.path().join("last-sync-timestamp-file.txt"))
    }

    fn ledger(&self) -> NotSyncedEntities {
        NotSyncedEntities::load(self.dir.path().join("not-synced-entities.txt")).unwrap()
    }

    fn store(&self) -> std::path::PathBuf {
        self.dir.path().join("store")
    }
}

/// P1 ─► E1 ─► S1 (Child), E1 ─► D1 (physical)
fn basic_manifest() -> ManifestBuilder {
    manifest_with_d1_at(at(4))
}

fn manifest_with_d1_at(d1_modified: DateTime<Utc>) -> ManifestBuilder {
    ManifestBuilder::new("SRC")
        .project("p1", "P1", at(1))
        .connect("p1", "e1", ConnectionKind::Connection)
        .experiment("e1", "E1", "P1", at(2))
        .connect("e1", "s1", ConnectionKind::Child)
        .connect("e1", "D1", ConnectionKind::Connection)
        .sample("s1", "S1", at(3))
        .data_set("D1", d1_modified)
        .property("COMMENT", "first")
}

fn basic_files() -> InMemoryFileService {
    InMemoryFileService::new()
        .with_data_set("D1", &[("original/a.txt", b"hello"), ("original/b.txt", b"world!")])
        .with_directory("D1", "original")
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn new_project_experiment_sample_and_data_set_are_synchronized() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    let report = fx.harvester(false).run_at(at(60)).await.unwrap();

    assert!(fx.entities.has_project("/DST/P1"));
    assert!(fx.entities.has_experiment("/DST/P1/E1"));
    let s1 = fx.entities.sample("/DST/S1").unwrap();
    assert_eq!(s1.experiment_identifier.as_deref(), Some("/DST/P1/E1"));

    let d1 = fx.entities.data_set("D1").unwrap();
    assert_eq!(d1.experiment_identifier.as_deref(), Some("/DST/P1/E1"));
    assert_eq!(d1.properties["COMMENT"], "first");
    assert!(d1.parent_codes.is_empty());
    assert_eq!(
        std::fs::read(fx.store().join("D1/original/a.txt")).unwrap(),
        b"hello"
    );
    assert!(!fx.store().join("harvester-tmp/D1").exists());

    // entity batch, D1 registration, relationship batch
    let batches = fx.entities.batches();
    assert_eq!(batches.len(), 3);
    assert!(fx.entities.has_space("DST"));
    assert_eq!(
        batches[0].space_registrations[0].description.as_deref(),
        Some("Synchronized from: https://source:8444/datastore_server/re-sync")
    );
    assert_eq!(batches[0].project_registrations.len(), 1);
    assert_eq!(batches[0].experiment_registrations.len(), 1);
    assert!(batches[0].data_set_registrations.is_empty());
    assert_eq!(batches[1].data_set_registrations[0].code, "D1");
    let edge_update = &batches[2].data_set_updates[0];
    assert_eq!(edge_update.code, "D1");
    assert!(edge_update.modified_parent_codes.is_empty());
    assert_eq!(edge_update.modified_contained_codes, None);
    assert!(batches.iter().all(|b| b.user.as_deref() == Some("harvester")));

    assert_eq!(report.content.registered, vec!["D1"]);
    assert!(report.content.failed.is_empty());
    assert_eq!(report.relationship_updates, 1);
    assert_eq!(report.committed_watermark, Some(at(60)));
    assert_eq!(fx.checkpoint().load().unwrap(), at(60));
    assert!(!fx.checkpoint().side_path().exists());
}

#[tokio::test]
async fn data_set_at_the_watermark_is_left_alone() {
    let manifest = ManifestBuilder::new("SRC")
        .project("p1", "P1", at(-10))
        .connect("p1", "e1", ConnectionKind::Connection)
        .experiment("e1", "E1", "P1", at(-10))
        .connect("e1", "D2", ConnectionKind::Connection)
        .connect("e1", "D3", ConnectionKind::Connection)
        .data_set("D2", t0())
        .data_set("D3", at(1))
        .connect("D2", "D3", ConnectionKind::Child);
    let files = InMemoryFileService::new()
        .with_data_set("D2", &[("x", b"2")])
        .with_data_set("D3", &[("x", b"3")]);
    let fx = Fixture::new(&manifest, files);

    // P1/E1 exist already, D2 was harvested by an earlier run.
    let first = fx.harvester(false).run_at(at(-5)).await.unwrap();
    assert_eq!(first.content.registered, vec!["D2", "D3"]);
    fx.checkpoint().begin_run_at(t0()).unwrap().commit().unwrap();
    let before = fx.entities.batches().len();

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();
    assert_eq!(report.content.attempted, vec!["D3"]);
    let new_batches = &fx.entities.batches()[before..];
    for batch in new_batches {
        assert!(batch.data_set_registrations.iter().all(|d| d.code != "D2"));
        assert!(batch.data_set_updates.iter().all(|u| u.code != "D2"));
    }
    // D2's connection still feeds D3's parents.
    assert_eq!(fx.entities.data_set("D3").unwrap().parent_codes, vec!["D2"]);
}

#[tokio::test]
async fn failed_batch_keeps_the_previous_watermark() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    fx.checkpoint().begin_run_at(t0()).unwrap().commit().unwrap();

    fx.entities.fail_next_batches(1);
    let err = fx.harvester(false).run_at(at(60)).await.unwrap_err();
    assert!(matches!(err, HarvestError::BatchSubmission(_)));
    assert_eq!(fx.checkpoint().load().unwrap(), t0());
    assert!(!fx.checkpoint().side_path().exists());
    assert!(!fx.entities.has_project("/DST/P1"));

    // The same window is reconsidered and everything lands.
    let report = fx.harvester(false).run_at(at(61)).await.unwrap();
    assert!(fx.entities.has_project("/DST/P1"));
    assert_eq!(report.content.registered, vec!["D1"]);
    assert_eq!(fx.checkpoint().load().unwrap(), at(61));
}

#[tokio::test]
async fn unreachable_source_aborts_before_anything_is_written() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    fx.manifest.set_failing(true);

    let err = fx.harvester(false).run_at(at(60)).await.unwrap_err();
    assert!(matches!(err, HarvestError::ManifestFetch(_)));
    assert!(fx.entities.batches().is_empty());
    assert!(!fx.checkpoint().path().exists());
    assert!(!fx.checkpoint().side_path().exists());
}

#[tokio::test]
async fn malformed_resource_list_is_fatal() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    fx.manifest.set("<urlset><url><loc>https://x/PROJECT/1/M</loc></url></urlset>");

    let err = fx.harvester(false).run_at(at(60)).await.unwrap_err();
    assert!(matches!(err, HarvestError::ManifestFormat(_)));
    assert!(!fx.checkpoint().path().exists());
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    let harvester = fx.harvester(false);
    let runs = [at(60), at(120), at(180)];

    let mut previous = harvester_manifest::epoch();
    for now in runs {
        let report = harvester.run_at(now).await.unwrap();
        let committed = report.committed_watermark.unwrap();
        assert!(committed >= previous);
        assert_eq!(committed, now);
        previous = committed;
    }
    assert_eq!(fx.checkpoint().load().unwrap(), at(180));
    // Nothing changed remotely after the first run.
    assert_eq!(fx.entities.data_set("D1").unwrap().version, 2);
}

#[tokio::test]
async fn re_touched_data_set_is_updated_without_transfer() {
    let files = basic_files().with_data_set("D0", &[("raw.bin", b"0")]);
    let fx = Fixture::new(&basic_manifest(), files);
    fx.harvester(false).run_at(at(60)).await.unwrap();
    let downloads = fx.files.downloads().len();

    fx.manifest.set(
        manifest_with_d1_at(at(70))
            .connect("e1", "D0", ConnectionKind::Connection)
            .data_set("D0", at(70))
            .connect("D0", "D1", ConnectionKind::Child)
            .build(),
    );
    let report = fx.harvester(false).run_at(at(120)).await.unwrap();

    assert_eq!(report.content.registered, vec!["D0"]);
    assert_eq!(report.content.updated, vec!["D1"]);
    let transferred = &fx.files.downloads()[downloads..];
    assert_eq!(transferred, ["D0/raw.bin".to_string()]);
    assert_eq!(fx.entities.data_set("D1").unwrap().parent_codes, vec!["D0"]);
}

#[tokio::test]
async fn properties_dropped_remotely_are_cleared() {
    let sample_with = |modified: DateTime<Utc>, properties: &[(&str, &str)]| {
        let mut builder = ManifestBuilder::new("SRC")
            .project("p1", "P1", at(1))
            .sample("s1", "S1", modified);
        for (code, value) in properties {
            builder = builder.property(code, value);
        }
        builder
    };
    let fx = Fixture::new(
        &sample_with(at(3), &[("COLOR", "red"), ("SIZE", "96")]),
        InMemoryFileService::new(),
    );
    fx.harvester(false).run_at(at(60)).await.unwrap();
    assert_eq!(fx.entities.sample("/DST/S1").unwrap().properties.len(), 2);

    fx.manifest.set(sample_with(at(70), &[("COLOR", "blue")]).build());
    fx.harvester(false).run_at(at(120)).await.unwrap();

    let expected: Properties = [("COLOR".to_string(), "blue".to_string())].into();
    assert_eq!(fx.entities.sample("/DST/S1").unwrap().properties, expected);
}

// ============================================================================
// Content registrar isolation and the retry ledger
// ============================================================================

/// S1 ─► D1..D5; D1 ─► D2 and D3 ─► D4 (parent → child)
fn five_data_sets() -> ManifestBuilder {
    let mut builder = ManifestBuilder::new("SRC")
        .project("p1", "P1", at(1))
        .sample("s1", "S1", at(1));
    for i in 1..=5 {
        builder = builder.connect("s1", &format!("D{i}"), ConnectionKind::Connection);
    }
    for i in 1..=5 {
        builder = builder.data_set(&format!("D{i}"), at(2));
    }
    builder
        .connect("D1", "D2", ConnectionKind::Child)
        .connect("D3", "D4", ConnectionKind::Child)
}

fn five_files() -> InMemoryFileService {
    let mut files = InMemoryFileService::new();
    for i in 1..=5 {
        files = files.with_data_set(&format!("D{i}"), &[("data.bin", b"0123456789")]);
    }
    files
}

#[tokio::test]
async fn one_failing_download_does_not_stop_the_others() {
    let fx = Fixture::new(&five_data_sets(), five_files());
    fx.files.fail_downloads_for("D3");

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();

    assert_eq!(report.content.attempted.len(), 5);
    assert_eq!(report.content.success_count(), 4);
    assert_eq!(report.content.failed_codes().collect::<Vec<_>>(), vec!["D3"]);
    assert!(fx.entities.data_set("D3").is_none());
    assert!(!fx.store().join("D3").exists());

    // Edges were still reconciled for the four that made it.
    assert_eq!(report.relationship_updates, 4);
    assert_eq!(report.relationship_skipped, vec!["D3"]);
    assert_eq!(fx.entities.data_set("D2").unwrap().parent_codes, vec!["D1"]);
    assert!(fx.entities.data_set("D4").unwrap().parent_codes.is_empty());
    for code in ["D1", "D2", "D4", "D5"] {
        let ds = fx.entities.data_set(code).unwrap();
        assert_eq!(ds.sample_identifier.as_deref(), Some("/DST/S1"));
    }

    // The failure is remembered and the run still commits.
    assert!(fx.ledger().retry().contains("D3"));
    assert_eq!(fx.checkpoint().load().unwrap(), at(60));

    // Next run retries D3 although it is older than the watermark, and its
    // child picks up the parent edge.
    fx.files.heal("D3");
    let retry = fx.harvester(false).run_at(at(120)).await.unwrap();
    assert_eq!(retry.content.attempted, vec!["D3"]);
    assert_eq!(retry.content.registered, vec!["D3"]);
    assert!(fx.entities.data_set("D3").is_some());
    assert_eq!(fx.entities.data_set("D4").unwrap().parent_codes, vec!["D3"]);
    assert!(fx.ledger().retry().is_empty());
    assert!(fx.ledger().backup_path().exists());
}

#[tokio::test]
async fn short_download_fails_only_that_data_set() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    fx.files.misreport_length("D1");

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();
    let reason = &report.content.failed["D1"];
    assert!(reason.contains("expected"), "{reason}");
    assert!(!fx.store().join("harvester-tmp/D1").exists());
    assert!(fx.entities.data_set("D1").is_none());
    assert!(fx.entities.has_experiment("/DST/P1/E1"));
}

#[tokio::test]
async fn black_listed_data_set_is_never_touched() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    std::fs::write(
        fx.dir.path().join("not-synced-entities.txt"),
        "#DATA_SET-D1\n",
    )
    .unwrap();

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();
    assert!(report.content.attempted.is_empty());
    assert_eq!(report.black_listed, 1);
    assert!(fx.entities.data_set("D1").is_none());
    assert!(fx.ledger().black_listed().contains("D1"));
}

#[tokio::test]
async fn container_is_registered_with_its_components() {
    let manifest = basic_manifest()
        .data_set("D2", at(4))
        .container("BOX", at(5))
        .connect("BOX", "D1", ConnectionKind::Component)
        .connect("BOX", "D2", ConnectionKind::Component)
        .connect("e1", "D2", ConnectionKind::Connection)
        .connect("e1", "BOX", ConnectionKind::Connection);
    let files = basic_files().with_data_set("D2", &[("x", b"2")]);
    let fx = Fixture::new(&manifest, files);

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();
    assert_eq!(report.container_registrations, 1);
    let container = fx.entities.data_set("BOX").unwrap();
    assert!(container.is_container);
    assert_eq!(container.contained_codes, vec!["D1", "D2"]);
    assert_eq!(report.content.attempted, vec!["D1", "D2"]);
}

// ============================================================================
// Attachments
// ============================================================================

/// P1 ─► E1, E1 holding attachments
fn attachment_manifest(e1_modified: DateTime<Utc>) -> ManifestBuilder {
    ManifestBuilder::new("SRC")
        .project("p1", "P1", at(1))
        .connect("p1", "e1", ConnectionKind::Connection)
        .experiment("e1", "E1", "P1", e1_modified)
        .attachments()
}

#[tokio::test]
async fn attachments_follow_the_source() {
    let files = InMemoryFileService::new()
        .with_attachment("e1", "a.txt", at(2), b"alpha")
        .with_attachment("e1", "b.txt", at(2), b"beta");
    let fx = Fixture::new(&attachment_manifest(at(2)), files);

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();
    // P1 is new and has no attachments, so only E1 is looked at.
    assert_eq!(report.attachments.attempted, vec!["EXPERIMENT-e1"]);
    assert_eq!(report.attachments.added, 2);
    assert_eq!(fx.entities.attachment_names("/DST/P1/E1"), vec!["a.txt", "b.txt"]);
    let a = fx.entities.attachment("/DST/P1/E1", "a.txt").unwrap();
    assert_eq!(a.content, b"alpha");
    assert_eq!(a.attachment.version, 1);

    fx.files.put_attachment("e1", "a.txt", at(70), b"alpha v2");
    fx.files.remove_attachment("e1", "b.txt");
    fx.manifest.set(attachment_manifest(at(70)).build());
    let report = fx.harvester(false).run_at(at(120)).await.unwrap();

    assert_eq!(report.attachments.added, 0);
    assert_eq!(report.attachments.updated, 1);
    assert_eq!(report.attachments.deleted, 1);
    assert_eq!(fx.entities.attachment_names("/DST/P1/E1"), vec!["a.txt"]);
    let a = fx.entities.attachment("/DST/P1/E1", "a.txt").unwrap();
    assert_eq!(a.content, b"alpha v2");
    assert_eq!(a.attachment.version, 2);
    assert!(fx.files.downloads().contains(&"e1/a.txt@2".to_string()));
}

#[tokio::test]
async fn failed_attachment_holder_is_retried_next_run() {
    let files = InMemoryFileService::new().with_attachment("e1", "a.txt", at(2), b"alpha");
    let fx = Fixture::new(&attachment_manifest(at(2)), files);
    fx.files.fail_downloads_for("e1");

    let report = fx.harvester(false).run_at(at(60)).await.unwrap();
    let reason = &report.attachments.failed["EXPERIMENT-e1"];
    assert!(reason.contains("a.txt"), "{reason}");
    assert!(fx.entities.has_experiment("/DST/P1/E1"));
    assert!(fx.entities.attachment_names("/DST/P1/E1").is_empty());
    assert!(fx.ledger().attachment_retry().contains("EXPERIMENT-e1"));
    assert_eq!(fx.checkpoint().load().unwrap(), at(60));

    // E1 is older than the watermark now; only the ledger brings it back.
    fx.files.heal("e1");
    let retry = fx.harvester(false).run_at(at(120)).await.unwrap();
    assert_eq!(retry.attachments.attempted, vec!["EXPERIMENT-e1"]);
    assert_eq!(retry.attachments.added, 1);
    assert!(retry.attachments.failed.is_empty());
    assert!(fx.ledger().attachment_retry().is_empty());
}

// ============================================================================
// Dry run
// ============================================================================

#[tokio::test]
async fn dry_run_writes_nothing() {
    let fx = Fixture::new(&basic_manifest(), basic_files());
    let report = fx.harvester(true).run_at(at(60)).await.unwrap();

    assert!(report.dry_run);
    // DST, P1, E1, S1
    assert_eq!(report.entity_registrations, 4);
    assert_eq!(report.content.attempted, vec!["D1"]);
    assert!(report.committed_watermark.is_none());
    assert!(fx.entities.batches().is_empty());
    assert!(fx.files.downloads().is_empty());
    assert!(!fx.checkpoint().path().exists());
    assert!(!fx.checkpoint().side_path().exists());
    assert!(!fx.dir.path().join("not-synced-entities.txt").exists());
}
