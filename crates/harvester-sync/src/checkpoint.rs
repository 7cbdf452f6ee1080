//! Watermark persistence with write-new-then-rename semantics.
//!
//! ```text
//!   load()        begin_run()             commit()
//!   ──────►  T0   ──────────►  T1 → file.new  ──────►  file := T1
//!                                   │
//!                                   └─ abandon(): file.new removed, file stays T0
//! ```
//!
//! The candidate watermark is captured *before* any other work, so anything
//! modified on the remote side while the run is in flight is picked up again
//! by the next run.

use crate::error::{HarvestError, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Format written by older deployments (`dd-MM-yy HH-mm-ss`), read as UTC.
pub const LEGACY_WATERMARK_FORMAT: &str = "%d-%m-%y %H-%M-%S";

pub fn format_watermark(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_watermark(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, LEGACY_WATERMARK_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// The watermark file and its `.new` side file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn side_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".new");
        PathBuf::from(name)
    }

    /// The committed watermark, or the epoch when nothing was ever committed.
    pub fn load(&self) -> Result<DateTime<Utc>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                parse_watermark(&contents).ok_or_else(|| HarvestError::CorruptWatermark {
                    path: self.path.clone(),
                    value: contents.trim().to_string(),
                })
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no watermark file, running a full resync");
                Ok(harvester_manifest::epoch())
            }
            Err(source) => Err(HarvestError::Checkpoint {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn begin_run(&self) -> Result<PendingWatermark> {
        self.begin_run_at(Utc::now())
    }

    /// Write `now` (truncated to milliseconds, the file's precision) to the
    /// side file.
    pub fn begin_run_at(&self, now: DateTime<Utc>) -> Result<PendingWatermark> {
        let timestamp = now.trunc_subsecs(3);
        let side_path = self.side_path();
        if let Some(parent) = side_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| HarvestError::Checkpoint {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&side_path, format_watermark(timestamp)).map_err(|source| {
            HarvestError::Checkpoint {
                path: side_path.clone(),
                source,
            }
        })?;
        tracing::debug!(path = %side_path.display(), timestamp = %format_watermark(timestamp), "candidate watermark written");
        Ok(PendingWatermark {
            timestamp,
            side_path,
            target: self.path.clone(),
        })
    }

    /// Forget the committed watermark; the next run is a full resync.
    pub fn reset(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(HarvestError::Checkpoint {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// A candidate watermark sitting in the side file.
///
/// Consumed by exactly one of [`commit`](Self::commit) or
/// [`abandon`](Self::abandon); dropping it leaves the side file behind, which
/// the next `begin_run` overwrites.
#[must_use = "a pending watermark must be committed or abandoned"]
#[derive(Debug)]
pub struct PendingWatermark {
    timestamp: DateTime<Utc>,
    side_path: PathBuf,
    target: PathBuf,
}

impl PendingWatermark {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Atomically replace the watermark file with the side file.
    pub fn commit(self) -> Result<DateTime<Utc>> {
        fs::rename(&self.side_path, &self.target).map_err(|source| HarvestError::Checkpoint {
            path: self.target.clone(),
            source,
        })?;
        tracing::info!(path = %self.target.display(), watermark = %format_watermark(self.timestamp), "watermark committed");
        Ok(self.timestamp)
    }

    pub fn abandon(self) -> Result<()> {
        match fs::remove_file(&self.side_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HarvestError::Checkpoint {
                path: self.side_path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint(dir: &tempfile::TempDir) -> Checkpoint {
        Checkpoint::new(dir.path().join("last-sync-timestamp-file.txt"))
    }

    #[test]
    fn missing_file_means_epoch() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(checkpoint(&dir).load().unwrap(), harvester_manifest::epoch());
    }

    #[test]
    fn commit_renames_side_file_over_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpoint(&dir);
        let now = Utc.with_ymd_and_hms(2016, 7, 1, 12, 0, 0).unwrap() + Duration::microseconds(1_234_567);

        let pending = cp.begin_run_at(now).unwrap();
        assert!(cp.side_path().exists());
        assert!(!cp.path().exists());
        assert_eq!(pending.timestamp().timestamp_subsec_millis(), 234);

        let committed = pending.commit().unwrap();
        assert!(!cp.side_path().exists());
        assert_eq!(cp.load().unwrap(), committed);
        assert_eq!(
            fs::read_to_string(cp.path()).unwrap(),
            "2016-07-01T12:00:01.234Z"
        );
    }

    #[test]
    fn abandon_keeps_previous_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpoint(&dir);
        let t0 = Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap();
        cp.begin_run_at(t0).unwrap().commit().unwrap();

        let pending = cp.begin_run_at(t0 + Duration::hours(1)).unwrap();
        pending.abandon().unwrap();
        assert!(!cp.side_path().exists());
        assert_eq!(cp.load().unwrap(), t0);
    }

    #[test]
    fn legacy_format_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpoint(&dir);
        fs::write(cp.path(), "30-06-16 10-38-51\n").unwrap();
        assert_eq!(
            cp.load().unwrap(),
            Utc.with_ymd_and_hms(2016, 6, 30, 10, 38, 51).unwrap()
        );
    }

    #[test]
    fn garbage_is_a_corrupt_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpoint(&dir);
        fs::write(cp.path(), "last tuesday").unwrap();
        assert!(matches!(
            cp.load().unwrap_err(),
            HarvestError::CorruptWatermark { .. }
        ));
    }

    #[test]
    fn reset_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpoint(&dir);
        assert!(!cp.reset().unwrap());
        cp.begin_run().unwrap().commit().unwrap();
        assert!(cp.reset().unwrap());
        assert_eq!(cp.load().unwrap(), harvester_manifest::epoch());
    }
}
