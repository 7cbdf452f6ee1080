//! Not-synced entities file: data sets to retry, data sets to leave alone,
//! and attachment holders whose attachments failed to synchronize.
//!
//! ```text
//! DATA_SET-20160630100000000-5     retried next run, whatever the watermark
//! #DATA_SET-20160630100000000-9    black-listed: never registered or updated
//! EXPERIMENT-20160630100000000-2   attachments retried next run
//! ```
//!
//! Lines of any other shape are kept as they are when the file is rewritten.

use crate::error::{HarvestError, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const DATA_SET_PREFIX: &str = "DATA_SET-";
const HOLDER_PREFIXES: [&str; 3] = ["PROJECT-", "EXPERIMENT-", "SAMPLE-"];
const BLACK_LIST_MARK: char = '#';

#[derive(Debug, Clone, Default)]
pub struct NotSyncedEntities {
    path: PathBuf,
    retry: HashSet<String>,
    black_listed: HashSet<String>,
    /// Whole keys, `EXPERIMENT-<permId>`.
    attachment_retry: HashSet<String>,
    other: Vec<String>,
}

impl NotSyncedEntities {
    /// A missing file is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(source) => return Err(HarvestError::Ledger { path, source }),
        };
        let mut ledger = Self::parse(&contents);
        ledger.path = path;
        if !ledger.retry.is_empty()
            || !ledger.black_listed.is_empty()
            || !ledger.attachment_retry.is_empty()
        {
            tracing::info!(
                path = %ledger.path.display(),
                retry = ledger.retry.len(),
                black_listed = ledger.black_listed.len(),
                attachment_retry = ledger.attachment_retry.len(),
                "loaded not-synced entities"
            );
        }
        Ok(ledger)
    }

    pub fn parse(contents: &str) -> Self {
        let mut ledger = Self::default();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix(BLACK_LIST_MARK) {
                match rest.trim().strip_prefix(DATA_SET_PREFIX) {
                    Some(code) => {
                        ledger.black_listed.insert(code.to_string());
                    }
                    None => ledger.other.push(line.to_string()),
                }
            } else if let Some(code) = line.strip_prefix(DATA_SET_PREFIX) {
                ledger.retry.insert(code.to_string());
            } else if HOLDER_PREFIXES.iter().any(|p| line.starts_with(p)) {
                ledger.attachment_retry.insert(line.to_string());
            } else {
                tracing::warn!(line, "keeping not-synced entry of unknown kind");
                ledger.other.push(line.to_string());
            }
        }
        ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retry(&self) -> &HashSet<String> {
        &self.retry
    }

    pub fn black_listed(&self) -> &HashSet<String> {
        &self.black_listed
    }

    /// Holder keys whose attachments are retried this run.
    pub fn attachment_retry(&self) -> &HashSet<String> {
        &self.attachment_retry
    }

    /// Rewrite the file with this run's failures, then the lines this ledger
    /// does not interpret, then the black-list. The previous content is
    /// copied to `<file>.bk` first.
    ///
    /// `failed_holders` are whole keys (`SAMPLE-<permId>`).
    pub fn save<'a>(
        &self,
        failed: impl IntoIterator<Item = &'a str>,
        failed_holders: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        if self.path.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup).map_err(|source| HarvestError::Ledger {
                path: backup.clone(),
                source,
            })?;
        }
        let failed: BTreeSet<&str> = failed.into_iter().collect();
        let failed_holders: BTreeSet<&str> = failed_holders.into_iter().collect();
        let black_listed: BTreeSet<&str> = self.black_listed.iter().map(String::as_str).collect();

        let mut contents = String::new();
        for code in &failed {
            contents.push_str(DATA_SET_PREFIX);
            contents.push_str(code);
            contents.push('\n');
        }
        for key in &failed_holders {
            contents.push_str(key);
            contents.push('\n');
        }
        for line in &self.other {
            contents.push_str(line);
            contents.push('\n');
        }
        for code in &black_listed {
            contents.push(BLACK_LIST_MARK);
            contents.push_str(DATA_SET_PREFIX);
            contents.push_str(code);
            contents.push('\n');
        }
        fs::write(&self.path, contents).map_err(|source| HarvestError::Ledger {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(
            path = %self.path.display(),
            failed = failed.len(),
            failed_holders = failed_holders.len(),
            "not-synced entities saved"
        );
        Ok(())
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bk");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_and_black_list_lines() {
        let ledger = NotSyncedEntities::parse(
            "DATA_SET-A\n#DATA_SET-B\n\n  DATA_SET-C  \nSAMPLE-/DST/S1\n",
        );
        assert_eq!(ledger.retry().len(), 2);
        assert!(ledger.retry().contains("A"));
        assert!(ledger.retry().contains("C"));
        assert!(ledger.black_listed().contains("B"));
        assert!(!ledger.black_listed().contains("A"));
        assert!(ledger.attachment_retry().contains("SAMPLE-/DST/S1"));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = NotSyncedEntities::load(dir.path().join("none.txt")).unwrap();
        assert!(ledger.retry().is_empty());
        assert!(ledger.black_listed().is_empty());
    }

    #[test]
    fn save_backs_up_and_keeps_black_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-synced.txt");
        fs::write(&path, "DATA_SET-OLD\n#DATA_SET-BAD\n").unwrap();

        let ledger = NotSyncedEntities::load(&path).unwrap();
        ledger.save(["NEW-2", "NEW-1"], Vec::<&str>::new()).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "DATA_SET-NEW-1\nDATA_SET-NEW-2\n#DATA_SET-BAD\n"
        );
        assert_eq!(
            fs::read_to_string(ledger.backup_path()).unwrap(),
            "DATA_SET-OLD\n#DATA_SET-BAD\n"
        );

        let reloaded = NotSyncedEntities::load(&path).unwrap();
        assert!(reloaded.retry().contains("NEW-1"));
        assert!(!reloaded.retry().contains("OLD"));
        assert!(reloaded.black_listed().contains("BAD"));
    }

    #[test]
    fn holder_failures_are_written_and_unknown_lines_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-synced.txt");
        fs::write(
            &path,
            "EXPERIMENT-OLD\nMATERIAL-GENE_1\n#SAMPLE-KEEP\n#DATA_SET-BAD\n",
        )
        .unwrap();

        let ledger = NotSyncedEntities::load(&path).unwrap();
        assert!(ledger.attachment_retry().contains("EXPERIMENT-OLD"));
        ledger
            .save(["D1"], ["SAMPLE-S1", "EXPERIMENT-E1"])
            .unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "DATA_SET-D1\nEXPERIMENT-E1\nSAMPLE-S1\nMATERIAL-GENE_1\n#SAMPLE-KEEP\n#DATA_SET-BAD\n"
        );
        let reloaded = NotSyncedEntities::load(&path).unwrap();
        assert!(!reloaded.attachment_retry().contains("EXPERIMENT-OLD"));
        assert!(reloaded.attachment_retry().contains("SAMPLE-S1"));
    }
}
