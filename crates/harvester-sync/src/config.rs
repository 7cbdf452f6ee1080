//! Harvester configuration (TOML).
//!
//! ```toml
//! [data-source]
//! server-url = "https://source:8444/datastore_server/re-sync"
//! space = "SRC"
//! ...
//! [destination]
//! openbis-url = "https://localhost:8443/openbis/openbis"
//! ...
//! [harvester]
//! space = "DST"
//! store-root = "/data/store"
//! ```
//!
//! Secrets can be supplied through `HARVESTER_AUTH_PASS` and
//! `HARVESTER_DESTINATION_PASS` instead of the file.

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const ENV_AUTH_PASS: &str = "HARVESTER_AUTH_PASS";
pub const ENV_DESTINATION_PASS: &str = "HARVESTER_DESTINATION_PASS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HarvesterConfig {
    pub data_source: DataSourceConfig,
    pub destination: DestinationConfig,
    pub harvester: HarvestSettings,
}

/// The remote system entities are pulled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataSourceConfig {
    /// Resource-list endpoint (`?verb=resourcelist.xml&space=` is appended).
    pub server_url: String,
    /// Remote application server (entity service).
    pub openbis_url: String,
    /// Remote data store server (file service).
    pub dss_url: String,
    /// Remote namespace to pull from.
    pub space: String,
    /// Source prefix used in the identifier-mapping table.
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_realm")]
    pub auth_realm: String,
    pub auth_user: String,
    #[serde(default)]
    pub auth_pass: String,
    #[serde(default)]
    pub trust_any_certificate: bool,
}

/// The local system entities are written into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestinationConfig {
    pub openbis_url: String,
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub trust_any_certificate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HarvestSettings {
    /// Local namespace to pull into.
    pub space: String,
    /// Managed storage root; staged downloads live under `store-root/tmp-dir`.
    pub store_root: PathBuf,
    pub tmp_dir: String,
    pub last_sync_timestamp_file: PathBuf,
    pub not_synced_entities_file: PathBuf,
    /// SQLite file holding the identifier-mapping table. Without it every
    /// lookup is the identity.
    pub mapping_db: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub job_timeout_secs: u64,
    /// Fraction of available parallelism used by the content registrar.
    pub machine_load: f64,
    pub max_workers: usize,
    pub dry_run: bool,
    pub verbose: bool,
}

fn default_realm() -> String {
    "OAI-PMH".to_string()
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            space: String::new(),
            store_root: PathBuf::from("store"),
            tmp_dir: "harvester-tmp".to_string(),
            last_sync_timestamp_file: PathBuf::from("last-sync-timestamp-file.txt"),
            not_synced_entities_file: PathBuf::from("not-synced-entities.txt"),
            mapping_db: None,
            http_timeout_secs: 10,
            job_timeout_secs: 600,
            machine_load: 0.5,
            max_workers: 10,
            dry_run: false,
            verbose: false,
        }
    }
}

impl HarvesterConfig {
    /// Read, apply env overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&contents).map_err(|e| match e {
            HarvestError::Config(msg) => {
                HarvestError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| HarvestError::Config(e.to_string()))
    }

    /// `lookup` is `std::env::var` in production; tests pass a closure.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(pass) = lookup(ENV_AUTH_PASS) {
            self.data_source.auth_pass = pass;
        }
        if let Some(pass) = lookup(ENV_DESTINATION_PASS) {
            self.destination.pass = pass;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("data-source.server-url", &self.data_source.server_url),
            ("data-source.openbis-url", &self.data_source.openbis_url),
            ("data-source.dss-url", &self.data_source.dss_url),
            ("data-source.space", &self.data_source.space),
            ("data-source.auth-user", &self.data_source.auth_user),
            ("destination.openbis-url", &self.destination.openbis_url),
            ("destination.user", &self.destination.user),
            ("harvester.space", &self.harvester.space),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(HarvestError::Config(format!("`{key}` must not be empty")));
            }
        }
        for (key, value) in [
            ("data-source.server-url", &self.data_source.server_url),
            ("data-source.openbis-url", &self.data_source.openbis_url),
            ("data-source.dss-url", &self.data_source.dss_url),
            ("destination.openbis-url", &self.destination.openbis_url),
        ] {
            Url::parse(value)
                .map_err(|e| HarvestError::Config(format!("`{key}` is not a URL: {e}")))?;
        }
        let load = self.harvester.machine_load;
        if !(load > 0.0 && load <= 1.0) {
            return Err(HarvestError::Config(format!(
                "`harvester.machine-load` must be in (0, 1], got {load}"
            )));
        }
        if self.harvester.max_workers == 0 {
            return Err(HarvestError::Config(
                "`harvester.max-workers` must be at least 1".to_string(),
            ));
        }
        if self.harvester.tmp_dir.trim().is_empty() {
            return Err(HarvestError::Config(
                "`harvester.tmp-dir` must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `<server-url>?verb=resourcelist.xml&space=<remote space>`
    pub fn resource_list_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.data_source.server_url)
            .map_err(|e| HarvestError::Config(format!("`data-source.server-url`: {e}")))?;
        url.query_pairs_mut()
            .append_pair("verb", "resourcelist.xml")
            .append_pair("space", &self.data_source.space);
        Ok(url)
    }
}

impl HarvestSettings {
    pub fn staging_root(&self) -> PathBuf {
        self.store_root.join(&self.tmp_dir)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
