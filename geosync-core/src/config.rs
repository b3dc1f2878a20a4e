//! Engine configuration.
//!
//! Stored as `geosync.json` in the data root. A missing file means defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Name of the config file inside the data root.
pub const CONFIG_FILE: &str = "geosync.json";

/// Configuration for the sync engine and its background sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory for projects, metadata, temp and quarantine.
    pub data_root: PathBuf,
    /// Maximum size of a single uploaded chunk in bytes.
    pub max_chunk_size: u64,
    /// A transaction whose lockfile is older than this is considered dead.
    pub lockfile_expiration_secs: u64,
    /// How often an in-progress chunk write refreshes the lockfile.
    pub lockfile_refresh_secs: u64,
    /// Materialized copies of diff-updated files older than this may be reclaimed.
    pub file_expiration_secs: u64,
    /// Entries in the global temp root older than this are purged.
    pub temp_expiration_secs: u64,
    /// Soft-deleted projects older than this are purged.
    pub deleted_project_expiration_secs: u64,
    /// Quarantined entries older than this are deleted permanently.
    pub quarantine_grace_secs: u64,
    /// Glob patterns of paths never accepted into a project.
    pub blacklist: Vec<String>,
    /// Extensions handled by the changeset engine.
    pub diffable_extensions: Vec<String>,
    /// Storage limit in bytes for namespaces without an explicit limit.
    pub default_storage_limit: u64,
    /// Per-namespace storage limits in bytes.
    pub storage_limits: HashMap<String, u64>,
    /// Reject uploads whose assembled checksum differs from the declared one.
    pub verify_checksums: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            max_chunk_size: 10 * 1024 * 1024,
            lockfile_expiration_secs: 300,
            lockfile_refresh_secs: 30,
            file_expiration_secs: 48 * 3600,
            temp_expiration_secs: 7 * 24 * 3600,
            deleted_project_expiration_secs: 7 * 24 * 3600,
            quarantine_grace_secs: 14 * 24 * 3600,
            blacklist: vec![
                ".mergin/".to_string(),
                ".DS_Store".to_string(),
                "~$*".to_string(),
                "*.gpkg-shm".to_string(),
                "*.gpkg-wal".to_string(),
                "*.qgs~".to_string(),
                "*.qgz~".to_string(),
                "*.pyc".to_string(),
                "*.swap".to_string(),
            ],
            diffable_extensions: vec![".gpkg".to_string(), ".sqlite".to_string()],
            default_storage_limit: 100 * 1024 * 1024,
            storage_limits: HashMap::new(),
            verify_checksums: false,
        }
    }
}

impl SyncConfig {
    /// Defaults rooted at `data_root`.
    pub fn with_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    /// Load config from a data root. `data_root` in the file is ignored in
    /// favour of the directory it was loaded from.
    pub fn load(data_root: &Path) -> Result<Self> {
        let config_path = data_root.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let data = fs::read_to_string(&config_path)?;
            serde_json::from_str::<SyncConfig>(&data)?
        } else {
            Self::default()
        };
        config.data_root = data_root.to_path_buf();
        Ok(config)
    }

    /// Save config into its data root.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_root)?;
        let config_path = self.data_root.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.data_root.join("projects")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_root.join("tmp")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_root.join("quarantine")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.data_root.join("hooks")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_root.join("metadata.sqlite")
    }

    pub fn storage_limit(&self, namespace: &str) -> u64 {
        self.storage_limits
            .get(namespace)
            .copied()
            .unwrap_or(self.default_storage_limit)
    }

    pub fn lockfile_expiration(&self) -> Duration {
        Duration::from_secs(self.lockfile_expiration_secs)
    }

    pub fn lockfile_refresh(&self) -> Duration {
        Duration::from_secs(self.lockfile_refresh_secs.max(1))
    }

    pub fn file_expiration(&self) -> chrono::Duration {
        secs(self.file_expiration_secs)
    }

    pub fn temp_expiration(&self) -> chrono::Duration {
        secs(self.temp_expiration_secs)
    }

    pub fn deleted_project_expiration(&self) -> chrono::Duration {
        secs(self.deleted_project_expiration_secs)
    }

    pub fn quarantine_grace(&self) -> chrono::Duration {
        secs(self.quarantine_grace_secs)
    }
}

fn secs(s: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000))
}
