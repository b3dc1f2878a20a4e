//! Storage reclamation sweeps
//!
//! Every sweep is idempotent and takes the reference time as a parameter.
//! Nothing is deleted directly: entries are moved to quarantine first and
//! only [`Reclaimer::purge_quarantine`] removes bytes for good.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::history::HistoryResolver;
use crate::metadata::MetadataStore;
use crate::model::{ChangeKind, Project};
use crate::storage::ProjectStorage;
use crate::upload::UploadManager;

/// What one full maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub optimized_files: usize,
    pub temp_entries: usize,
    pub purged_projects: usize,
    pub reaped_uploads: usize,
    pub quarantine_entries: usize,
}

pub struct Reclaimer {
    config: Arc<SyncConfig>,
    metadata: Arc<MetadataStore>,
    storage: Arc<dyn ProjectStorage>,
    history: Arc<HistoryResolver>,
    uploads: Arc<UploadManager>,
}

impl Reclaimer {
    pub fn new(
        config: Arc<SyncConfig>,
        metadata: Arc<MetadataStore>,
        storage: Arc<dyn ProjectStorage>,
        history: Arc<HistoryResolver>,
        uploads: Arc<UploadManager>,
    ) -> Self {
        Self {
            config,
            metadata,
            storage,
            history,
            uploads,
        }
    }

    /// Quarantine expired materialized copies of diff-updated files.
    ///
    /// Only non-current copies are touched. Basefiles and changesets stay,
    /// so every removed copy can be rebuilt by a restore.
    pub async fn optimize_storage(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut moved = 0;
        for project in self.metadata.list_projects(false)? {
            match self.optimize_project(&project, now).await {
                Ok(n) => moved += n,
                Err(e) => {
                    tracing::warn!(project = %project.full_name(), "Optimize failed: {}", e);
                }
            }
        }
        if moved > 0 {
            tracing::info!("Optimized storage: {} files quarantined", moved);
        }
        Ok(moved)
    }

    async fn optimize_project(&self, project: &Project, now: DateTime<Utc>) -> Result<usize> {
        let live: HashSet<&str> = project.files.iter().map(|f| f.location.as_str()).collect();
        let mut moved = 0;
        for file in project.files.iter().filter(|f| f.diff.is_some()) {
            let history = self.history.file_history(project, &file.path, None, None)?;
            for entry in &history.history {
                if entry.change != ChangeKind::Updated || entry.diff.is_none() {
                    continue;
                }
                if live.contains(entry.location.as_str()) {
                    continue;
                }
                let expired = entry.expiration.map(|t| t < now).unwrap_or(false);
                if !expired {
                    continue;
                }
                let path = self.storage.resolve(&project.storage_dir, &entry.location);
                if self.storage.quarantine(&path).await?.is_some() {
                    tracing::debug!(
                        project = %project.full_name(),
                        version = %entry.version,
                        "Reclaimed {}",
                        entry.location
                    );
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    /// Purge global temp entries past the temp expiration.
    pub async fn cleanup_temp(&self, now: DateTime<Utc>) -> Result<usize> {
        self.storage
            .purge_temp(now - self.config.temp_expiration())
            .await
    }

    /// Quarantine data of projects soft-deleted for longer than the
    /// expiration and drop their metadata.
    pub async fn purge_deleted_projects(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.deleted_project_expiration();
        let mut purged = 0;
        for project in self.metadata.list_projects(true)? {
            let Some(removed_at) = project.removed_at else {
                continue;
            };
            if removed_at >= cutoff {
                continue;
            }
            self.storage
                .quarantine(&self.storage.project_root(&project.storage_dir))
                .await?;
            self.metadata.delete_project(project.id)?;
            tracing::info!(project = %project.full_name(), "Purged deleted project");
            purged += 1;
        }
        Ok(purged)
    }

    /// Reap uploads whose lockfile went stale.
    pub async fn reap_stale_uploads(&self) -> Result<usize> {
        self.uploads.reap_stale(None).await
    }

    /// Permanently delete quarantine entries past the grace window.
    pub async fn purge_quarantine(&self, now: DateTime<Utc>) -> Result<usize> {
        self.storage
            .purge_quarantine(now - self.config.quarantine_grace())
            .await
    }

    /// Run every sweep once.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let report = ReclaimReport {
            reaped_uploads: self.reap_stale_uploads().await?,
            optimized_files: self.optimize_storage(now).await?,
            purged_projects: self.purge_deleted_projects(now).await?,
            temp_entries: self.cleanup_temp(now).await?,
            quarantine_entries: self.purge_quarantine(now).await?,
        };
        tracing::info!(?report, "Maintenance pass finished");
        Ok(report)
    }
}
