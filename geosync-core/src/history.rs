//! File history and reconstruction of historical file versions
//!
//! History is resolved by walking the version chain backwards and following
//! renames. It stops at the version where the file was created from full
//! bytes or removed.
//!
//! Restoring a file rebuilds a reclaimed copy of a diff-updated file from
//! the nearest full copy plus the changesets recorded after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::changeset::{ChangesetCache, ChangesetEngine, ChangesetSummary, RowChange};
use crate::error::{Result, SyncError};
use crate::metadata::MetadataStore;
use crate::model::{ChangeKind, ChangeRef, FileDiff, Project, ProjectVersion, VersionName};
use crate::paths::{is_diffable, normalize_path};
use crate::storage::ProjectStorage;

/// One version that touched a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: VersionName,
    pub change: ChangeKind,
    /// Path of the file as of this version
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<FileDiff>,
    /// Previous path, for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    /// After this moment the materialized copy may be reclaimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    pub author: String,
    pub created: DateTime<Utc>,
}

impl HistoryEntry {
    /// Whether this entry holds full bytes rather than a diff.
    pub fn is_basefile(&self) -> bool {
        matches!(self.change, ChangeKind::Added | ChangeKind::Updated) && self.diff.is_none()
    }
}

/// History of one file, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    pub path: String,
    pub history: Vec<HistoryEntry>,
}

impl FileHistory {
    pub fn get(&self, version: VersionName) -> Option<&HistoryEntry> {
        self.history.iter().find(|e| e.version == version)
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Walk `versions` (oldest first) backwards collecting changes to `path`.
pub fn resolve_history(
    versions: &[ProjectVersion],
    path: &str,
    retention: chrono::Duration,
) -> Vec<HistoryEntry> {
    let mut tracked = path.to_string();
    let mut history = Vec::new();
    for version in versions.iter().rev() {
        let Some((kind, change)) = version.changes.find(&tracked) else {
            continue;
        };
        match change {
            ChangeRef::Rename(rename) => {
                let current = version.file(&rename.new_path);
                history.push(HistoryEntry {
                    version: version.name,
                    change: kind,
                    path: rename.new_path.clone(),
                    size: current.map(|f| f.size).unwrap_or(0),
                    checksum: current.map(|f| f.checksum.clone()).unwrap_or_default(),
                    location: current.map(|f| f.location.clone()).unwrap_or_default(),
                    diff: None,
                    renamed_from: Some(rename.path.clone()),
                    expiration: None,
                    author: version.author.clone(),
                    created: version.created,
                });
                tracked = rename.path.clone();
            }
            ChangeRef::File(file) => {
                let expiration = file.diff.as_ref().map(|_| version.created + retention);
                history.push(HistoryEntry {
                    version: version.name,
                    change: kind,
                    path: file.path.clone(),
                    size: file.size,
                    checksum: file.checksum.clone(),
                    location: file.location.clone(),
                    diff: file.diff.clone(),
                    renamed_from: None,
                    expiration,
                    author: version.author.clone(),
                    created: version.created,
                });
                let stop = match kind {
                    ChangeKind::Removed => true,
                    ChangeKind::Added => file.diff.is_none(),
                    _ => false,
                };
                if stop {
                    break;
                }
            }
        }
    }
    history
}

/// Reads file histories and changeset products, restores reclaimed files
pub struct HistoryResolver {
    metadata: Arc<MetadataStore>,
    storage: Arc<dyn ProjectStorage>,
    changesets: Arc<dyn ChangesetEngine>,
    diffable_extensions: Vec<String>,
    file_expiration: chrono::Duration,
}

impl HistoryResolver {
    pub fn new(
        metadata: Arc<MetadataStore>,
        storage: Arc<dyn ProjectStorage>,
        changesets: Arc<dyn ChangesetEngine>,
        diffable_extensions: Vec<String>,
        file_expiration: chrono::Duration,
    ) -> Self {
        Self {
            metadata,
            storage,
            changesets,
            diffable_extensions,
            file_expiration,
        }
    }

    /// History of `path` within `[since, until]`. Defaults span the whole
    /// chain up to the latest version. Non-diffable files have no history.
    pub fn file_history(
        &self,
        project: &Project,
        path: &str,
        since: Option<VersionName>,
        until: Option<VersionName>,
    ) -> Result<FileHistory> {
        let path = normalize_path(path)?;
        let until = until.unwrap_or(project.latest_version);
        let since = since.unwrap_or(VersionName::new(1));
        if until > project.latest_version {
            return Err(SyncError::VersionNotFound(until.to_string()));
        }
        if since > until {
            return Err(SyncError::InvalidVersion(format!("{}..{}", since, until)));
        }
        if !is_diffable(&path, &self.diffable_extensions) {
            return Ok(FileHistory {
                path,
                history: Vec::new(),
            });
        }
        let versions = self.metadata.list_versions(project.id, since, until)?;
        let history = resolve_history(&versions, &path, self.file_expiration);
        Ok(FileHistory { path, history })
    }

    fn changeset_location(&self, project: &Project, version: VersionName, path: &str) -> Result<PathBuf> {
        let record = self.metadata.get_version(project.id, version)?;
        let diff = record
            .changes
            .updated
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| f.diff.as_ref())
            .ok_or_else(|| SyncError::NoChangeset {
                path: path.to_string(),
                version: version.to_string(),
            })?;
        Ok(self.storage.resolve(&project.storage_dir, &diff.location))
    }

    /// Per-table counts of the changeset stored for `path` at `version`.
    pub async fn changeset_summary(
        &self,
        project: &Project,
        version: VersionName,
        path: &str,
    ) -> Result<ChangesetSummary> {
        let path = normalize_path(path)?;
        let cache = ChangesetCache::new(self.storage.project_root(&project.storage_dir));
        if let Some(summary) = cache.load(version, &path, ChangesetCache::SUMMARY) {
            return Ok(summary);
        }
        let diff_file = self.changeset_location(project, version, &path)?;
        let engine = self.changesets.clone();
        let summary = tokio::task::spawn_blocking(move || engine.summarize(&diff_file)).await??;
        if let Err(e) = cache.store(version, &path, ChangesetCache::SUMMARY, &summary) {
            tracing::warn!("Failed to cache changeset summary for {}: {}", path, e);
        }
        Ok(summary)
    }

    /// Row-level changes of the changeset stored for `path` at `version`.
    pub async fn changeset_changes(
        &self,
        project: &Project,
        version: VersionName,
        path: &str,
    ) -> Result<Vec<RowChange>> {
        let path = normalize_path(path)?;
        let cache = ChangesetCache::new(self.storage.project_root(&project.storage_dir));
        if let Some(changes) = cache.load(version, &path, ChangesetCache::CHANGES) {
            return Ok(changes);
        }
        let diff_file = self.changeset_location(project, version, &path)?;
        let engine = self.changesets.clone();
        let changes = tokio::task::spawn_blocking(move || engine.list_changes(&diff_file)).await??;
        if let Err(e) = cache.store(version, &path, ChangesetCache::CHANGES, &changes) {
            tracing::warn!("Failed to cache changeset listing for {}: {}", path, e);
        }
        Ok(changes)
    }

    /// Rebuild the materialized copy of `path` at `version` if it is gone.
    ///
    /// Best effort: every failure is logged and swallowed.
    pub async fn restore(&self, project: &Project, path: &str, version: VersionName) {
        if let Err(e) = self.try_restore(project, path, version).await {
            tracing::warn!(
                project = %project.full_name(),
                %version,
                "Failed to restore {}: {}",
                path,
                e
            );
        }
    }

    async fn try_restore(&self, project: &Project, path: &str, version: VersionName) -> Result<()> {
        let path = normalize_path(path)?;
        let record = self.metadata.get_version(project.id, version)?;
        let file = record
            .file(&path)
            .ok_or_else(|| SyncError::FileNotFound(path.clone()))?
            .clone();
        let target = self.storage.resolve(&project.storage_dir, &file.location);
        if self.storage.exists(&target).await {
            return Ok(());
        }

        let history = self.file_history(project, &path, None, Some(version))?;
        let mut diffs = Vec::new();
        let mut base = None;
        for entry in &history.history {
            match entry.change {
                ChangeKind::Renamed => continue,
                ChangeKind::Removed => break,
                ChangeKind::Added | ChangeKind::Updated => {}
            }
            if entry.version != version {
                // a surviving materialized copy is as good as a basefile
                let location = self.storage.resolve(&project.storage_dir, &entry.location);
                if self.storage.exists(&location).await {
                    base = Some(location);
                    break;
                }
            }
            match &entry.diff {
                Some(diff) => diffs.push(self.storage.resolve(&project.storage_dir, &diff.location)),
                None => {
                    base = Some(self.storage.resolve(&project.storage_dir, &entry.location));
                    break;
                }
            }
        }
        let Some(base) = base else {
            tracing::debug!("No basefile found for {} at {}", path, version);
            return Ok(());
        };

        let scratch_dir = self
            .storage
            .temp_root()
            .join(format!("restore-{}", uuid::Uuid::new_v4().simple()));
        let scratch = scratch_dir.join("file");
        let result = self.rebuild(&base, &diffs, &scratch, &file.checksum).await;
        let placed = match result {
            Ok(()) => self.storage.copy_file(&scratch, &target).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
            tracing::debug!("Failed to clean restore scratch {:?}: {}", scratch_dir, e);
        }
        placed?;
        tracing::info!(project = %project.full_name(), %version, "Restored {}", path);
        Ok(())
    }

    async fn rebuild(
        &self,
        base: &std::path::Path,
        diffs: &[PathBuf],
        scratch: &std::path::Path,
        expected_checksum: &str,
    ) -> Result<()> {
        self.storage.copy_file(base, scratch).await?;
        let engine = self.changesets.clone();
        let scratch_file = scratch.to_path_buf();
        // oldest changeset first
        let ordered: Vec<PathBuf> = diffs.iter().rev().cloned().collect();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for diff in &ordered {
                engine.apply(&scratch_file, diff)?;
            }
            Ok(())
        })
        .await??;
        let (checksum, _) = self.storage.checksum(scratch).await?;
        if checksum != expected_checksum {
            return Err(SyncError::internal(format!(
                "Rebuilt file checksum {} does not match recorded {}",
                checksum, expected_checksum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectFile, RenamedFile, VersionChanges};
    use uuid::Uuid;

    fn file(path: &str, location: &str, diff: bool) -> ProjectFile {
        ProjectFile {
            path: path.into(),
            size: 10,
            checksum: format!("sum-{}", location),
            location: location.into(),
            diff: diff.then(|| FileDiff {
                path: format!("{}-diff", path),
                size: 2,
                checksum: "d".into(),
                location: format!("{}-diff-x", location),
            }),
        }
    }

    fn version(n: u32, changes: VersionChanges, files: Vec<ProjectFile>) -> ProjectVersion {
        ProjectVersion {
            project_id: Uuid::nil(),
            name: VersionName::new(n),
            author: "alice".into(),
            created: Utc::now(),
            ip_address: None,
            user_agent: None,
            device_id: None,
            changes,
            files,
            project_size: 0,
        }
    }

    #[test]
    fn test_history_follows_renames() {
        let a1 = file("a.gpkg", "v1/a.gpkg", false);
        let a2 = file("a.gpkg", "v2/a.gpkg", true);
        let b3 = ProjectFile {
            path: "b.gpkg".into(),
            ..a2.clone()
        };
        let versions = vec![
            version(
                1,
                VersionChanges {
                    added: vec![a1.clone()],
                    ..Default::default()
                },
                vec![a1.clone()],
            ),
            version(
                2,
                VersionChanges {
                    updated: vec![a2.clone()],
                    ..Default::default()
                },
                vec![a2.clone()],
            ),
            version(
                3,
                VersionChanges {
                    renamed: vec![RenamedFile {
                        path: "a.gpkg".into(),
                        new_path: "b.gpkg".into(),
                    }],
                    ..Default::default()
                },
                vec![b3],
            ),
        ];

        let history = resolve_history(&versions, "b.gpkg", chrono::Duration::hours(48));
        let kinds: Vec<(u32, ChangeKind)> = history
            .iter()
            .map(|e| (e.version.number(), e.change))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (3, ChangeKind::Renamed),
                (2, ChangeKind::Updated),
                (1, ChangeKind::Added)
            ]
        );
        assert_eq!(history[0].renamed_from.as_deref(), Some("a.gpkg"));
        assert_eq!(history[0].location, "v2/a.gpkg");
        assert!(history[1].expiration.is_some());
        assert!(history[2].expiration.is_none());
        assert!(history[2].is_basefile());
    }

    #[test]
    fn test_history_stops_at_removal() {
        let a1 = file("a.gpkg", "v1/a.gpkg", false);
        let a3 = file("a.gpkg", "v3/a.gpkg", false);
        let versions = vec![
            version(
                1,
                VersionChanges {
                    added: vec![a1.clone()],
                    ..Default::default()
                },
                vec![a1.clone()],
            ),
            version(
                2,
                VersionChanges {
                    removed: vec![a1.clone()],
                    ..Default::default()
                },
                vec![],
            ),
            version(
                3,
                VersionChanges {
                    added: vec![a3.clone()],
                    ..Default::default()
                },
                vec![a3],
            ),
        ];

        // re-added file: history starts fresh
        let history = resolve_history(&versions, "a.gpkg", chrono::Duration::hours(1));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, VersionName::new(3));

        let history = resolve_history(&versions[..2], "a.gpkg", chrono::Duration::hours(1));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change, ChangeKind::Removed);
    }

    #[test]
    fn test_untouched_path_has_empty_history() {
        let a1 = file("a.gpkg", "v1/a.gpkg", false);
        let versions = vec![version(
            1,
            VersionChanges {
                added: vec![a1.clone()],
                ..Default::default()
            },
            vec![a1],
        )];
        assert!(resolve_history(&versions, "other.gpkg", chrono::Duration::hours(1)).is_empty());
    }
}
