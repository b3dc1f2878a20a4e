//! Version builder
//!
//! Turns a project's current file list plus a declared change-set into the
//! file list of the next version. Uploaded bytes are expected to be placed in
//! the new version directory already; diff updates are materialized here by
//! copying the current basefile and applying the staged changeset.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::changeset::ChangesetEngine;
use crate::error::{Result, SyncError};
use crate::model::{FileDiff, Project, ProjectFile, UploadChanges, VersionChanges, VersionName};
use crate::storage::ProjectStorage;

/// Where the bytes of one uploaded file were placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedFile {
    /// Location of the full file in the new version
    pub location: String,
    /// Location of the uploaded changeset, for diff updates
    pub diff_location: Option<String>,
}

/// Result of building a version
#[derive(Debug, Clone, Serialize)]
pub struct BuiltVersion {
    pub version: VersionName,
    pub files: Vec<ProjectFile>,
    pub changes: VersionChanges,
    pub disk_usage: u64,
    /// Renames whose source did not exist; reported, not fatal
    pub rename_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VersionBuilder {
    storage: Arc<dyn ProjectStorage>,
    changesets: Arc<dyn ChangesetEngine>,
    verify_checksums: bool,
}

impl VersionBuilder {
    pub fn new(
        storage: Arc<dyn ProjectStorage>,
        changesets: Arc<dyn ChangesetEngine>,
        verify_checksums: bool,
    ) -> Self {
        Self {
            storage,
            changesets,
            verify_checksums,
        }
    }

    /// Build `version` from the project's current files.
    ///
    /// If any update fails, the patched copies written here are moved to
    /// quarantine and `DataSync` is returned with one message per file.
    pub async fn apply_changes(
        &self,
        project: &Project,
        changes: &UploadChanges,
        version: VersionName,
        placed: &HashMap<String, PlacedFile>,
    ) -> Result<BuiltVersion> {
        let mut files = project.files.clone();
        let mut recorded = VersionChanges::default();
        let mut rename_errors = BTreeMap::new();
        let mut sync_errors = BTreeMap::new();
        let mut written: Vec<PathBuf> = Vec::new();

        for removed in &changes.removed {
            if let Some(pos) = files.iter().position(|f| f.path == removed.path) {
                recorded.removed.push(files.remove(pos));
            }
        }

        for rename in &changes.renamed {
            match files.iter_mut().find(|f| f.path == rename.path) {
                Some(file) => {
                    file.path = rename.new_path.clone();
                    recorded.renamed.push(rename.clone());
                }
                None => {
                    tracing::warn!(project = %project.full_name(), "Rename source {} missing", rename.path);
                    rename_errors.insert(rename.path.clone(), "file not found".to_string());
                }
            }
        }

        for update in &changes.updated {
            let Some(pos) = files.iter().position(|f| f.path == update.path) else {
                sync_errors.insert(update.path.clone(), "file not found".to_string());
                continue;
            };
            let Some(place) = placed.get(&update.path) else {
                sync_errors.insert(update.path.clone(), "missing uploaded data".to_string());
                continue;
            };
            let entry = match (&update.diff, &place.diff_location) {
                (Some(diff), Some(diff_location)) => {
                    let dest = self.storage.resolve(&project.storage_dir, &place.location);
                    written.push(dest.clone());
                    let base = self
                        .storage
                        .resolve(&project.storage_dir, &files[pos].location);
                    let changeset = self.storage.resolve(&project.storage_dir, diff_location);
                    match self.patch(base, changeset, dest, &update.checksum).await {
                        Ok((checksum, size)) => ProjectFile {
                            path: update.path.clone(),
                            size,
                            checksum,
                            location: place.location.clone(),
                            diff: Some(FileDiff {
                                path: diff.path.clone(),
                                size: diff.size,
                                checksum: diff.checksum.clone(),
                                location: diff_location.clone(),
                            }),
                        },
                        Err(e) => {
                            tracing::debug!("Changeset for {} failed: {}", update.path, e);
                            sync_errors.insert(update.path.clone(), e.to_string());
                            continue;
                        }
                    }
                }
                (Some(_), None) => {
                    sync_errors.insert(update.path.clone(), "missing changeset".to_string());
                    continue;
                }
                (None, _) => ProjectFile {
                    path: update.path.clone(),
                    size: update.size,
                    checksum: update.checksum.clone(),
                    location: place.location.clone(),
                    diff: None,
                },
            };
            recorded.updated.push(entry.clone());
            files[pos] = entry;
        }

        if !sync_errors.is_empty() {
            for path in &written {
                if let Err(e) = self.storage.quarantine(path).await {
                    tracing::warn!("Failed to quarantine {:?}: {}", path, e);
                }
            }
            return Err(SyncError::DataSync(sync_errors));
        }

        for add in &changes.added {
            let Some(place) = placed.get(&add.path) else {
                return Err(SyncError::MissingUploadData {
                    path: add.path.clone(),
                });
            };
            let entry = ProjectFile {
                path: add.path.clone(),
                size: add.size,
                checksum: add.checksum.clone(),
                location: place.location.clone(),
                diff: None,
            };
            recorded.added.push(entry.clone());
            files.push(entry);
        }

        let disk_usage = files.iter().map(|f| f.size).sum();
        Ok(BuiltVersion {
            version,
            files,
            changes: recorded,
            disk_usage,
            rename_errors,
        })
    }

    /// Copy `base` to `dest` and apply `changeset` there. Returns the
    /// checksum and size of the result.
    async fn patch(
        &self,
        base: PathBuf,
        changeset: PathBuf,
        dest: PathBuf,
        declared_checksum: &str,
    ) -> Result<(String, u64)> {
        self.storage.copy_file(&base, &dest).await?;
        let engine = self.changesets.clone();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || engine.apply(&target, &changeset)).await??;
        let (checksum, size) = self.storage.checksum(&dest).await?;
        if self.verify_checksums && checksum != declared_checksum {
            return Err(SyncError::internal(format!(
                "checksum {} differs from declared {}",
                checksum, declared_checksum
            )));
        }
        Ok((checksum, size))
    }
}
