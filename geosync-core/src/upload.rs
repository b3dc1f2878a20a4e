//! Upload transaction manager
//!
//! A push moves through `created -> chunks_receiving -> finalizing` and ends
//! either committed as a new version or discarded. The state lives in the
//! `uploads` table so that any process can pick a transaction up; the
//! staging directory `<project>/tmp/<upload id>` belongs to the transaction
//! until it ends.
//!
//! At most one blocking upload (anything but pure additions) runs per
//! project. A blocking upload whose lockfile went stale is reaped when it
//! gets in the way.

use chrono::Utc;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use bytes::Bytes;

use crate::builder::{PlacedFile, VersionBuilder};
use crate::chunks::{ChunkStore, Heartbeat, lockfile_age, touch_lockfile};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::metadata::MetadataStore;
use crate::model::{
    ChunkReceipt, Principal, Project, ProjectVersion, PushOutcome, UploadChanges, UploadFile,
    UploadState, UploadTransaction, VersionName,
};
use crate::paths::{Blacklist, LocationMap, diff_location, is_diffable, normalize_path};
use crate::services::{NotificationSink, PUSH_FINISHED, QuotaService};
use crate::storage::ProjectStorage;

const OPEN_STATES: [UploadState; 2] = [UploadState::Created, UploadState::ChunksReceiving];

/// One uploaded file assembled in staging
#[derive(Debug, Clone)]
struct Assembled {
    file: UploadFile,
    staged: PathBuf,
}

pub struct UploadManager {
    config: Arc<SyncConfig>,
    metadata: Arc<MetadataStore>,
    storage: Arc<dyn ProjectStorage>,
    chunks: ChunkStore,
    builder: VersionBuilder,
    quota: Arc<dyn QuotaService>,
    notifier: Arc<dyn NotificationSink>,
    blacklist: Blacklist,
    commit_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl UploadManager {
    pub fn new(
        config: Arc<SyncConfig>,
        metadata: Arc<MetadataStore>,
        storage: Arc<dyn ProjectStorage>,
        builder: VersionBuilder,
        quota: Arc<dyn QuotaService>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let blacklist = Blacklist::new(&config.blacklist)?;
        Ok(Self {
            chunks: ChunkStore::new(config.max_chunk_size),
            config,
            metadata,
            storage,
            builder,
            quota,
            notifier,
            blacklist,
            commit_locks: Mutex::new(HashMap::new()),
        })
    }

    fn commit_lock(&self, project_id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .commit_locks
            .lock()
            .map_err(|_| SyncError::internal("Commit lock table poisoned"))?;
        Ok(locks.entry(project_id).or_default().clone())
    }

    // ── Push ───────────────────────────────────────────────────

    /// Accept a declared change-set on top of `declared`.
    ///
    /// Change-sets without bytes to upload are committed right away.
    pub async fn push_changes(
        &self,
        project: &Project,
        principal: &Principal,
        declared: VersionName,
        changes: UploadChanges,
    ) -> Result<PushOutcome> {
        if project.is_removed() {
            return Err(SyncError::ProjectNotFound(project.full_name()));
        }
        if declared != project.latest_version {
            return Err(SyncError::VersionMismatch {
                current: project.latest_version.to_string(),
                declared: declared.to_string(),
            });
        }
        let changes = self.prepare_changes(project, changes)?;
        self.check_quota(project, &changes).await?;

        if !changes.has_payload() {
            if changes.is_blocking() {
                self.ensure_no_blocking_upload(project.id).await?;
            }
            let version = self
                .commit(project.id, principal, &principal.username, declared, &changes, &[], None)
                .await?;
            self.notify_push(project, &version).await;
            return Ok(PushOutcome::Committed(Box::new(version)));
        }

        let upload = UploadTransaction {
            id: Uuid::new_v4(),
            project_id: project.id,
            version: declared.next(),
            blocking: changes.is_blocking(),
            changes,
            user: principal.username.clone(),
            created: Utc::now(),
            state: UploadState::Created,
        };
        match self.metadata.insert_upload(&upload) {
            Ok(()) => {}
            Err(SyncError::AnotherUploadRunning) => {
                if self.reap_stale(Some(project.id)).await? == 0 {
                    return Err(SyncError::AnotherUploadRunning);
                }
                self.metadata.insert_upload(&upload)?;
            }
            Err(e) => return Err(e),
        }

        let staging = self.storage.staging_dir(&project.storage_dir, &upload.id);
        let created = async {
            tokio::fs::create_dir_all(ChunkStore::chunks_dir(&staging)).await?;
            touch_lockfile(&ChunkStore::lockfile(&staging))?;
            Ok::<(), SyncError>(())
        }
        .await;
        if let Err(e) = created {
            self.metadata.delete_upload(upload.id)?;
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        tracing::info!(
            project = %project.full_name(),
            upload = %upload.id,
            version = %upload.version,
            blocking = upload.blocking,
            "Upload started"
        );
        Ok(PushOutcome::Pending {
            transaction_id: upload.id,
        })
    }

    /// Normalize, filter and validate a declared change-set against the
    /// project's current files.
    fn prepare_changes(&self, project: &Project, changes: UploadChanges) -> Result<UploadChanges> {
        let mut prepared = UploadChanges::default();
        let keep = |path: &str| {
            let blocked = self.blacklist.is_blacklisted(path);
            if blocked {
                tracing::debug!("Ignoring blacklisted path {}", path);
            }
            !blocked
        };
        let normalize_all = |files: Vec<UploadFile>| -> Result<Vec<UploadFile>> {
            let mut out = Vec::with_capacity(files.len());
            for mut f in files {
                f.path = normalize_path(&f.path)?;
                if keep(&f.path) {
                    out.push(f);
                }
            }
            Ok(out)
        };
        prepared.added = normalize_all(changes.added)?;
        prepared.updated = normalize_all(changes.updated)?;
        prepared.removed = normalize_all(changes.removed)?;
        for mut r in changes.renamed {
            r.path = normalize_path(&r.path)?;
            r.new_path = normalize_path(&r.new_path)?;
            if keep(&r.path) && keep(&r.new_path) {
                prepared.renamed.push(r);
            }
        }

        if prepared.is_empty() {
            return Err(SyncError::NoChanges);
        }

        let mut seen = HashSet::new();
        let all_paths = prepared
            .added
            .iter()
            .chain(&prepared.updated)
            .chain(&prepared.removed)
            .map(|f| f.path.as_str())
            .chain(
                prepared
                    .renamed
                    .iter()
                    .flat_map(|r| [r.path.as_str(), r.new_path.as_str()]),
            );
        for path in all_paths {
            if !seen.insert(path) {
                return Err(SyncError::DuplicatePath(path.to_string()));
            }
        }

        for f in prepared.removed.iter().chain(&prepared.updated) {
            if project.file(&f.path).is_none() {
                return Err(SyncError::FileNotFound(f.path.clone()));
            }
        }
        for r in &prepared.renamed {
            if project.file(&r.path).is_none() {
                return Err(SyncError::FileNotFound(r.path.clone()));
            }
            if project.file(&r.new_path).is_some() {
                return Err(SyncError::FileExists(r.new_path.clone()));
            }
        }
        for f in &prepared.added {
            if project.file(&f.path).is_some() {
                return Err(SyncError::FileExists(f.path.clone()));
            }
        }
        for f in prepared.uploaded_files() {
            if f.chunks.is_empty() && f.expected_upload_size() > 0 {
                return Err(SyncError::MissingUploadData {
                    path: f.path.clone(),
                });
            }
        }
        for f in &prepared.updated {
            if f.diff.is_some() && !is_diffable(&f.path, &self.config.diffable_extensions) {
                return Err(SyncError::NotDiffable(f.path.clone()));
            }
        }
        Ok(prepared)
    }

    /// Reject a push that would take the namespace over its limit.
    async fn check_quota(&self, project: &Project, changes: &UploadChanges) -> Result<()> {
        let size_of = |path: &str| project.file(path).map(|f| f.size as i128).unwrap_or(0);
        let added: i128 = changes.added.iter().map(|f| f.size as i128).sum();
        let updated: i128 = changes.updated.iter().map(|f| f.size as i128).sum();
        let superseded: i128 = changes.updated.iter().map(|f| size_of(&f.path)).sum();
        let removed: i128 = changes.removed.iter().map(|f| size_of(&f.path)).sum();
        let delta = added + updated - superseded - removed;
        if delta <= 0 {
            return Ok(());
        }
        let usage = self.quota.current_disk_usage(&project.namespace).await?;
        let limit = self.quota.storage_limit(&project.namespace).await?;
        let required = u64::try_from(delta).unwrap_or(u64::MAX);
        if usage.saturating_add(required) > limit {
            return Err(SyncError::QuotaExceeded {
                required,
                available: limit.saturating_sub(usage),
            });
        }
        Ok(())
    }

    async fn ensure_no_blocking_upload(&self, project_id: Uuid) -> Result<()> {
        let blocking = self
            .metadata
            .list_uploads(Some(project_id))?
            .into_iter()
            .any(|u| u.blocking);
        if blocking && self.reap_stale(Some(project_id)).await? == 0 {
            return Err(SyncError::AnotherUploadRunning);
        }
        let still_blocked = self
            .metadata
            .list_uploads(Some(project_id))?
            .iter()
            .any(|u| u.blocking);
        if still_blocked {
            return Err(SyncError::AnotherUploadRunning);
        }
        Ok(())
    }

    // ── Chunks ─────────────────────────────────────────────────

    pub fn get_upload(&self, upload_id: Uuid) -> Result<UploadTransaction> {
        self.metadata.get_upload(upload_id)
    }

    /// Store one declared chunk of an open upload.
    pub async fn upload_chunk<S>(&self, upload: &UploadTransaction, chunk_id: &str, stream: S) -> Result<ChunkReceipt>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        if !upload.changes.declared_chunks().contains(chunk_id) {
            return Err(SyncError::ChunkNotDeclared(chunk_id.to_string()));
        }
        if !self
            .metadata
            .transition_upload(upload.id, &OPEN_STATES, UploadState::ChunksReceiving)?
        {
            return Err(SyncError::UploadConflict(upload.id.to_string()));
        }
        let project = self.metadata.get_project(upload.project_id)?;
        let staging = self.storage.staging_dir(&project.storage_dir, &upload.id);
        let lockfile = ChunkStore::lockfile(&staging);
        touch_lockfile(&lockfile)?;

        let _heartbeat = Heartbeat::start(lockfile, self.config.lockfile_refresh());
        let receipt = self.chunks.write_chunk(&staging, chunk_id, stream).await?;
        tracing::debug!(upload = %upload.id, chunk = chunk_id, size = receipt.size, "Chunk stored");
        Ok(receipt)
    }

    // ── Finalize / cancel ──────────────────────────────────────

    /// Assemble, verify and commit an upload as a new version.
    pub async fn finalize_push(&self, upload_id: Uuid, principal: &Principal) -> Result<ProjectVersion> {
        let upload = self.metadata.get_upload(upload_id)?;
        if !self
            .metadata
            .transition_upload(upload.id, &OPEN_STATES, UploadState::Finalizing)?
        {
            return Err(SyncError::UploadConflict(upload.id.to_string()));
        }
        let project = self.metadata.get_project(upload.project_id)?;
        let staging = self.storage.staging_dir(&project.storage_dir, &upload.id);
        let heartbeat = Heartbeat::start(
            ChunkStore::lockfile(&staging),
            self.config.lockfile_refresh(),
        );

        let missing = self
            .chunks
            .missing_chunks(&staging, upload.changes.declared_chunks())
            .await;
        if !missing.is_empty() {
            self.metadata.transition_upload(
                upload.id,
                &[UploadState::Finalizing],
                UploadState::ChunksReceiving,
            )?;
            return Err(SyncError::MissingChunks(missing));
        }

        let assembled = match self.assemble(&upload, &staging).await {
            Ok(a) => a,
            Err(e) => {
                drop(heartbeat);
                self.discard(&project, &upload).await;
                return Err(e);
            }
        };

        let base = upload
            .version
            .prev()
            .ok_or_else(|| SyncError::InvalidVersion(upload.version.to_string()))?;
        let committed = self
            .commit(
                project.id,
                principal,
                &upload.user,
                base,
                &upload.changes,
                &assembled,
                Some(upload.id),
            )
            .await;
        let version = match committed {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(upload = %upload.id, "Finalize failed: {}", e);
                drop(heartbeat);
                self.discard(&project, &upload).await;
                return Err(e);
            }
        };

        drop(heartbeat);
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!("Failed to purge staging {:?}: {}", staging, e);
        }
        self.notify_push(&project, &version).await;
        Ok(version)
    }

    /// Concatenate every uploaded file and verify it against its declaration.
    async fn assemble(&self, upload: &UploadTransaction, staging: &std::path::Path) -> Result<Vec<Assembled>> {
        let mut assembled = Vec::new();
        let mut corrupted = Vec::new();
        for (idx, file) in upload.changes.uploaded_files().enumerate() {
            let staged = ChunkStore::files_dir(staging).join(idx.to_string());
            let size = self.chunks.assemble(staging, &file.chunks, &staged).await?;
            let mut valid = size == file.expected_upload_size();
            if valid && self.config.verify_checksums {
                let (checksum, _) = self.storage.checksum(&staged).await?;
                valid = checksum == file.expected_upload_checksum();
            }
            if valid {
                assembled.push(Assembled {
                    file: file.clone(),
                    staged,
                });
            } else {
                tracing::warn!(
                    upload = %upload.id,
                    "Corrupted upload of {}: {} bytes, expected {}",
                    file.path,
                    size,
                    file.expected_upload_size()
                );
                corrupted.push(file.path.clone());
            }
        }
        if !corrupted.is_empty() {
            return Err(SyncError::CorruptedFiles(corrupted));
        }
        Ok(assembled)
    }

    /// Place assembled files, build and persist the next version under the
    /// project's commit lock.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        project_id: Uuid,
        principal: &Principal,
        author: &str,
        base: VersionName,
        changes: &UploadChanges,
        assembled: &[Assembled],
        upload_id: Option<Uuid>,
    ) -> Result<ProjectVersion> {
        let lock = self.commit_lock(project_id)?;
        let _guard = lock.lock().await;

        let project = self.metadata.get_project(project_id)?;
        if project.latest_version != base {
            return Err(SyncError::VersionMismatch {
                current: project.latest_version.to_string(),
                declared: base.to_string(),
            });
        }

        let version = base.next();
        let version_dir = self.storage.version_dir(&project.storage_dir, version);
        if self.storage.exists(&version_dir).await {
            if self.metadata.version_exists(project_id, version)? {
                return Err(SyncError::VersionExists(version.to_string()));
            }
            tracing::warn!("Quarantining stale version directory {:?}", version_dir);
            self.storage.quarantine(&version_dir).await?;
        }

        let result = self
            .build_and_persist(&project, principal, author, version, changes, assembled, upload_id)
            .await;
        if result.is_err() {
            if let Err(e) = self.storage.quarantine(&version_dir).await {
                tracing::warn!("Failed to quarantine {:?}: {}", version_dir, e);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_and_persist(
        &self,
        project: &Project,
        principal: &Principal,
        author: &str,
        version: VersionName,
        changes: &UploadChanges,
        assembled: &[Assembled],
        upload_id: Option<Uuid>,
    ) -> Result<ProjectVersion> {
        let mut locations = LocationMap::new(version);
        let mut placed = HashMap::new();
        for item in assembled {
            let location = locations.assign(&item.file.path);
            let place = if item.file.diff.is_some() {
                let diff_loc = diff_location(&location);
                let dest = self.storage.resolve(&project.storage_dir, &diff_loc);
                self.storage.move_path(&item.staged, &dest).await?;
                PlacedFile {
                    location,
                    diff_location: Some(diff_loc),
                }
            } else {
                let dest = self.storage.resolve(&project.storage_dir, &location);
                self.storage.move_path(&item.staged, &dest).await?;
                PlacedFile {
                    location,
                    diff_location: None,
                }
            };
            placed.insert(item.file.path.clone(), place);
        }

        let built = self
            .builder
            .apply_changes(project, changes, version, &placed)
            .await?;
        if !built.rename_errors.is_empty() {
            tracing::warn!(
                project = %project.full_name(),
                %version,
                "Committing with partial renames: {:?}",
                built.rename_errors
            );
        }
        let record = ProjectVersion {
            project_id: project.id,
            name: version,
            author: author.to_string(),
            created: Utc::now(),
            ip_address: principal.ip_address.clone(),
            user_agent: principal.user_agent.clone(),
            device_id: principal.device_id.clone(),
            changes: built.changes,
            files: built.files.clone(),
            project_size: built.disk_usage,
        };
        self.metadata.commit_version(
            &record,
            project.latest_version,
            &built.files,
            built.disk_usage,
            upload_id,
        )?;
        tracing::info!(
            project = %project.full_name(),
            %version,
            author,
            files = record.changes.count(),
            "Version committed"
        );
        Ok(record)
    }

    /// Drop an upload: delete its row and quarantine its staging directory.
    async fn discard(&self, project: &Project, upload: &UploadTransaction) {
        if let Err(e) = self.metadata.delete_upload(upload.id) {
            tracing::warn!(upload = %upload.id, "Failed to delete upload row: {}", e);
        }
        let staging = self.storage.staging_dir(&project.storage_dir, &upload.id);
        if let Err(e) = self.storage.quarantine(&staging).await {
            tracing::warn!("Failed to quarantine staging {:?}: {}", staging, e);
        }
    }

    /// Abort an upload regardless of its state.
    pub async fn cancel_push(&self, upload_id: Uuid) -> Result<()> {
        let upload = self.metadata.get_upload(upload_id)?;
        let project = self.metadata.get_project(upload.project_id)?;
        self.metadata.delete_upload(upload.id)?;
        let staging = self.storage.staging_dir(&project.storage_dir, &upload.id);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(project = %project.full_name(), upload = %upload.id, "Upload cancelled");
        Ok(())
    }

    // ── Reaping ────────────────────────────────────────────────

    /// Whether an upload's lockfile has not been touched for longer than
    /// the lockfile expiration. Uploads without a lockfile age from their
    /// creation time.
    pub fn is_stale(&self, project: &Project, upload: &UploadTransaction) -> bool {
        let staging = self.storage.staging_dir(&project.storage_dir, &upload.id);
        let age = lockfile_age(&ChunkStore::lockfile(&staging)).unwrap_or_else(|| {
            (Utc::now() - upload.created)
                .to_std()
                .unwrap_or(Duration::ZERO)
        });
        age > self.config.lockfile_expiration()
    }

    /// Reap stale uploads of one project, or of all projects. Returns how
    /// many were removed.
    pub async fn reap_stale(&self, project_id: Option<Uuid>) -> Result<usize> {
        let mut reaped = 0;
        let mut projects: HashMap<Uuid, Project> = HashMap::new();
        for upload in self.metadata.list_uploads(project_id)? {
            let project = match projects.get(&upload.project_id) {
                Some(p) => p.clone(),
                None => {
                    let p = self.metadata.get_project(upload.project_id)?;
                    projects.insert(p.id, p.clone());
                    p
                }
            };
            if !self.is_stale(&project, &upload) {
                continue;
            }
            tracing::info!(
                project = %project.full_name(),
                upload = %upload.id,
                "Reaping stale upload"
            );
            self.discard(&project, &upload).await;
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn notify_push(&self, project: &Project, version: &ProjectVersion) {
        let payload = serde_json::json!({
            "project_id": project.id,
            "project": project.full_name(),
            "version": version.name,
            "author": version.author,
            "added": version.changes.added.len(),
            "updated": version.changes.updated.len(),
            "removed": version.changes.removed.len(),
            "renamed": version.changes.renamed.len(),
        });
        self.notifier.notify(PUSH_FINISHED, &payload).await;
    }
}
