//! Sync engine facade
//!
//! Wires storage, metadata, the changeset engine and the external services
//! together and gates every project operation on a permission check.

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::sync::Arc;
use uuid::Uuid;

use crate::builder::VersionBuilder;
use crate::changeset::{ChangesetEngine, ChangesetSummary, RowChange, SqliteChangesetEngine};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::history::{FileHistory, HistoryResolver};
use crate::metadata::MetadataStore;
use crate::model::{
    ChunkReceipt, Principal, Project, ProjectVersion, PushOutcome, UploadChanges, UploadTransaction,
    VersionChanges, VersionName,
};
use crate::paths::secure_filename;
use crate::reclaim::Reclaimer;
use crate::services::{
    AllowAll, HookNotifier, MetadataQuota, NotificationSink, PermissionChecker, ProjectAction,
    QuotaService,
};
use crate::storage::{DiskStorage, ProjectStorage};
use crate::upload::UploadManager;

/// Overrides for the collaborators [`SyncEngine::open`] would pick.
#[derive(Default)]
pub struct SyncEngineBuilder {
    metadata: Option<Arc<MetadataStore>>,
    storage: Option<Arc<dyn ProjectStorage>>,
    changesets: Option<Arc<dyn ChangesetEngine>>,
    permissions: Option<Arc<dyn PermissionChecker>>,
    quota: Option<Arc<dyn QuotaService>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl SyncEngineBuilder {
    pub fn metadata(mut self, metadata: Arc<MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn ProjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn changesets(mut self, changesets: Arc<dyn ChangesetEngine>) -> Self {
        self.changesets = Some(changesets);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaService>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self, config: SyncConfig) -> Result<SyncEngine> {
        let config = Arc::new(config);
        let metadata = match self.metadata {
            Some(m) => m,
            None => {
                std::fs::create_dir_all(&config.data_root)?;
                Arc::new(MetadataStore::open(&config.metadata_path())?)
            }
        };
        let storage: Arc<dyn ProjectStorage> = match self.storage {
            Some(s) => s,
            None => Arc::new(DiskStorage::open(
                config.projects_dir(),
                config.temp_dir(),
                config.quarantine_dir(),
            )?),
        };
        let changesets = self
            .changesets
            .unwrap_or_else(|| Arc::new(SqliteChangesetEngine::new()));
        let permissions = self.permissions.unwrap_or_else(|| Arc::new(AllowAll));
        let quota = self.quota.unwrap_or_else(|| {
            Arc::new(MetadataQuota::new(
                metadata.clone(),
                config.default_storage_limit,
                config.storage_limits.clone(),
            ))
        });
        let notifier = match self.notifier {
            Some(n) => n,
            None => {
                let hooks = HookNotifier::new(config.hooks_dir());
                hooks.ensure_hooks_dir()?;
                Arc::new(hooks)
            }
        };

        let builder = VersionBuilder::new(storage.clone(), changesets.clone(), config.verify_checksums);
        let uploads = Arc::new(UploadManager::new(
            config.clone(),
            metadata.clone(),
            storage.clone(),
            builder,
            quota,
            notifier,
        )?);
        let history = Arc::new(HistoryResolver::new(
            metadata.clone(),
            storage.clone(),
            changesets,
            config.diffable_extensions.clone(),
            config.file_expiration(),
        ));
        let reclaimer = Reclaimer::new(
            config.clone(),
            metadata.clone(),
            storage.clone(),
            history.clone(),
            uploads.clone(),
        );
        tracing::debug!(root = ?config.data_root, backend = storage.backend(), "Sync engine ready");
        Ok(SyncEngine {
            config,
            metadata,
            storage,
            permissions,
            uploads,
            history,
            reclaimer,
        })
    }
}

pub struct SyncEngine {
    config: Arc<SyncConfig>,
    metadata: Arc<MetadataStore>,
    storage: Arc<dyn ProjectStorage>,
    permissions: Arc<dyn PermissionChecker>,
    uploads: Arc<UploadManager>,
    history: Arc<HistoryResolver>,
    reclaimer: Reclaimer,
}

impl SyncEngine {
    /// Open an engine with on-disk storage and metadata under the
    /// configured data root.
    pub fn open(config: SyncConfig) -> Result<Self> {
        SyncEngineBuilder::default().build(config)
    }

    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn ProjectStorage> {
        &self.storage
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    async fn authorize(&self, project: &Project, principal: &Principal, action: ProjectAction) -> Result<()> {
        if self
            .permissions
            .check_permission(project, principal, action)
            .await
        {
            Ok(())
        } else {
            tracing::debug!(
                project = %project.full_name(),
                user = %principal.username,
                ?action,
                "Permission denied"
            );
            Err(SyncError::PermissionDenied)
        }
    }

    /// Live project by id; soft-deleted projects are not found.
    pub fn get_project(&self, project_id: Uuid) -> Result<Project> {
        let project = self.metadata.get_project(project_id)?;
        if project.is_removed() {
            return Err(SyncError::ProjectNotFound(project.full_name()));
        }
        Ok(project)
    }

    pub fn find_project(&self, namespace: &str, name: &str) -> Result<Project> {
        let project = self.metadata.find_project(namespace, name)?;
        if project.is_removed() {
            return Err(SyncError::ProjectNotFound(project.full_name()));
        }
        Ok(project)
    }

    pub fn list_projects(&self, include_removed: bool) -> Result<Vec<Project>> {
        self.metadata.list_projects(include_removed)
    }

    // ── Project lifecycle ──────────────────────────────────────

    /// Create an empty project at version v0.
    pub async fn create_project(&self, namespace: &str, name: &str, principal: &Principal) -> Result<Project> {
        for part in [namespace, name] {
            if part.is_empty() || secure_filename(part) != part {
                return Err(SyncError::InvalidPath(format!("{}/{}", namespace, name)));
            }
        }
        let now = Utc::now();
        let id = Uuid::new_v4();
        let project = Project {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            storage_dir: id.to_string(),
            files: Vec::new(),
            disk_usage: 0,
            latest_version: VersionName::BASELINE,
            created: now,
            removed_at: None,
        };
        let baseline = ProjectVersion {
            project_id: id,
            name: VersionName::BASELINE,
            author: principal.username.clone(),
            created: now,
            ip_address: principal.ip_address.clone(),
            user_agent: principal.user_agent.clone(),
            device_id: principal.device_id.clone(),
            changes: VersionChanges::default(),
            files: Vec::new(),
            project_size: 0,
        };

        self.storage.init_project(&project.storage_dir).await?;
        if let Err(e) = self.metadata.create_project(&project, &baseline) {
            let root = self.storage.project_root(&project.storage_dir);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
                tracing::warn!("Failed to remove {:?}: {}", root, cleanup);
            }
            return Err(e);
        }
        tracing::info!(project = %project.full_name(), id = %project.id, "Project created");
        Ok(project)
    }

    /// Soft-delete a project. Its data stays until the deleted-project
    /// sweep purges it.
    pub async fn delete_project(&self, project_id: Uuid, principal: &Principal) -> Result<()> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Admin).await?;
        self.metadata.set_removed(project.id, Some(Utc::now()))?;
        tracing::info!(project = %project.full_name(), "Project removed");
        Ok(())
    }

    pub async fn undelete_project(&self, project_id: Uuid, principal: &Principal) -> Result<Project> {
        let project = self.metadata.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Admin).await?;
        if project.is_removed() {
            self.metadata.set_removed(project.id, None)?;
            tracing::info!(project = %project.full_name(), "Project restored");
        }
        self.metadata.get_project(project_id)
    }

    // ── Versions ───────────────────────────────────────────────

    pub async fn list_versions(&self, project_id: Uuid, principal: &Principal) -> Result<Vec<ProjectVersion>> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Read).await?;
        self.metadata
            .list_versions(project.id, VersionName::BASELINE, project.latest_version)
    }

    pub async fn get_version(
        &self,
        project_id: Uuid,
        principal: &Principal,
        version: VersionName,
    ) -> Result<ProjectVersion> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Read).await?;
        self.metadata.get_version(project.id, version)
    }

    // ── Push ───────────────────────────────────────────────────

    /// Declare a change-set on top of `version`.
    pub async fn push_changes(
        &self,
        project_id: Uuid,
        principal: &Principal,
        version: VersionName,
        changes: UploadChanges,
    ) -> Result<PushOutcome> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Write).await?;
        self.uploads
            .push_changes(&project, principal, version, changes)
            .await
    }

    async fn authorized_upload(&self, upload_id: Uuid, principal: &Principal) -> Result<UploadTransaction> {
        let upload = self.uploads.get_upload(upload_id)?;
        let project = self.get_project(upload.project_id)?;
        self.authorize(&project, principal, ProjectAction::Write).await?;
        Ok(upload)
    }

    pub async fn upload_chunk<S>(
        &self,
        upload_id: Uuid,
        principal: &Principal,
        chunk_id: &str,
        stream: S,
    ) -> Result<ChunkReceipt>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        let upload = self.authorized_upload(upload_id, principal).await?;
        self.uploads.upload_chunk(&upload, chunk_id, stream).await
    }

    pub async fn finalize_push(&self, upload_id: Uuid, principal: &Principal) -> Result<ProjectVersion> {
        self.authorized_upload(upload_id, principal).await?;
        self.uploads.finalize_push(upload_id, principal).await
    }

    pub async fn cancel_push(&self, upload_id: Uuid, principal: &Principal) -> Result<()> {
        self.authorized_upload(upload_id, principal).await?;
        self.uploads.cancel_push(upload_id).await
    }

    // ── History ────────────────────────────────────────────────

    pub async fn get_file_history(
        &self,
        project_id: Uuid,
        principal: &Principal,
        path: &str,
        since: Option<VersionName>,
        until: Option<VersionName>,
    ) -> Result<FileHistory> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Read).await?;
        self.history.file_history(&project, path, since, until)
    }

    pub async fn get_changeset_summary(
        &self,
        project_id: Uuid,
        principal: &Principal,
        version: VersionName,
        path: &str,
    ) -> Result<ChangesetSummary> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Read).await?;
        self.history.changeset_summary(&project, version, path).await
    }

    pub async fn get_changeset_changes(
        &self,
        project_id: Uuid,
        principal: &Principal,
        version: VersionName,
        path: &str,
    ) -> Result<Vec<RowChange>> {
        let project = self.get_project(project_id)?;
        self.authorize(&project, principal, ProjectAction::Read).await?;
        self.history.changeset_changes(&project, version, path).await
    }

    /// Bring back a reclaimed copy of `path` at `version`. Failures are
    /// logged, never returned.
    pub async fn restore_versioned_file(&self, project_id: Uuid, path: &str, version: VersionName) {
        match self.get_project(project_id) {
            Ok(project) => self.history.restore(&project, path, version).await,
            Err(e) => tracing::warn!("Cannot restore {} at {}: {}", path, version, e),
        }
    }
}
