//! SQLite-backed metadata store
//!
//! Holds projects, their immutable versions and in-flight upload
//! transactions in a single database running in WAL mode. JSON columns carry
//! file lists and change-sets.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::model::{
    Project, ProjectFile, ProjectVersion, UploadState, UploadTransaction, VersionName,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    storage_dir TEXT NOT NULL,
    files TEXT NOT NULL,
    disk_usage INTEGER NOT NULL,
    latest_version INTEGER NOT NULL,
    created TEXT NOT NULL,
    removed_at TEXT,
    UNIQUE (namespace, name)
);
CREATE TABLE IF NOT EXISTS versions (
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name INTEGER NOT NULL,
    author TEXT NOT NULL,
    created TEXT NOT NULL,
    ip_address TEXT,
    user_agent TEXT,
    device_id TEXT,
    changes TEXT NOT NULL,
    files TEXT NOT NULL,
    project_size INTEGER NOT NULL,
    PRIMARY KEY (project_id, name)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    changes TEXT NOT NULL,
    user TEXT NOT NULL,
    created TEXT NOT NULL,
    blocking INTEGER NOT NULL,
    state TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS uploads_one_blocking
    ON uploads (project_id) WHERE blocking = 1;
";

const PROJECT_COLUMNS: &str =
    "id, namespace, name, storage_dir, files, disk_usage, latest_version, created, removed_at";

const VERSION_COLUMNS: &str = "project_id, name, author, created, ip_address, user_agent, \
                               device_id, changes, files, project_size";

const UPLOAD_COLUMNS: &str = "id, project_id, version, changes, user, created, blocking, state";

fn open_metadata_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "cache_size", "-16000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::internal(format!("Invalid timestamp '{}': {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| SyncError::internal(format!("Invalid id '{}': {}", s, e)))
}

fn version_number(n: i64) -> Result<VersionName> {
    u32::try_from(n)
        .map(VersionName::new)
        .map_err(|_| SyncError::InvalidVersion(n.to_string()))
}

struct ProjectRow {
    id: String,
    namespace: String,
    name: String,
    storage_dir: String,
    files: String,
    disk_usage: i64,
    latest_version: i64,
    created: String,
    removed_at: Option<String>,
}

impl ProjectRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            namespace: row.get(1)?,
            name: row.get(2)?,
            storage_dir: row.get(3)?,
            files: row.get(4)?,
            disk_usage: row.get(5)?,
            latest_version: row.get(6)?,
            created: row.get(7)?,
            removed_at: row.get(8)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: parse_uuid(&self.id)?,
            namespace: self.namespace,
            name: self.name,
            storage_dir: self.storage_dir,
            files: serde_json::from_str(&self.files)?,
            disk_usage: self.disk_usage.max(0) as u64,
            latest_version: version_number(self.latest_version)?,
            created: parse_time(&self.created)?,
            removed_at: self.removed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

struct VersionRow {
    project_id: String,
    name: i64,
    author: String,
    created: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    device_id: Option<String>,
    changes: String,
    files: String,
    project_size: i64,
}

impl VersionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            name: row.get(1)?,
            author: row.get(2)?,
            created: row.get(3)?,
            ip_address: row.get(4)?,
            user_agent: row.get(5)?,
            device_id: row.get(6)?,
            changes: row.get(7)?,
            files: row.get(8)?,
            project_size: row.get(9)?,
        })
    }

    fn into_version(self) -> Result<ProjectVersion> {
        Ok(ProjectVersion {
            project_id: parse_uuid(&self.project_id)?,
            name: version_number(self.name)?,
            author: self.author,
            created: parse_time(&self.created)?,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            device_id: self.device_id,
            changes: serde_json::from_str(&self.changes)?,
            files: serde_json::from_str(&self.files)?,
            project_size: self.project_size.max(0) as u64,
        })
    }
}

struct UploadRow {
    id: String,
    project_id: String,
    version: i64,
    changes: String,
    user: String,
    created: String,
    blocking: bool,
    state: String,
}

impl UploadRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            version: row.get(2)?,
            changes: row.get(3)?,
            user: row.get(4)?,
            created: row.get(5)?,
            blocking: row.get(6)?,
            state: row.get(7)?,
        })
    }

    fn into_upload(self) -> Result<UploadTransaction> {
        Ok(UploadTransaction {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            version: version_number(self.version)?,
            changes: serde_json::from_str(&self.changes)?,
            user: self.user,
            created: parse_time(&self.created)?,
            blocking: self.blocking,
            state: self.state.parse()?,
        })
    }
}

fn conn_insert_version(conn: &Connection, v: &ProjectVersion) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO versions ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            VERSION_COLUMNS
        ),
        rusqlite::params![
            v.project_id.to_string(),
            v.name.number() as i64,
            v.author,
            v.created.to_rfc3339(),
            v.ip_address,
            v.user_agent,
            v.device_id,
            serde_json::to_string(&v.changes)?,
            serde_json::to_string(&v.files)?,
            v.project_size as i64,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(SyncError::VersionExists(v.name.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Metadata store for projects, versions and uploads
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_metadata_db(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::internal("Metadata connection lock poisoned"))
    }

    // ── Projects ───────────────────────────────────────────────

    /// Insert a new project together with its baseline version.
    pub fn create_project(&self, project: &Project, baseline: &ProjectVersion) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO projects ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                PROJECT_COLUMNS
            ),
            rusqlite::params![
                project.id.to_string(),
                project.namespace,
                project.name,
                project.storage_dir,
                serde_json::to_string(&project.files)?,
                project.disk_usage as i64,
                project.latest_version.number() as i64,
                project.created.to_rfc3339(),
                project.removed_at.map(|t| t.to_rfc3339()),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(SyncError::ProjectExists(project.full_name()));
            }
            Err(e) => return Err(e.into()),
        }
        conn_insert_version(&tx, baseline)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_project(&self, id: Uuid) -> Result<Project> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                [id.to_string()],
                ProjectRow::read,
            )
            .optional()?;
        row.ok_or_else(|| SyncError::ProjectNotFound(id.to_string()))?
            .into_project()
    }

    pub fn find_project(&self, namespace: &str, name: &str) -> Result<Project> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM projects WHERE namespace = ?1 AND name = ?2",
                    PROJECT_COLUMNS
                ),
                [namespace, name],
                ProjectRow::read,
            )
            .optional()?;
        row.ok_or_else(|| SyncError::ProjectNotFound(format!("{}/{}", namespace, name)))?
            .into_project()
    }

    pub fn list_projects(&self, include_removed: bool) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let sql = if include_removed {
            format!("SELECT {} FROM projects ORDER BY namespace, name", PROJECT_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM projects WHERE removed_at IS NULL ORDER BY namespace, name",
                PROJECT_COLUMNS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], ProjectRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ProjectRow::into_project).collect()
    }

    /// Set or clear the soft-delete mark.
    pub fn set_removed(&self, id: Uuid, removed_at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE projects SET removed_at = ?1 WHERE id = ?2",
            rusqlite::params![removed_at.map(|t| t.to_rfc3339()), id.to_string()],
        )?;
        if n == 0 {
            return Err(SyncError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove a project with all its versions and uploads.
    pub fn delete_project(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = id.to_string();
        tx.execute("DELETE FROM uploads WHERE project_id = ?1", [&id])?;
        tx.execute("DELETE FROM versions WHERE project_id = ?1", [&id])?;
        tx.execute("DELETE FROM projects WHERE id = ?1", [&id])?;
        tx.commit()?;
        Ok(())
    }

    /// Disk usage of all live projects in a namespace.
    pub fn namespace_usage(&self, namespace: &str) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(disk_usage), 0) FROM projects \
             WHERE namespace = ?1 AND removed_at IS NULL",
            [namespace],
            |r| r.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    // ── Versions ───────────────────────────────────────────────

    pub fn get_version(&self, project_id: Uuid, name: VersionName) -> Result<ProjectVersion> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM versions WHERE project_id = ?1 AND name = ?2",
                    VERSION_COLUMNS
                ),
                rusqlite::params![project_id.to_string(), name.number() as i64],
                VersionRow::read,
            )
            .optional()?;
        row.ok_or_else(|| SyncError::VersionNotFound(name.to_string()))?
            .into_version()
    }

    pub fn version_exists(&self, project_id: Uuid, name: VersionName) -> Result<bool> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM versions WHERE project_id = ?1 AND name = ?2",
            rusqlite::params![project_id.to_string(), name.number() as i64],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Versions in `[since, until]`, oldest first.
    pub fn list_versions(
        &self,
        project_id: Uuid,
        since: VersionName,
        until: VersionName,
    ) -> Result<Vec<ProjectVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM versions WHERE project_id = ?1 AND name >= ?2 AND name <= ?3 \
             ORDER BY name",
            VERSION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    project_id.to_string(),
                    since.number() as i64,
                    until.number() as i64
                ],
                VersionRow::read,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(VersionRow::into_version).collect()
    }

    /// Persist a new version and advance the project in one transaction.
    ///
    /// Fails with `VersionMismatch` if the project moved past `expected_latest`
    /// in the meantime. The upload row, if given, is deleted in the same
    /// transaction.
    pub fn commit_version(
        &self,
        version: &ProjectVersion,
        expected_latest: VersionName,
        files: &[ProjectFile],
        disk_usage: u64,
        upload_id: Option<Uuid>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let advanced = tx.execute(
            "UPDATE projects SET latest_version = ?1, files = ?2, disk_usage = ?3 \
             WHERE id = ?4 AND latest_version = ?5",
            rusqlite::params![
                version.name.number() as i64,
                serde_json::to_string(files)?,
                disk_usage as i64,
                version.project_id.to_string(),
                expected_latest.number() as i64,
            ],
        )?;
        if advanced == 0 {
            let current: i64 = tx.query_row(
                "SELECT latest_version FROM projects WHERE id = ?1",
                [version.project_id.to_string()],
                |row| row.get(0),
            )?;
            return Err(SyncError::VersionMismatch {
                current: version_number(current)?.to_string(),
                declared: expected_latest.to_string(),
            });
        }
        conn_insert_version(&tx, version)?;
        if let Some(id) = upload_id {
            tx.execute("DELETE FROM uploads WHERE id = ?1", [id.to_string()])?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Uploads ────────────────────────────────────────────────

    /// Persist a new upload. A second blocking upload for the same project
    /// fails with `AnotherUploadRunning`.
    pub fn insert_upload(&self, upload: &UploadTransaction) -> Result<()> {
        let conn = self.conn()?;
        let result = conn.execute(
            &format!(
                "INSERT INTO uploads ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                UPLOAD_COLUMNS
            ),
            rusqlite::params![
                upload.id.to_string(),
                upload.project_id.to_string(),
                upload.version.number() as i64,
                serde_json::to_string(&upload.changes)?,
                upload.user,
                upload.created.to_rfc3339(),
                upload.blocking,
                upload.state.as_str(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(SyncError::AnotherUploadRunning),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_upload(&self, id: Uuid) -> Result<UploadTransaction> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM uploads WHERE id = ?1", UPLOAD_COLUMNS),
                [id.to_string()],
                UploadRow::read,
            )
            .optional()?;
        row.ok_or_else(|| SyncError::UploadNotFound(id.to_string()))?
            .into_upload()
    }

    /// Uploads of one project, or of every project.
    pub fn list_uploads(&self, project_id: Option<Uuid>) -> Result<Vec<UploadTransaction>> {
        let conn = self.conn()?;
        let rows = match project_id {
            Some(pid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM uploads WHERE project_id = ?1 ORDER BY created",
                    UPLOAD_COLUMNS
                ))?;
                stmt.query_map([pid.to_string()], UploadRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM uploads ORDER BY created",
                    UPLOAD_COLUMNS
                ))?;
                stmt.query_map([], UploadRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        rows.into_iter().map(UploadRow::into_upload).collect()
    }

    /// Move an upload to `to` if it is currently in one of `from`.
    /// Returns whether the transition happened.
    pub fn transition_upload(&self, id: Uuid, from: &[UploadState], to: UploadState) -> Result<bool> {
        let conn = self.conn()?;
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let n = conn.execute(
            &format!(
                "UPDATE uploads SET state = ?1 WHERE id = ?2 AND state IN ({})",
                allowed
            ),
            rusqlite::params![to.as_str(), id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Returns whether a row was deleted.
    pub fn delete_upload(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM uploads WHERE id = ?1", [id.to_string()])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UploadChanges, UploadFile, VersionChanges};
    use tempfile::TempDir;

    fn project(namespace: &str, name: &str) -> (Project, ProjectVersion) {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let project = Project {
            id,
            namespace: namespace.into(),
            name: name.into(),
            storage_dir: id.to_string(),
            files: vec![],
            disk_usage: 0,
            latest_version: VersionName::BASELINE,
            created: now,
            removed_at: None,
        };
        let baseline = ProjectVersion {
            project_id: id,
            name: VersionName::BASELINE,
            author: "alice".into(),
            created: now,
            ip_address: None,
            user_agent: None,
            device_id: None,
            changes: VersionChanges::default(),
            files: vec![],
            project_size: 0,
        };
        (project, baseline)
    }

    fn next_version(project: &Project, files: Vec<ProjectFile>) -> ProjectVersion {
        ProjectVersion {
            project_id: project.id,
            name: project.latest_version.next(),
            author: "bob".into(),
            created: Utc::now(),
            ip_address: Some("127.0.0.1".into()),
            user_agent: None,
            device_id: None,
            changes: VersionChanges {
                added: files.clone(),
                ..Default::default()
            },
            project_size: files.iter().map(|f| f.size).sum(),
            files,
        }
    }

    fn upload(project: &Project, blocking: bool) -> UploadTransaction {
        let mut changes = UploadChanges::default();
        changes
            .added
            .push(UploadFile::new("a.txt", 3, "abc").with_chunks(vec!["c1".into()]));
        UploadTransaction {
            id: Uuid::new_v4(),
            project_id: project.id,
            version: project.latest_version.next(),
            changes,
            user: "bob".into(),
            created: Utc::now(),
            blocking,
            state: UploadState::Created,
        }
    }

    fn file(path: &str, size: u64) -> ProjectFile {
        ProjectFile {
            path: path.into(),
            size,
            checksum: "abc".into(),
            location: format!("v1/{}", path),
            diff: None,
        }
    }

    #[test]
    fn test_create_and_find_project() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::open(&tmp.path().join("metadata.sqlite")).unwrap();
        let (p, v0) = project("acme", "survey");
        store.create_project(&p, &v0).unwrap();

        let found = store.find_project("acme", "survey").unwrap();
        assert_eq!(found.id, p.id);
        assert_eq!(found.latest_version, VersionName::BASELINE);
        assert!(store.version_exists(p.id, VersionName::BASELINE).unwrap());

        let (dup, dup_v0) = project("acme", "survey");
        assert!(matches!(
            store.create_project(&dup, &dup_v0),
            Err(SyncError::ProjectExists(_))
        ));
    }

    #[test]
    fn test_commit_version_advances_project() {
        let store = MetadataStore::open_in_memory().unwrap();
        let (p, v0) = project("acme", "survey");
        store.create_project(&p, &v0).unwrap();

        let files = vec![file("a.txt", 3)];
        let v1 = next_version(&p, files.clone());
        store
            .commit_version(&v1, VersionName::BASELINE, &files, 3, None)
            .unwrap();

        let p = store.get_project(p.id).unwrap();
        assert_eq!(p.latest_version, VersionName::new(1));
        assert_eq!(p.files, files);
        assert_eq!(p.disk_usage, 3);

        let v1 = store.get_version(p.id, VersionName::new(1)).unwrap();
        assert_eq!(v1.changes.added.len(), 1);
        assert_eq!(v1.ip_address.as_deref(), Some("127.0.0.1"));

        let all = store
            .list_versions(p.id, VersionName::BASELINE, VersionName::new(5))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, VersionName::BASELINE);
    }

    #[test]
    fn test_commit_version_compare_and_swap() {
        let store = MetadataStore::open_in_memory().unwrap();
        let (p, v0) = project("acme", "survey");
        store.create_project(&p, &v0).unwrap();

        let files = vec![file("a.txt", 3)];
        let v1 = next_version(&p, files.clone());
        store
            .commit_version(&v1, VersionName::BASELINE, &files, 3, None)
            .unwrap();
        // a racing push built on the same base loses
        let err = store
            .commit_version(&v1, VersionName::BASELINE, &files, 3, None)
            .unwrap_err();
        match err {
            SyncError::VersionMismatch { current, declared } => {
                assert_eq!(current, "v1");
                assert_eq!(declared, "v0");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.get_project(p.id).unwrap().latest_version, VersionName::new(1));
    }

    #[test]
    fn test_single_blocking_upload_per_project() {
        let store = MetadataStore::open_in_memory().unwrap();
        let (p, v0) = project("acme", "survey");
        store.create_project(&p, &v0).unwrap();

        store.insert_upload(&upload(&p, true)).unwrap();
        assert!(matches!(
            store.insert_upload(&upload(&p, true)),
            Err(SyncError::AnotherUploadRunning)
        ));
        // non-blocking uploads do not collide
        store.insert_upload(&upload(&p, false)).unwrap();
        store.insert_upload(&upload(&p, false)).unwrap();
        assert_eq!(store.list_uploads(Some(p.id)).unwrap().len(), 3);
    }

    #[test]
    fn test_upload_transitions() {
        let store = MetadataStore::open_in_memory().unwrap();
        let (p, v0) = project("acme", "survey");
        store.create_project(&p, &v0).unwrap();
        let u = upload(&p, true);
        store.insert_upload(&u).unwrap();

        let open = [UploadState::Created, UploadState::ChunksReceiving];
        assert!(store.transition_upload(u.id, &open, UploadState::Finalizing).unwrap());
        // second claim loses
        assert!(!store.transition_upload(u.id, &open, UploadState::Finalizing).unwrap());
        assert_eq!(store.get_upload(u.id).unwrap().state, UploadState::Finalizing);

        assert!(store.delete_upload(u.id).unwrap());
        assert!(matches!(store.get_upload(u.id), Err(SyncError::UploadNotFound(_))));
    }

    #[test]
    fn test_soft_delete_and_usage() {
        let store = MetadataStore::open_in_memory().unwrap();
        let (p, v0) = project("acme", "one");
        store.create_project(&p, &v0).unwrap();
        let files = vec![file("a.txt", 100)];
        store
            .commit_version(&next_version(&p, files.clone()), VersionName::BASELINE, &files, 100, None)
            .unwrap();
        assert_eq!(store.namespace_usage("acme").unwrap(), 100);

        store.set_removed(p.id, Some(Utc::now())).unwrap();
        assert_eq!(store.namespace_usage("acme").unwrap(), 0);
        assert!(store.list_projects(false).unwrap().is_empty());
        assert_eq!(store.list_projects(true).unwrap().len(), 1);

        store.delete_project(p.id).unwrap();
        assert!(matches!(store.get_project(p.id), Err(SyncError::ProjectNotFound(_))));
        assert!(!store.version_exists(p.id, VersionName::BASELINE).unwrap());
    }
}
