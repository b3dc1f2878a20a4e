//! Storage abstraction for project files
//!
//! Project bytes live under a per-project root with one directory per
//! version (`v0`, `v1`, ...) and a `tmp/<upload id>` staging area per
//! in-flight push. Removals are two-phase: entries are first renamed into a
//! quarantine directory and only purged after a grace window.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sha1::{Digest, Sha1};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::Result;
use crate::model::VersionName;

/// Temp root subfolder reserved for pending notifications; never purged.
pub const NOTIFICATIONS_DIR: &str = "notifications";

const QUARANTINE_STAMP: &str = "%Y%m%dT%H%M%S";

/// Backend holding project files.
///
/// Paths handed out are local: the changeset engine operates on files.
#[async_trait]
pub trait ProjectStorage: Send + Sync + std::fmt::Debug {
    /// Backend name, e.g. "local"
    fn backend(&self) -> &'static str;

    /// Root directory of a project.
    fn project_root(&self, storage_dir: &str) -> PathBuf;

    /// Global temp root for scratch work.
    fn temp_root(&self) -> PathBuf;

    /// Absolute path of a project-relative location.
    fn resolve(&self, storage_dir: &str, location: &str) -> PathBuf {
        self.project_root(storage_dir).join(location)
    }

    fn version_dir(&self, storage_dir: &str, version: VersionName) -> PathBuf {
        self.project_root(storage_dir).join(version.to_string())
    }

    /// Staging directory exclusively owned by one upload.
    fn staging_dir(&self, storage_dir: &str, upload_id: &Uuid) -> PathBuf {
        self.project_root(storage_dir)
            .join("tmp")
            .join(upload_id.to_string())
    }

    /// Create the project root with its empty baseline directory.
    async fn init_project(&self, storage_dir: &str) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;

    /// Copy a file, creating parent directories. Returns bytes copied.
    async fn copy_file(&self, from: &Path, to: &Path) -> Result<u64>;

    /// Move a file or directory, creating parent directories.
    async fn move_path(&self, from: &Path, to: &Path) -> Result<()>;

    /// Move `path` into quarantine. Returns the new location, or `None`
    /// when there was nothing to move.
    async fn quarantine(&self, path: &Path) -> Result<Option<PathBuf>>;

    /// Permanently delete quarantined entries created before `cutoff`.
    async fn purge_quarantine(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Delete temp root entries last modified before `cutoff`, except the
    /// reserved notifications folder.
    async fn purge_temp(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// SHA-1 hex digest and size of a file.
    async fn checksum(&self, path: &Path) -> Result<(String, u64)>;
}

/// Local filesystem storage
#[derive(Debug, Clone)]
pub struct DiskStorage {
    projects_root: PathBuf,
    temp_root: PathBuf,
    quarantine_root: PathBuf,
}

impl DiskStorage {
    /// Open storage rooted at the given directories, creating them.
    pub fn open(projects_root: PathBuf, temp_root: PathBuf, quarantine_root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&projects_root)?;
        fs::create_dir_all(&temp_root)?;
        fs::create_dir_all(&quarantine_root)?;
        Ok(Self {
            projects_root,
            temp_root,
            quarantine_root,
        })
    }

    pub fn quarantine_root(&self) -> &Path {
        &self.quarantine_root
    }
}

#[async_trait]
impl ProjectStorage for DiskStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn project_root(&self, storage_dir: &str) -> PathBuf {
        self.projects_root.join(storage_dir)
    }

    fn temp_root(&self) -> PathBuf {
        self.temp_root.clone()
    }

    async fn init_project(&self, storage_dir: &str) -> Result<()> {
        let baseline = self.version_dir(storage_dir, VersionName::BASELINE);
        tokio::fs::create_dir_all(&baseline).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<u64> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::copy(from, to).await?)
    }

    async fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn quarantine(&self, path: &Path) -> Result<Option<PathBuf>> {
        if !self.exists(path).await {
            return Ok(None);
        }
        let container = self.quarantine_root.join(format!(
            "{}-{}",
            Utc::now().format(QUARANTINE_STAMP),
            Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&container).await?;
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "entry".into());
        let dest = container.join(name);
        tokio::fs::rename(path, &dest).await?;
        tracing::debug!(from = %path.display(), to = %dest.display(), "Moved to quarantine");
        Ok(Some(dest))
    }

    async fn purge_quarantine(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        let mut entries = tokio::fs::read_dir(&self.quarantine_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let stamped = quarantine_time(&name);
            let created = match stamped {
                Some(t) => t,
                None => match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(m) => m.into(),
                    Err(_) => continue,
                },
            };
            if created >= cutoff {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => tracing::warn!("Failed to purge quarantined {:?}: {}", path, e),
            }
        }
        Ok(purged)
    }

    async fn purge_temp(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        let mut entries = tokio::fs::read_dir(&self.temp_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == NOTIFICATIONS_DIR {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(m) => m.into(),
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }
            let path = entry.path();
            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => tracing::warn!("Failed to remove temp entry {:?}: {}", path, e),
            }
        }
        Ok(purged)
    }

    async fn checksum(&self, path: &Path) -> Result<(String, u64)> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || file_checksum(&path)).await?
    }
}

fn quarantine_time(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.split('-').next()?;
    NaiveDateTime::parse_from_str(stamp, QUARANTINE_STAMP)
        .ok()
        .map(|t| t.and_utc())
}

/// Blocking SHA-1 of a file. Returns hex digest and size.
pub fn file_checksum(path: &Path) -> Result<(String, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> DiskStorage {
        DiskStorage::open(
            tmp.path().join("projects"),
            tmp.path().join("tmp"),
            tmp.path().join("quarantine"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_init_project_creates_baseline() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        storage.init_project("p1").await.unwrap();
        assert!(tmp.path().join("projects/p1/v0").is_dir());
        assert_eq!(
            storage.resolve("p1", "v3/a.gpkg"),
            tmp.path().join("projects/p1/v3/a.gpkg")
        );
    }

    #[tokio::test]
    async fn test_checksum_matches_sha1() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let path = tmp.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();
        let (checksum, size) = storage.checksum(&path).await.unwrap();
        assert_eq!(checksum, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(size, 5);
    }

    #[tokio::test]
    async fn test_quarantine_and_purge() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let path = tmp.path().join("projects/p1/v1/a.gpkg");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"data").unwrap();

        let moved = storage.quarantine(&path).await.unwrap().unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
        assert!(moved.starts_with(storage.quarantine_root()));

        // nothing to move the second time
        assert!(storage.quarantine(&path).await.unwrap().is_none());

        // still inside the grace window
        let purged = storage
            .purge_quarantine(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = storage
            .purge_quarantine(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(!moved.exists());
    }

    #[tokio::test]
    async fn test_purge_temp_keeps_notifications() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        fs::create_dir_all(tmp.path().join("tmp").join(NOTIFICATIONS_DIR)).unwrap();
        fs::create_dir_all(tmp.path().join("tmp/scratch-1")).unwrap();
        fs::write(tmp.path().join("tmp/leftover.bin"), b"x").unwrap();

        let purged = storage
            .purge_temp(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 2);
        assert!(tmp.path().join("tmp").join(NOTIFICATIONS_DIR).exists());
        assert!(!tmp.path().join("tmp/scratch-1").exists());
    }

    #[test]
    fn test_quarantine_time_parsing() {
        let t = quarantine_time("20260102T030405-abcdef").unwrap();
        assert_eq!(t.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-02 03:04:05");
        assert!(quarantine_time("garbage").is_none());
    }
}
