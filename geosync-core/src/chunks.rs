//! Staging of uploaded chunks
//!
//! Each upload owns a staging directory:
//!
//! ```text
//! <staging>/chunks/<chunk id>   uploaded chunk bytes
//! <staging>/files/<path>        files assembled from chunks
//! <staging>/lockfile            liveness marker, refreshed while writing
//! ```

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::model::ChunkReceipt;

const COPY_BUFFER: usize = 1024 * 1024;
const YIELD_EVERY: u64 = 4 * 1024 * 1024;

/// Writes and concatenates upload chunks
#[derive(Debug, Clone)]
pub struct ChunkStore {
    max_chunk_size: u64,
}

impl ChunkStore {
    pub fn new(max_chunk_size: u64) -> Self {
        Self { max_chunk_size }
    }

    pub fn chunks_dir(staging: &Path) -> PathBuf {
        staging.join("chunks")
    }

    pub fn files_dir(staging: &Path) -> PathBuf {
        staging.join("files")
    }

    pub fn lockfile(staging: &Path) -> PathBuf {
        staging.join("lockfile")
    }

    pub fn chunk_path(staging: &Path, chunk_id: &str) -> Result<PathBuf> {
        validate_chunk_id(chunk_id)?;
        Ok(Self::chunks_dir(staging).join(chunk_id))
    }

    /// Stream one chunk to disk, hashing as it goes.
    ///
    /// The chunk becomes visible only once fully written. Every write goes
    /// to its own partial file, so retries of one chunk never interleave.
    /// Exceeding the size cap removes the partial file.
    pub async fn write_chunk<S>(&self, staging: &Path, chunk_id: &str, mut stream: S) -> Result<ChunkReceipt>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        let dest = Self::chunk_path(staging, chunk_id)?;
        let partial = Self::chunks_dir(staging).join(format!("{}.{}.part", chunk_id, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(Self::chunks_dir(staging)).await?;

        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha1::new();
        let mut size = 0u64;
        let written: Result<()> = async {
            while let Some(piece) = stream.next().await {
                let piece = piece?;
                size += piece.len() as u64;
                if size > self.max_chunk_size {
                    return Err(SyncError::ChunkTooLarge {
                        limit: self.max_chunk_size,
                    });
                }
                hasher.update(&piece);
                file.write_all(&piece).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &dest).await?;
        Ok(ChunkReceipt {
            checksum: hex::encode(hasher.finalize()),
            size,
        })
    }

    pub async fn has_chunk(&self, staging: &Path, chunk_id: &str) -> bool {
        match Self::chunk_path(staging, chunk_id) {
            Ok(p) => tokio::fs::try_exists(p).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Declared chunks not yet uploaded.
    pub async fn missing_chunks<'a>(
        &self,
        staging: &Path,
        chunk_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let mut missing = Vec::new();
        for id in chunk_ids {
            if !self.has_chunk(staging, id).await {
                missing.push(id.to_string());
            }
        }
        missing.sort();
        missing
    }

    /// Concatenate chunks in order into `dest`. Returns the assembled size.
    pub async fn assemble(&self, staging: &Path, chunk_ids: &[String], dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut total = 0u64;
        let mut since_yield = 0u64;
        for id in chunk_ids {
            let mut chunk = tokio::fs::File::open(Self::chunk_path(staging, id)?).await?;
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                total += n as u64;
                since_yield += n as u64;
                if since_yield >= YIELD_EVERY {
                    since_yield = 0;
                    tokio::task::yield_now().await;
                }
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(total)
    }
}

fn validate_chunk_id(chunk_id: &str) -> Result<()> {
    let valid = !chunk_id.is_empty()
        && chunk_id.len() <= 128
        && chunk_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::ChunkNotDeclared(chunk_id.to_string()))
    }
}

/// Set the lockfile mtime to now, creating it if needed.
pub fn touch_lockfile(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.set_modified(SystemTime::now())
}

/// Time since the lockfile was last touched, `None` if it is missing.
pub fn lockfile_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// Keeps a lockfile fresh until dropped.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(lockfile: PathBuf, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = touch_lockfile(&lockfile) {
                    tracing::warn!("Failed to refresh lockfile {:?}: {}", lockfile, e);
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_write_chunk_returns_receipt() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::new(1024);
        let receipt = store
            .write_chunk(tmp.path(), "c1", chunks(&["hel", "lo"]))
            .await
            .unwrap();
        assert_eq!(receipt.size, 5);
        assert_eq!(receipt.checksum, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert!(store.has_chunk(tmp.path(), "c1").await);
    }

    #[tokio::test]
    async fn test_oversize_chunk_is_removed() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::new(4);
        let err = store
            .write_chunk(tmp.path(), "big", chunks(&["abc", "def"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ChunkTooLarge { limit: 4 }));
        assert!(!store.has_chunk(tmp.path(), "big").await);
        let leftovers = std::fs::read_dir(ChunkStore::chunks_dir(tmp.path())).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writes_of_one_chunk_do_not_mix() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::new(1024);
        let (first, second) = tokio::join!(
            store.write_chunk(tmp.path(), "c1", chunks(&["aaa", "aaa", "aaa"])),
            store.write_chunk(tmp.path(), "c1", chunks(&["bbb", "bbb", "bbb"]))
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.checksum, second.checksum);

        let stored = std::fs::read(ChunkStore::chunk_path(tmp.path(), "c1").unwrap()).unwrap();
        let checksum = hex::encode(Sha1::digest(&stored));
        assert!(checksum == first.checksum || checksum == second.checksum);
        assert!(stored == b"aaaaaaaaa" || stored == b"bbbbbbbbb");
        let entries = std::fs::read_dir(ChunkStore::chunks_dir(tmp.path())).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_unsafe_chunk_id_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::new(1024);
        for id in ["", "../x", "a/b", "."] {
            assert!(store.write_chunk(tmp.path(), id, chunks(&["x"])).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_assemble_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::new(1024);
        store.write_chunk(tmp.path(), "b", chunks(&["world"])).await.unwrap();
        store.write_chunk(tmp.path(), "a", chunks(&["hello "])).await.unwrap();

        let dest = ChunkStore::files_dir(tmp.path()).join("dir/out.txt");
        let size = store
            .assemble(tmp.path(), &["a".to_string(), "b".to_string()], &dest)
            .await
            .unwrap();
        assert_eq!(size, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");

        let missing = store.missing_chunks(tmp.path(), ["a", "b", "c"]).await;
        assert_eq!(missing, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_touches_lockfile() {
        let tmp = TempDir::new().unwrap();
        let lockfile = tmp.path().join("lockfile");
        touch_lockfile(&lockfile).unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&lockfile)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(lockfile_age(&lockfile).unwrap() >= Duration::from_secs(3500));

        let heartbeat = Heartbeat::start(lockfile.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(heartbeat);
        assert!(lockfile_age(&lockfile).unwrap() < Duration::from_secs(60));
    }

    #[test]
    fn test_missing_lockfile_has_no_age() {
        let tmp = TempDir::new().unwrap();
        assert!(lockfile_age(&tmp.path().join("nope")).is_none());
    }
}
