//! Core data model for geosync
//!
//! Projects own an ordered chain of immutable versions. Each version records
//! the change-set that produced it and the full file list as of that version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SyncError;

/// Version identifier, displayed and serialized as `v<N>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionName(u32);

impl VersionName {
    /// The empty baseline every project starts from.
    pub const BASELINE: VersionName = VersionName(0);

    pub fn new(number: u32) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// The version a successful push on top of this one produces.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Previous version, `None` for the baseline.
    pub fn prev(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for VersionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .and_then(|n| n.parse::<u32>().ok())
            .map(Self)
            .ok_or_else(|| SyncError::InvalidVersion(s.to_string()))
    }
}

impl TryFrom<String> for VersionName {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VersionName> for String {
    fn from(v: VersionName) -> Self {
        v.to_string()
    }
}

/// Diff descriptor attached to a file updated through a changeset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Diff file name as uploaded
    pub path: String,
    pub size: u64,
    pub checksum: String,
    /// Location relative to the project directory
    pub location: String,
}

/// A file tracked by a project at some version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub size: u64,
    /// SHA-1 hex digest of the full file
    pub checksum: String,
    /// Location relative to the project directory, e.g. `v3/data.gpkg`
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<FileDiff>,
}

/// Diff metadata declared by a client for an incremental update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDiff {
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

/// File descriptor declared by a client in a push.
///
/// For an update carrying `diff`, `chunks` hold the bytes of the diff and
/// `size`/`checksum` describe the full file after the diff is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<UploadDiff>,
}

impl UploadFile {
    pub fn new(path: impl Into<String>, size: u64, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            checksum: checksum.into(),
            chunks: Vec::new(),
            diff: None,
        }
    }

    pub fn with_chunks(mut self, chunks: Vec<String>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_diff(mut self, diff: UploadDiff) -> Self {
        self.diff = Some(diff);
        self
    }

    /// Number of bytes the uploaded chunks must add up to.
    pub fn expected_upload_size(&self) -> u64 {
        self.diff.as_ref().map(|d| d.size).unwrap_or(self.size)
    }

    /// Checksum the assembled upload must have.
    pub fn expected_upload_checksum(&self) -> &str {
        self.diff
            .as_ref()
            .map(|d| d.checksum.as_str())
            .unwrap_or(&self.checksum)
    }
}

/// Rename of a tracked file without content change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedFile {
    /// Old path
    pub path: String,
    pub new_path: String,
}

/// Four-way change-set declared by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChanges {
    #[serde(default)]
    pub added: Vec<UploadFile>,
    #[serde(default)]
    pub updated: Vec<UploadFile>,
    #[serde(default)]
    pub removed: Vec<UploadFile>,
    #[serde(default)]
    pub renamed: Vec<RenamedFile>,
}

impl UploadChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.renamed.is_empty()
    }

    /// Whether any bytes have to be uploaded for this change-set.
    pub fn has_payload(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty()
    }

    /// Pushes that only add new files do not block other pushes.
    pub fn is_blocking(&self) -> bool {
        !self.updated.is_empty() || !self.removed.is_empty() || !self.renamed.is_empty()
    }

    /// Files whose bytes are uploaded (added and updated).
    pub fn uploaded_files(&self) -> impl Iterator<Item = &UploadFile> {
        self.added.iter().chain(self.updated.iter())
    }

    /// Every chunk id declared across uploaded files.
    pub fn declared_chunks(&self) -> HashSet<&str> {
        self.uploaded_files()
            .flat_map(|f| f.chunks.iter().map(|c| c.as_str()))
            .collect()
    }
}

/// Kind of change a file went through in a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated => "updated",
            ChangeKind::Removed => "removed",
            ChangeKind::Renamed => "renamed",
        };
        f.write_str(s)
    }
}

/// Change-set as recorded on a version, resolved to stored locations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChanges {
    #[serde(default)]
    pub added: Vec<ProjectFile>,
    #[serde(default)]
    pub updated: Vec<ProjectFile>,
    #[serde(default)]
    pub removed: Vec<ProjectFile>,
    #[serde(default)]
    pub renamed: Vec<RenamedFile>,
}

impl VersionChanges {
    /// Find the change touching `path` in this version.
    ///
    /// For renames `path` is matched against the new name.
    pub fn find(&self, path: &str) -> Option<(ChangeKind, ChangeRef<'_>)> {
        if let Some(f) = self.added.iter().find(|f| f.path == path) {
            return Some((ChangeKind::Added, ChangeRef::File(f)));
        }
        if let Some(f) = self.updated.iter().find(|f| f.path == path) {
            return Some((ChangeKind::Updated, ChangeRef::File(f)));
        }
        if let Some(f) = self.removed.iter().find(|f| f.path == path) {
            return Some((ChangeKind::Removed, ChangeRef::File(f)));
        }
        self.renamed
            .iter()
            .find(|r| r.new_path == path)
            .map(|r| (ChangeKind::Renamed, ChangeRef::Rename(r)))
    }

    pub fn count(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len() + self.renamed.len()
    }
}

/// Borrowed view of one recorded change
#[derive(Debug, Clone, Copy)]
pub enum ChangeRef<'a> {
    File(&'a ProjectFile),
    Rename(&'a RenamedFile),
}

/// A project: a named, owned collection of versioned files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    /// Directory name under the projects root
    pub storage_dir: String,
    pub files: Vec<ProjectFile>,
    pub disk_usage: u64,
    pub latest_version: VersionName,
    pub created: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn file(&self, path: &str) -> Option<&ProjectFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// `namespace/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Immutable record of one project version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectVersion {
    pub project_id: Uuid,
    pub name: VersionName,
    pub author: String,
    pub created: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub changes: VersionChanges,
    /// Full file list as of this version
    pub files: Vec<ProjectFile>,
    pub project_size: u64,
}

impl ProjectVersion {
    pub fn file(&self, path: &str) -> Option<&ProjectFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Authenticated caller with request metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle state of a live upload transaction; finished uploads have no row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Created,
    ChunksReceiving,
    Finalizing,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Created => "created",
            UploadState::ChunksReceiving => "chunks_receiving",
            UploadState::Finalizing => "finalizing",
        }
    }
}

impl FromStr for UploadState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(UploadState::Created),
            "chunks_receiving" => Ok(UploadState::ChunksReceiving),
            "finalizing" => Ok(UploadState::Finalizing),
            other => Err(SyncError::internal(format!("Unknown upload state: {}", other))),
        }
    }
}

/// Server-side session tracking an in-progress push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTransaction {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Version this push will create
    pub version: VersionName,
    pub changes: UploadChanges,
    pub user: String,
    pub created: DateTime<Utc>,
    pub blocking: bool,
    pub state: UploadState,
}

/// Result of storing one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub checksum: String,
    pub size: u64,
}

/// Result of accepting a push
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Bytes are expected; upload chunks then finalize.
    Pending { transaction_id: Uuid },
    /// Nothing to upload, the version was committed right away.
    Committed(Box<ProjectVersion>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_name_roundtrip() {
        let v: VersionName = "v12".parse().unwrap();
        assert_eq!(v.number(), 12);
        assert_eq!(v.to_string(), "v12");
        assert_eq!(v.next().to_string(), "v13");
        assert_eq!(VersionName::BASELINE.prev(), None);
    }

    #[test]
    fn test_upload_state_only_live_states() {
        for state in [UploadState::Created, UploadState::ChunksReceiving, UploadState::Finalizing] {
            assert_eq!(state.as_str().parse::<UploadState>().unwrap(), state);
        }
        assert!("committed".parse::<UploadState>().is_err());
    }

    #[test]
    fn test_version_name_rejects_garbage() {
        assert!("12".parse::<VersionName>().is_err());
        assert!("v".parse::<VersionName>().is_err());
        assert!("v-1".parse::<VersionName>().is_err());
    }

    #[test]
    fn test_version_name_serde() {
        let json = serde_json::to_string(&VersionName::new(3)).unwrap();
        assert_eq!(json, "\"v3\"");
        let back: VersionName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VersionName::new(3));
        assert!(serde_json::from_str::<VersionName>("\"3\"").is_err());
    }

    #[test]
    fn test_versions_order_numerically() {
        let v2: VersionName = "v2".parse().unwrap();
        let v10: VersionName = "v10".parse().unwrap();
        assert!(v2 < v10);
    }

    #[test]
    fn test_changes_classification() {
        let mut changes = UploadChanges::default();
        assert!(changes.is_empty());

        changes.added.push(UploadFile::new("a.gpkg", 10, "x").with_chunks(vec!["c1".into()]));
        assert!(changes.has_payload());
        assert!(!changes.is_blocking());

        changes.renamed.push(RenamedFile {
            path: "b.txt".into(),
            new_path: "c.txt".into(),
        });
        assert!(changes.is_blocking());
        assert!(changes.declared_chunks().contains("c1"));
    }

    #[test]
    fn test_upload_file_expected_size_uses_diff() {
        let f = UploadFile::new("a.gpkg", 1000, "full").with_diff(UploadDiff {
            path: "a.gpkg-diff".into(),
            size: 40,
            checksum: "diff".into(),
        });
        assert_eq!(f.expected_upload_size(), 40);
        assert_eq!(f.expected_upload_checksum(), "diff");
    }

    #[test]
    fn test_version_changes_find_rename_by_new_path() {
        let changes = VersionChanges {
            renamed: vec![RenamedFile {
                path: "old.gpkg".into(),
                new_path: "new.gpkg".into(),
            }],
            ..Default::default()
        };
        let (kind, change) = changes.find("new.gpkg").unwrap();
        assert_eq!(kind, ChangeKind::Renamed);
        assert!(matches!(change, ChangeRef::Rename(r) if r.path == "old.gpkg"));
        assert!(changes.find("old.gpkg").is_none());
    }
}
