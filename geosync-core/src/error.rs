//! Error taxonomy for the sync engine
//!
//! Every failure surfaced to callers is a [`SyncError`]. Errors are grouped
//! into an [`ErrorClass`] so the outer layer can decide how to report them
//! (client mistake, integrity failure, changeset failure, conflict, fatal).

use std::collections::BTreeMap;

use crate::changeset::ChangesetError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; nothing changed server side, client retries with fixed input.
    Client,
    /// Uploaded bytes do not match what was declared; full re-upload required.
    Integrity,
    /// The changeset engine could not compute or apply a diff.
    Changeset,
    /// Concurrent activity got in the way; retry later.
    Conflict,
    /// Unexpected server-side failure.
    Fatal,
}

/// Errors that can occur while pushing, reading or reclaiming project data
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project already exists: {0}")]
    ProjectExists(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Invalid version name: {0}")]
    InvalidVersion(String),

    #[error("Version mismatch: project is at {current}, push declared {declared}")]
    VersionMismatch { current: String, declared: String },

    #[error("No changes to push")]
    NoChanges,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Duplicate path in push: {0}")]
    DuplicatePath(String),

    #[error("File not found in project: {0}")]
    FileNotFound(String),

    #[error("File already exists in project: {0}")]
    FileExists(String),

    #[error("File {path} is missing upload chunks")]
    MissingUploadData { path: String },

    #[error("File {0} cannot be updated with a diff")]
    NotDiffable(String),

    #[error("Storage quota exceeded: {required} bytes required, {available} available")]
    QuotaExceeded { required: u64, available: u64 },

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("Chunk {0} is not declared by this upload")]
    ChunkNotDeclared(String),

    #[error("Chunk exceeds the maximum size of {limit} bytes")]
    ChunkTooLarge { limit: u64 },

    #[error("Missing chunks: {0:?}")]
    MissingChunks(Vec<String>),

    #[error("Corrupted files: {0:?}")]
    CorruptedFiles(Vec<String>),

    #[error("Failed to apply changes: {0:?}")]
    DataSync(BTreeMap<String, String>),

    #[error("Another process is running, please try later")]
    AnotherUploadRunning,

    #[error("Upload {0} is already being finalized")]
    UploadConflict(String),

    #[error("Version {0} already exists")]
    VersionExists(String),

    #[error("No changeset for {path} at {version}")]
    NoChangeset { path: String, version: String },

    #[error(transparent)]
    Changeset(#[from] ChangesetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::CorruptedFiles(_) => ErrorClass::Integrity,
            SyncError::DataSync(_) | SyncError::Changeset(_) | SyncError::NoChangeset { .. } => {
                ErrorClass::Changeset
            }
            SyncError::AnotherUploadRunning
            | SyncError::UploadConflict(_)
            | SyncError::VersionExists(_) => ErrorClass::Conflict,
            SyncError::Io(_)
            | SyncError::Database(_)
            | SyncError::Serialization(_)
            | SyncError::Internal(_) => ErrorClass::Fatal,
            _ => ErrorClass::Client,
        }
    }

    /// Whether the same request may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict | ErrorClass::Fatal)
    }

    /// Per-file error map for changeset failures, if any.
    pub fn file_errors(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            SyncError::DataSync(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Internal(format!("Background task failed: {}", e))
    }
}
