//! Geosync Core Library
//!
//! Versioned, multi-tenant storage for geospatial project files:
//! - Chunked upload transactions with exclusive per-project commits
//! - SQLite changesets for diff-based updates of GeoPackage files
//! - Per-file history across versions, renames included
//! - Restore of reclaimed files from basefile plus changeset chain
//! - Storage reclamation sweeps backed by a quarantine
//! - SQLite metadata store (WAL mode)

pub mod builder;
pub mod changeset;
pub mod chunks;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod metadata;
pub mod model;
pub mod paths;
pub mod reclaim;
pub mod services;
pub mod storage;
pub mod upload;

pub use builder::{BuiltVersion, PlacedFile, VersionBuilder};
pub use changeset::{
    CellValue, ChangesetEngine, ChangesetError, ChangesetSummary, ColumnChange, RowChange, RowOperation,
    SqliteChangesetEngine, TableSummary,
};
pub use chunks::ChunkStore;
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorClass, Result, SyncError};
pub use history::{FileHistory, HistoryEntry, HistoryResolver};
pub use metadata::MetadataStore;
pub use model::{
    ChangeKind, ChunkReceipt, FileDiff, Principal, Project, ProjectFile, ProjectVersion, PushOutcome,
    RenamedFile, UploadChanges, UploadDiff, UploadFile, UploadState, UploadTransaction, VersionChanges,
    VersionName,
};
pub use reclaim::{ReclaimReport, Reclaimer};
pub use services::{
    AllowAll, HookNotifier, MetadataQuota, NotificationSink, NullNotifier, PermissionChecker, ProjectAction,
    QuotaService,
};
pub use storage::{DiskStorage, ProjectStorage};
pub use upload::UploadManager;
