//! Collaborators the engine consumes
//!
//! - [`PermissionChecker`]: may a principal act on a project
//! - [`QuotaService`]: namespace disk usage and limits
//! - [`NotificationSink`]: fire-and-forget events after a commit
//!
//! Notifications go to hook scripts in `<data_root>/hooks/<event>`. The
//! JSON payload is piped to the script's stdin; a failing hook is logged and
//! never fails the operation that triggered it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::metadata::MetadataStore;
use crate::model::{Principal, Project};

/// Event fired after a version was committed.
pub const PUSH_FINISHED: &str = "push_finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectAction {
    Read,
    Write,
    Admin,
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check_permission(
        &self,
        project: &Project,
        principal: &Principal,
        action: ProjectAction,
    ) -> bool;
}

/// Grants everything; used by operator tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check_permission(&self, _: &Project, _: &Principal, _: ProjectAction) -> bool {
        true
    }
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Bytes used by all live projects of a namespace.
    async fn current_disk_usage(&self, namespace: &str) -> Result<u64>;

    async fn storage_limit(&self, namespace: &str) -> Result<u64>;
}

/// Usage from the metadata store, limits from configuration
pub struct MetadataQuota {
    metadata: Arc<MetadataStore>,
    default_limit: u64,
    limits: HashMap<String, u64>,
}

impl MetadataQuota {
    pub fn new(metadata: Arc<MetadataStore>, default_limit: u64, limits: HashMap<String, u64>) -> Self {
        Self {
            metadata,
            default_limit,
            limits,
        }
    }
}

#[async_trait]
impl QuotaService for MetadataQuota {
    async fn current_disk_usage(&self, namespace: &str) -> Result<u64> {
        self.metadata.namespace_usage(namespace)
    }

    async fn storage_limit(&self, namespace: &str) -> Result<u64> {
        Ok(self.limits.get(namespace).copied().unwrap_or(self.default_limit))
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver an event. Never fails; delivery problems are logged.
    async fn notify(&self, event: &str, payload: &serde_json::Value);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, _: &str, _: &serde_json::Value) {}
}

/// Runs `<hooks_dir>/<event>` with the payload on stdin.
#[derive(Debug, Clone)]
pub struct HookNotifier {
    hooks_dir: PathBuf,
}

impl HookNotifier {
    pub fn new(hooks_dir: PathBuf) -> Self {
        Self { hooks_dir }
    }

    pub fn hook_path(&self, event: &str) -> PathBuf {
        self.hooks_dir.join(event)
    }

    /// Ensure the hooks directory exists.
    pub fn ensure_hooks_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hooks_dir)?;
        Ok(())
    }
}

fn run_hook(hook_path: &Path, data_root: &Path, stdin_data: &str) -> Result<()> {
    let mut child = Command::new(hook_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("GEOSYNC_DATA_ROOT", data_root)
        .spawn()
        .map_err(|e| SyncError::internal(format!("Failed to execute hook {:?}: {}", hook_path, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(stdin_data.as_bytes());
    }

    let output = child.wait_with_output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let msg = if stderr.trim().is_empty() {
        format!("exited with code {}", output.status.code().unwrap_or(-1))
    } else {
        stderr.trim().to_string()
    };
    Err(SyncError::internal(format!("Hook {:?} failed: {}", hook_path, msg)))
}

#[async_trait]
impl NotificationSink for HookNotifier {
    async fn notify(&self, event: &str, payload: &serde_json::Value) {
        let hook_path = self.hook_path(event);
        if !hook_path.exists() {
            return;
        }
        let data_root = self
            .hooks_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let data = payload.to_string();
        let event = event.to_string();
        let result = tokio::task::spawn_blocking(move || run_hook(&hook_path, &data_root, &data)).await;
        match result {
            Ok(Ok(())) => tracing::debug!("Hook {} delivered", event),
            Ok(Err(e)) => tracing::warn!("{} hook error (ignored): {}", event, e),
            Err(e) => tracing::warn!("{} hook task failed (ignored): {}", event, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_hook(dir: &Path, name: &str, script: &str) {
        let hooks_dir = dir.join("hooks");
        fs::create_dir_all(&hooks_dir).unwrap();
        let hook_path = hooks_dir.join(name);
        fs::write(&hook_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&hook_path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_receives_payload() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("received.json");
        make_hook(
            tmp.path(),
            PUSH_FINISHED,
            &format!("#!/bin/sh\ncat > '{}'\n", out.display()),
        );
        let notifier = HookNotifier::new(tmp.path().join("hooks"));
        notifier
            .notify(PUSH_FINISHED, &serde_json::json!({"version": "v1"}))
            .await;
        let received: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(received["version"], "v1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_hook_is_ignored() {
        let tmp = TempDir::new().unwrap();
        make_hook(tmp.path(), PUSH_FINISHED, "#!/bin/sh\necho oops >&2\nexit 1\n");
        let notifier = HookNotifier::new(tmp.path().join("hooks"));
        notifier.notify(PUSH_FINISHED, &serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn test_missing_hook_is_noop() {
        let tmp = TempDir::new().unwrap();
        let notifier = HookNotifier::new(tmp.path().join("hooks"));
        notifier.ensure_hooks_dir().unwrap();
        notifier.notify("unknown_event", &serde_json::json!({})).await;
        assert!(tmp.path().join("hooks").is_dir());
    }

    #[tokio::test]
    async fn test_metadata_quota_limits() {
        let metadata = Arc::new(MetadataStore::open_in_memory().unwrap());
        let mut limits = HashMap::new();
        limits.insert("big".to_string(), 1_000_000);
        let quota = MetadataQuota::new(metadata, 100, limits);
        assert_eq!(quota.storage_limit("big").await.unwrap(), 1_000_000);
        assert_eq!(quota.storage_limit("small").await.unwrap(), 100);
        assert_eq!(quota.current_disk_usage("small").await.unwrap(), 0);
    }
}
