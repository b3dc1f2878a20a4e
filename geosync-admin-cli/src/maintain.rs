//! Maintenance passes over the whole data root

use anyhow::Result;
use geosync_core::{ReclaimReport, SyncEngine};
use std::time::Duration;

/// Run every reclamation sweep once.
pub async fn run_once(engine: &SyncEngine) -> Result<ReclaimReport> {
    Ok(engine.reclaimer().run_all(chrono::Utc::now()).await?)
}

/// Run a pass every `every` until interrupted. A failed pass is logged and
/// the loop carries on.
pub async fn run_periodic(engine: &SyncEngine, every: Duration) -> Result<()> {
    tracing::info!("Running maintenance every {:?}", every);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_once(engine).await {
                    tracing::error!("Maintenance pass failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping maintenance");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::SyncConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_once_on_empty_root() {
        let tmp = TempDir::new().unwrap();
        let engine = SyncEngine::open(SyncConfig::with_root(tmp.path())).unwrap();
        let report = run_once(&engine).await.unwrap();
        assert_eq!(report, ReclaimReport::default());
    }
}
