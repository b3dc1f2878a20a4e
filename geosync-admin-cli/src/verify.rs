//! Verify stored project data against the metadata store

use anyhow::{Result, anyhow};
use geosync_core::{Project, ProjectStorage as _, SyncEngine, VersionName};

/// Outcome of a verification run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified_files: u64,
    pub verified_diffs: u64,
    pub errors: u64,
    pub warnings: u64,
}

/// Check that every current file exists with its recorded checksum and
/// that every changeset recorded in the version chain is still stored.
///
/// Missing materialized copies of older versions are not errors: they are
/// reclaimed on purpose and can be restored.
pub async fn check_project(engine: &SyncEngine, project: &Project, quiet: bool) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let storage = engine.storage();

    for file in &project.files {
        let path = storage.resolve(&project.storage_dir, &file.location);
        match storage.checksum(&path).await {
            Ok((checksum, size)) if checksum == file.checksum && size == file.size => {
                report.verified_files += 1;
            }
            Ok((checksum, size)) => {
                report.errors += 1;
                if !quiet {
                    eprintln!(
                        "  ERROR: {} is {} bytes ({}), expected {} bytes ({})",
                        file.path, size, checksum, file.size, file.checksum
                    );
                }
            }
            Err(e) => {
                report.errors += 1;
                if !quiet {
                    eprintln!("  ERROR: {} unreadable at {}: {}", file.path, file.location, e);
                }
            }
        }
    }

    let versions = engine
        .metadata()
        .list_versions(project.id, VersionName::BASELINE, project.latest_version)?;
    if versions.len() as u32 != project.latest_version.number() + 1 {
        report.warnings += 1;
        if !quiet {
            eprintln!(
                "  WARNING: {} versions recorded, expected {}",
                versions.len(),
                project.latest_version.number() + 1
            );
        }
    }
    for version in &versions {
        for file in &version.changes.updated {
            let Some(diff) = &file.diff else {
                continue;
            };
            if storage.resolve(&project.storage_dir, &diff.location).exists() {
                report.verified_diffs += 1;
            } else {
                report.errors += 1;
                if !quiet {
                    eprintln!("  ERROR: changeset of {} at {} is missing", file.path, version.name);
                }
            }
        }
    }
    Ok(report)
}

pub async fn verify_project(engine: &SyncEngine, project: &Project, quiet: bool) -> Result<()> {
    if !quiet {
        println!("Verifying project: {}", project.full_name());
        println!("  Versions: v0 to {}", project.latest_version);
        println!();
    }
    let report = check_project(engine, project, quiet).await?;
    if !quiet {
        println!("Verified {} files, {} changesets", report.verified_files, report.verified_diffs);
        if report.warnings > 0 {
            println!("{} warnings", report.warnings);
        }
    }
    if report.errors > 0 {
        return Err(anyhow!("{} errors found in {}", report.errors, project.full_name()));
    }
    Ok(())
}
