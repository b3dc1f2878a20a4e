//! Geosync Administration CLI

mod maintain;
mod verify;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use geosync_core::{Principal, Project, ProjectStorage as _, SyncConfig, SyncEngine, VersionName};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "geosync-admin")]
#[command(author = "Geosync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Geosync data root administration and maintenance tool")]
struct Cli {
    /// Data root holding projects, metadata and configuration
    #[arg(short, long, global = true, default_value = "./data")]
    root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a data root with the default configuration
    Init,

    /// Create an empty project
    CreateProject {
        /// `namespace/name`
        project: String,
    },

    /// Soft-delete a project
    Delete { project: String },

    /// Bring back a soft-deleted project
    Undelete { project: String },

    /// List projects
    List {
        #[arg(long)]
        all: bool,
    },

    /// List the versions of a project
    Versions { project: String },

    /// Show the history of a file
    History {
        project: String,
        path: String,
        #[arg(long)]
        since: Option<VersionName>,
        #[arg(long)]
        until: Option<VersionName>,
    },

    /// Show the changeset summary of a file at a version
    Summary {
        project: String,
        version: VersionName,
        path: String,
        /// List row-level changes instead of per-table counts
        #[arg(long)]
        rows: bool,
    },

    /// Rebuild a reclaimed copy of a file at a version
    Restore {
        project: String,
        version: VersionName,
        path: String,
    },

    /// Check that every current file is stored with its recorded checksum
    Verify {
        project: String,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Quarantine expired copies of diff-updated files
    Optimize,

    /// Purge expired entries of the global temp root
    Cleanup,

    /// Purge projects deleted longer than the expiration
    PurgeDeleted,

    /// Permanently delete expired quarantine entries
    PurgeQuarantine,

    /// Reap uploads whose lockfile went stale
    ReapUploads,

    /// Run every sweep, once or periodically
    Maintain {
        /// Seconds between passes; runs a single pass when omitted
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn operator() -> Principal {
    Principal::new("geosync-admin")
}

fn open_engine(root: &Path) -> Result<SyncEngine> {
    let config = SyncConfig::load(root).with_context(|| format!("Failed to load config from {:?}", root))?;
    Ok(SyncEngine::open(config)?)
}

/// Split `namespace/name`.
fn parse_project_ref(reference: &str) -> Result<(&str, &str)> {
    reference
        .split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| anyhow!("Expected <namespace>/<name>, got {:?}", reference))
}

/// Resolve a project reference, soft-deleted projects included.
fn lookup(engine: &SyncEngine, reference: &str) -> Result<Project> {
    let (namespace, name) = parse_project_ref(reference)?;
    Ok(engine.metadata().find_project(namespace, name)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let admin = operator();

    match cli.command {
        Commands::Init => {
            let config = SyncConfig::load(&cli.root)?;
            config.save()?;
            SyncEngine::open(config)?;
            println!("Data root initialized at {}", cli.root.display());
        }

        Commands::CreateProject { project } => {
            let engine = open_engine(&cli.root)?;
            let (namespace, name) = parse_project_ref(&project)?;
            let created = engine.create_project(namespace, name, &admin).await?;
            println!("Created {} ({})", created.full_name(), created.id);
        }

        Commands::Delete { project } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            engine.delete_project(p.id, &admin).await?;
            println!("Deleted {}", p.full_name());
        }

        Commands::Undelete { project } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            let p = engine.undelete_project(p.id, &admin).await?;
            println!("Restored {} at {}", p.full_name(), p.latest_version);
        }

        Commands::List { all } => {
            let engine = open_engine(&cli.root)?;
            for p in engine.list_projects(all)? {
                let state = if p.is_removed() { " (deleted)" } else { "" };
                println!(
                    "{}\t{}\t{} files\t{} bytes{}",
                    p.full_name(),
                    p.latest_version,
                    p.files.len(),
                    p.disk_usage,
                    state
                );
            }
        }

        Commands::Versions { project } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            for v in engine.list_versions(p.id, &admin).await? {
                println!(
                    "{}\t{}\t{}\t+{} ~{} -{} >{}",
                    v.name,
                    v.created.to_rfc3339(),
                    v.author,
                    v.changes.added.len(),
                    v.changes.updated.len(),
                    v.changes.removed.len(),
                    v.changes.renamed.len()
                );
            }
        }

        Commands::History {
            project,
            path,
            since,
            until,
        } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            let history = engine
                .get_file_history(p.id, &admin, &path, since, until)
                .await?;
            print_json(&history)?;
        }

        Commands::Summary {
            project,
            version,
            path,
            rows,
        } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            if rows {
                let changes = engine
                    .get_changeset_changes(p.id, &admin, version, &path)
                    .await?;
                print_json(&changes)?;
            } else {
                let summary = engine
                    .get_changeset_summary(p.id, &admin, version, &path)
                    .await?;
                print_json(&summary)?;
            }
        }

        Commands::Restore {
            project,
            version,
            path,
        } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            engine.restore_versioned_file(p.id, &path, version).await;
            let record = engine.get_version(p.id, &admin, version).await?;
            let file = record
                .file(&path)
                .ok_or_else(|| anyhow!("{} is not part of {}", path, version))?;
            let stored = engine.storage().resolve(&p.storage_dir, &file.location);
            if stored.exists() {
                println!("{} at {} is available at {}", path, version, stored.display());
            } else {
                return Err(anyhow!("Could not restore {} at {}", path, version));
            }
        }

        Commands::Verify { project, quiet } => {
            let engine = open_engine(&cli.root)?;
            let p = lookup(&engine, &project)?;
            verify::verify_project(&engine, &p, quiet).await?;
        }

        Commands::Optimize => {
            let engine = open_engine(&cli.root)?;
            let n = engine.reclaimer().optimize_storage(chrono::Utc::now()).await?;
            println!("Quarantined {} expired file copies", n);
        }

        Commands::Cleanup => {
            let engine = open_engine(&cli.root)?;
            let n = engine.reclaimer().cleanup_temp(chrono::Utc::now()).await?;
            println!("Removed {} temp entries", n);
        }

        Commands::PurgeDeleted => {
            let engine = open_engine(&cli.root)?;
            let n = engine
                .reclaimer()
                .purge_deleted_projects(chrono::Utc::now())
                .await?;
            println!("Purged {} deleted projects", n);
        }

        Commands::PurgeQuarantine => {
            let engine = open_engine(&cli.root)?;
            let n = engine.reclaimer().purge_quarantine(chrono::Utc::now()).await?;
            println!("Deleted {} quarantine entries", n);
        }

        Commands::ReapUploads => {
            let engine = open_engine(&cli.root)?;
            let n = engine.reclaimer().reap_stale_uploads().await?;
            println!("Reaped {} stale uploads", n);
        }

        Commands::Maintain { interval } => {
            let engine = open_engine(&cli.root)?;
            match interval {
                Some(secs) => maintain::run_periodic(&engine, std::time::Duration::from_secs(secs)).await?,
                None => print_json(&maintain::run_once(&engine).await?)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_ref() {
        assert_eq!(parse_project_ref("acme/survey").unwrap(), ("acme", "survey"));
        assert!(parse_project_ref("survey").is_err());
        assert!(parse_project_ref("/survey").is_err());
        assert!(parse_project_ref("acme/a/b").is_err());
    }

    #[test]
    fn test_cli_parses_version_names() {
        let cli = Cli::try_parse_from(["geosync-admin", "summary", "acme/survey", "v3", "data.gpkg"]).unwrap();
        match cli.command {
            Commands::Summary { version, .. } => assert_eq!(version, VersionName::new(3)),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["geosync-admin", "summary", "acme/survey", "three", "x"]).is_err());
    }
}
