//! Command implementations for `ghostctl`.

use anyhow::{Context, Result, bail};
use ghost_core::GhostConfig;
use ghost_vfs::archive::extract_archive;
use ghost_vfs::{GhostService, SyncReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Overrides taken from global command-line flags.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub data_root: Option<PathBuf>,
    pub database_url: Option<String>,
    pub disk_only: bool,
}

pub async fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<GhostConfig> {
    let mut config = GhostConfig::load_or_default(path)
        .await
        .context("Failed to load configuration")?;

    if let Some(root) = &overrides.data_root {
        config.storage.data_root = root.clone();
    }
    if let Some(url) = &overrides.database_url {
        config.storage.database_url = url.clone();
    }
    if overrides.disk_only {
        config.storage.use_db_driver = false;
    }
    config.validate()?;
    Ok(config)
}

async fn open_service(config: GhostConfig) -> Result<Arc<GhostService>> {
    let use_db = config.storage.use_db_driver;
    let service = GhostService::from_config(config)
        .await
        .context("Failed to open storage")?;
    service.initialize(use_db, true).await?;
    Ok(Arc::new(service))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Push the disk trees into the database, for one bot or everything.
pub async fn sync(config: GhostConfig, bot: Option<String>) -> Result<()> {
    let service = open_service(config).await?;
    if !service.uses_db() {
        bail!("Sync needs the database driver; remove --disk-only");
    }

    let mut reports: Vec<(String, SyncReport)> = Vec::new();
    match bot {
        Some(bot_id) => {
            let report = service.for_bot(&bot_id)?.sync().await?;
            reports.push((bot_id, report));
        }
        None => {
            reports.push(("global".to_string(), service.global()?.sync().await?));
            reports.push(("bots".to_string(), service.bots()?.sync().await?));
        }
    }

    for (scope, report) in &reports {
        info!(
            "{}: {} uploaded, {} deleted, {} revisions cleared",
            scope, report.files_uploaded, report.files_deleted, report.revisions_cleared
        );
    }
    print_json(&reports.into_iter().collect::<BTreeMap<_, _>>())
}

pub async fn changes(config: GhostConfig, tmp: PathBuf) -> Result<()> {
    let service = open_service(config).await?;
    let changes = service.list_file_changes(&tmp).await?;

    let total: usize = changes.iter().map(|c| c.changes.len()).sum();
    info!("{} changes across {} scopes", total, changes.len());
    print_json(&changes)
}

pub async fn force_update(config: GhostConfig, tmp: PathBuf) -> Result<()> {
    let service = open_service(config).await?;
    let report = service.force_update(&tmp).await?;
    print_json(&report)?;

    if !report.errors.is_empty() {
        bail!("{} files could not be updated", report.errors.len());
    }
    Ok(())
}

pub async fn export(config: GhostConfig, out: PathBuf) -> Result<()> {
    let service = open_service(config).await?;
    let bytes = service.export_archive().await?;
    tokio::fs::write(&out, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;

    info!("Wrote {} bytes to {}", bytes.len(), out.display());
    Ok(())
}

pub async fn extract(archive: PathBuf, out: PathBuf) -> Result<()> {
    let bytes = tokio::fs::read(&archive)
        .await
        .with_context(|| format!("Failed to read {}", archive.display()))?;
    let files = extract_archive(bytes, &out).await?;
    for file in &files {
        println!("{}", file);
    }
    Ok(())
}

pub async fn pending(config: GhostConfig, bots: Vec<String>) -> Result<()> {
    let service = open_service(config).await?;
    let bots = if bots.is_empty() {
        service.list_bot_ids().await?
    } else {
        bots
    };
    print_json(&service.get_pending(&bots).await?)
}

/// Run the file watcher and the sync listener until interrupted.
pub async fn watch(config: GhostConfig) -> Result<()> {
    let service = open_service(config).await?;
    service.start_sync_listener();
    if !service.start_watcher().await? {
        bail!("The file watcher is disabled in configuration");
    }

    info!("Watching {}", service.config().storage.data_root.display());
    let Some(mut changes) = service.subscribe_file_changes() else {
        bail!("The file watcher did not start");
    };

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = changes.recv() => match event {
                Ok(event) => println!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("{} file events skipped", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    service.shutdown();
    Ok(())
}

pub fn show_config(config: &GhostConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
