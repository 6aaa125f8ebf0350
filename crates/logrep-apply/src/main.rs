#![warn(missing_docs)]

//! Logical replication apply daemon.
//!
//! Runs the launcher against the in-memory catalog and storage backends,
//! seeded from a JSON file, with an in-process publisher.

use anyhow::{Context, Result};
use clap::Parser;
use logrep_apply::{
    ApplyConfig, ApplyEnv, CatalogSnapshot, ChannelPublisher, Launcher, MemoryCatalog, MemoryStorage,
    StorageSnapshot,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "logrep-apply", about = "Logical replication apply daemon")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "LOGREP_CONFIG")]
    config: Option<PathBuf>,

    /// JSON seed with subscriptions, relation states and local tables.
    #[arg(long, env = "LOGREP_CATALOG")]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Seed {
    catalog: CatalogSnapshot,
    storage: StorageSnapshot,
}

fn load_config(path: Option<&Path>) -> Result<ApplyConfig> {
    match path {
        Some(path) => ApplyConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(ApplyConfig::default()),
    }
}

fn load_seed(path: Option<&Path>) -> Result<Seed> {
    let Some(path) = path else {
        return Ok(Seed::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog seed {}", path.display()))?;
    Ok(serde_json::from_str(&contents)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let seed = load_seed(cli.catalog.as_deref())?;
    tracing::info!(
        subscriptions = seed.catalog.subscriptions.len(),
        tables = seed.storage.tables.len(),
        "logical replication apply daemon starting"
    );

    let system_identifier = seed.catalog.system_identifier;
    let catalog = Arc::new(MemoryCatalog::from_snapshot(seed.catalog));
    let storage = Arc::new(MemoryStorage::from_snapshot(seed.storage)?);
    let publisher = Arc::new(ChannelPublisher::new(system_identifier));
    let env = ApplyEnv::new(config.clone(), catalog, storage, publisher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = watch::channel(config);
    let launcher = tokio::spawn(Launcher::new(env.clone(), shutdown_rx).with_reload(reload_rx).run());

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
            _ = hup.recv() => match load_config(cli.config.as_deref()) {
                Ok(config) => {
                    reload_tx.send_replace(config);
                    env.wake_launcher();
                }
                Err(e) => tracing::warn!("configuration reload failed: {e:#}"),
            },
            _ = usr1.recv() => env.wake_launcher(),
        }
    }

    tracing::info!("shutting down");
    shutdown_tx.send_replace(true);
    launcher.await?;
    Ok(())
}
