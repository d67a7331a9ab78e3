#![warn(missing_docs)]

//! DirMesh replication node daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dirmesh_node::{maintenance, Node, NodeConfig};
use dirmesh_session::Mesh;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("DirMesh node starting...");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) if path.exists() => NodeConfig::from_file(&path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            NodeConfig::default()
        }
        None => {
            tracing::warn!("No config path given, using defaults");
            NodeConfig::default()
        }
    };

    let mesh = Arc::new(Mesh::new());
    let node = Node::build(&config, mesh)?;
    node.start().await;

    let trim_interval = Duration::from_secs(config.changelog.trim_interval_secs.max(1));
    let trim_handle = tokio::spawn(maintenance::run_trim_loop(node.clone(), trim_interval));

    let replicate_handle = if config.replicate_interval_secs > 0 {
        let interval = Duration::from_secs(config.replicate_interval_secs);
        Some(tokio::spawn(maintenance::run_replication_loop(
            node.clone(),
            interval,
        )))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    node.begin_shutdown();

    trim_handle.await?;
    if let Some(handle) = replicate_handle {
        handle.await?;
    }
    tracing::info!("DirMesh node stopped");
    Ok(())
}
