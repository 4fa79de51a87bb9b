#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use strata_server::{Args, Hub, MemoryCircuits, MemoryScene, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("strata=info".parse()?))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    if args.check {
        println!("configuration ok");
        return Ok(());
    }
    if config.circuits.is_empty() {
        warn!("no circuits configured; bootstrap handshakes will be refused");
    }

    let scene = Arc::new(MemoryScene::demo(config.region_name.clone()));
    let circuits = Arc::new(MemoryCircuits::from_config(&config.circuits));
    let hub = Hub::new(config, scene, circuits);
    hub.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("received shutdown signal");
    hub.shutdown().await;
    Ok(())
}
