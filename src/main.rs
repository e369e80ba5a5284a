// src/main.rs

//! The main entry point for the Piccolo Kernel.
//!
//! This binary has no HTTP API, web UI, or CLI command surface of its own —
//! those are out of scope for the kernel (see the App Lifecycle Manager and
//! Command Dispatcher modules for what drives it at runtime). It loads
//! configuration, brings up the persistence and app-lifecycle components, and
//! idles until it receives a shutdown signal.

use std::env;

use anyhow::Result;
use piccolo_kernel::Kernel;
use piccolo_kernel::config::Config;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("piccolo-kernel version {VERSION}");
        return Ok(());
    }

    let config = match args.get(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .compact()
        .init();

    info!(version = VERSION, state_dir = %config.state_dir.display(), "starting piccolo kernel");

    // Unlocking the keyset and attaching volumes is driven by an external
    // trust agent (out of scope here, see SPEC_FULL.md Non-goals); the kernel
    // itself only brings up its background tasks and waits.
    let init = Kernel::initialize(config).await?;
    let kernel = init.kernel;
    kernel.spawn_background_tasks(&init.shutdown_tx).await;

    info!("piccolo kernel running; awaiting shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    let shutdown_tx = init.shutdown_tx;
    kernel.shutdown(shutdown_tx).await;
    Ok(())
}
