//! `s3vol`: Docker volume plugin serving buckets of an object store.

mod cli;
mod config;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libs3vol::{
    CommandHelper, DriverConfig, DryRunHelper, MountHelper, PluginServer, S3Driver,
    VolumeLifecycle, options,
};
use tracing::{info, warn};

use crate::cli::{Cli, Command, GlobalArgs, ServeArgs, VolumeCommand};
use crate::config::{StoreLocation, driver_config, s3_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.global.debug, cli.global.log_json)?;

    match cli.command {
        Command::Serve(args) => serve(&cli.global, args).await,
        Command::Volume(cmd) => volume(&cli.global, cmd).await,
    }
}

async fn driver(
    global: &GlobalArgs,
    config: DriverConfig,
    helper: Arc<dyn MountHelper>,
) -> Result<S3Driver> {
    let location = StoreLocation::parse(&global.store)?;
    match &location {
        StoreLocation::S3 => {
            info!(endpoint = %global.endpoint, region = %global.region, "using S3 store");
        }
        StoreLocation::Memory => warn!("using an in-memory store, volumes are lost on exit"),
        StoreLocation::Dir(root) => info!(root = %root.display(), "using directory store"),
    }
    let store = location.open(&s3_config(global)).await?;
    S3Driver::new(config, store, helper)
        .await
        .context("failed to initialize the volume registry")
}

async fn serve(global: &GlobalArgs, args: ServeArgs) -> Result<()> {
    let config = driver_config(global)?;
    let helper: Arc<dyn MountHelper> = if args.dry_run {
        info!("dry run, mount helper calls are only logged");
        Arc::new(DryRunHelper::new())
    } else {
        Arc::new(CommandHelper::new(config.helper.clone()))
    };
    let driver = Arc::new(driver(global, config, helper).await?);
    let server = PluginServer::bind(&args.socket, driver)?;
    server.serve_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "could not listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = term.recv() => info!("received SIGTERM, shutting down"),
    }
}

async fn volume(global: &GlobalArgs, cmd: VolumeCommand) -> Result<()> {
    // Registry maintenance never mounts anything.
    let config = driver_config(global)?;
    let driver = driver(global, config, Arc::new(DryRunHelper::new())).await?;
    match cmd {
        VolumeCommand::List => print_json(&driver.list().await?),
        VolumeCommand::Get { name } => print_json(&driver.get(&name).await?),
        VolumeCommand::Create { name, options: raw } => {
            let options =
                options::parse(&raw).with_context(|| format!("invalid options {raw:?}"))?;
            driver.create(&name, options).await?;
            print_json(&driver.get(&name).await?)
        }
        VolumeCommand::Remove { name } => {
            driver.remove(&name).await?;
            info!(volume = %name, "removed");
            Ok(())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
