mod config;

use anyhow::{Context, Result};
use clap::Parser as _;
use config::{Cli, Command, DriverCommand, ServeArgs};
use granville::driver::DriverRegistry;
use granville::pool::ModelPool;
use granville::{AppState, Server, VERSION};
use std::sync::Arc;
use tracing::{info, instrument};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("granville=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Driver {
            command: DriverCommand::List,
        } => {
            list_drivers(&DriverRegistry::builtin());
            Ok(())
        }
        Command::Version => {
            println!("granville {VERSION}");
            Ok(())
        }
    }
}

#[instrument(skip_all)]
async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.validate()?;
    let driver = DriverRegistry::builtin().get(&args.driver)?;
    info!(driver = driver.name(), models = args.models.len(), "Loading models");

    let paths = args.models;
    let pool = tokio::task::spawn_blocking(move || ModelPool::load(driver.as_ref(), &paths))
        .await
        .context("Model loading task failed")??;

    let state = Arc::new(AppState::new(config, Arc::new(pool)));
    let server = Server::start(state)
        .await
        .context("Failed to start server")?;

    shutdown_signal().await?;
    server.shutdown().await;
    Ok(())
}

fn list_drivers(registry: &DriverRegistry) {
    if registry.is_empty() {
        println!("No drivers available");
        return;
    }
    for driver in registry.iter() {
        println!("{:<12} {}", driver.name(), driver.description());
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    info!("Shutdown signal received");
    Ok(())
}
