//! Gateway entry point: CLI, logging, stdio serve.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shellgate::config::{ConfigStore, write_default_config};
use shellgate::server::GatewayServer;

#[derive(Debug, Parser)]
#[command(
    name = "shellgate",
    version,
    about = "Policy-enforcing shell execution gateway (MCP over stdio)"
)]
struct Cli {
    /// Path to the server config document; defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a default config document to the given path and exit
    #[arg(long, value_name = "PATH")]
    init_config: Option<PathBuf>,
}

fn default_config_path() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".win-cli-mcp")
        .join("config.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout carries the JSON-RPC stream; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(path) = cli.init_config {
        write_default_config(&path)
            .with_context(|| format!("cannot write default config to {}", path.display()))?;
        eprintln!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    info!(config = %config_path.display(), "starting shellgate");

    let store = ConfigStore::new(config_path);
    let server = GatewayServer::new(store).context("cannot initialize gateway")?;
    let shutdown_handle = server.clone();

    let service = server
        .serve(stdio())
        .await
        .context("cannot start MCP service on stdio")?;

    tokio::select! {
        quit = service.waiting() => {
            quit.context("MCP service failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    shutdown_handle.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
