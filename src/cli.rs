//! Command-line interface.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "pendant-bridge", version, about = "Voice assistant bridge server")]
struct Cli {
    /// Bind host (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Store path (overrides DB_PATH); use :memory: for an in-memory store
    #[arg(long)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server (default)
    Serve,
    /// Populate the store with demo health and expense data
    Seed,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.server.db_path = db_path;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => crate::server::start(config).await,
        Command::Seed => crate::seed::run(&config),
    }
}
