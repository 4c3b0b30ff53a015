use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wikimesh_repl::{ReplConfig, ReplicationNode};

#[derive(Parser)]
#[command(name = "wm-repl")]
#[command(about = "WikiMesh replication node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node and serve its HTTP API.
    Serve {
        #[arg(short, long, default_value = "/etc/wikimesh/repl.toml")]
        config: PathBuf,
        /// Override the configured listen address.
        #[arg(short, long, env = "WM_REPL_BIND")]
        bind: Option<SocketAddr>,
    },
    /// Load and validate a configuration file.
    Check {
        #[arg(short, long, default_value = "/etc/wikimesh/repl.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, bind } => serve(config, bind).await,
        Command::Check { config } => {
            let config = ReplConfig::from_file(&config)?;
            println!("{} ({}) ok", config.identity.uri, config.identity.name);
            Ok(())
        }
    }
}

async fn serve(config_path: PathBuf, bind: Option<SocketAddr>) -> Result<()> {
    let mut config = if config_path.exists() {
        ReplConfig::from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        ReplConfig::default()
    };
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    let addr = config.bind_addr;

    let node = ReplicationNode::builder(config).build()?;
    node.start().await;

    let server = tokio::spawn(wikimesh_repl::http::serve(node.clone(), addr));
    tokio::select! {
        result = server => {
            if let Ok(Err(e)) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }
    node.shutdown().await;
    Ok(())
}
