//! Serving node binary

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use stave_core::coordination::ConnectionState;
use stave_core::logging::init_logging;
use stave_core::{Node, NodeConfig};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stave-node", version, about = "Serve versioned datasets")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "stave.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = NodeConfig::from_file(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    init_logging(&config.logging)?;
    info!("Starting Stave node from {}", args.config.display());

    let node = match Node::join(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to join cluster: {}", e);
            return Err(e.into());
        }
    };
    node.start()?;

    let mut hangups = signal(SignalKind::hangup())?;
    let mut terminations = signal(SignalKind::terminate())?;
    let mut coordination = node.coordination_state();
    let mut failed = false;

    loop {
        tokio::select! {
            _ = hangups.recv() => {
                info!("SIGHUP received, reloading");
                node.reload();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = terminations.recv() => {
                info!("SIGTERM received");
                break;
            }
            changed = coordination.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *coordination.borrow_and_update();
                match state {
                    ConnectionState::Failed => {
                        error!("Coordination service unreachable, giving up");
                        failed = true;
                        break;
                    }
                    ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                        warn!("Coordination connection state: {:?}", state);
                    }
                    _ => {}
                }
            }
        }
    }

    node.shutdown().await;
    if failed {
        return Err("coordination retries exhausted".into());
    }
    Ok(())
}
