//! Runs one replica: the Raft worker, the apply loop, the expiration
//! scheduler and the v1 HTTP key API.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 --http 127.0.0.1:4001 --campaign \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- \
//!   --id 2 --listen 127.0.0.1:7102 --http 127.0.0.1:4002 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- \
//!   --id 3 --listen 127.0.0.1:7103 --http 127.0.0.1:4003 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! curl -XPUT 127.0.0.1:4001/v1/keys/foo -d value=bar -d ttl=100
//! curl 127.0.0.1:4002/v1/keys/foo
//! ```

use std::future::Future;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use raft_kv_store::cli::Cli;
use raft_kv_store::runtime::spawn_node;
use raft_kv_store::v1;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.node_config()?;
    let node = spawn_node(config).await?;

    let listener = TcpListener::bind(cli.http)
        .await
        .with_context(|| format!("failed to bind {}", cli.http))?;
    info!(node_id = node.id, http = %listener.local_addr()?, raft = %node.raft_addr, "serving v1 key API");

    let app = v1::router(node.gateway.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(node.halted()))
        .await;

    let halted = node.is_halted();
    node.shutdown().await;
    served.context("http server failed")?;
    if halted {
        bail!("node {} halted after a fatal error", cli.id);
    }
    Ok(())
}

/// Ctrl-C, or the replication pipeline stopping underneath the API.
async fn shutdown_signal(halted: impl Future<Output = ()>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("failed to listen for ctrl-c: {err}");
            }
            info!("shutting down");
        }
        () = halted => error!("replication stopped, no longer serving"),
    }
}
