//! lantern - serves "The Lantern Road" to a party of players.
//!
//! Usage: `lantern <address> <port> <countdown-ms> [--checkpoints FILE]`.
//! `RUST_LOG` controls logging. SIGINT, SIGTERM and SIGHUP close the lobby
//! gracefully (exit 0); a lobby failure exits with 2.

mod store;
mod story;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use questline::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::store::JsonStore;
use crate::story::Lantern;

#[derive(Parser)]
#[command(name = "lantern")]
#[command(about = "Serve The Lantern Road to a party of players")]
#[command(version)]
struct Cli {
    /// Address to listen on
    address: String,

    /// TCP port
    port: u16,

    /// Countdown once everyone is ready, in milliseconds
    countdown_ms: u64,

    /// Checkpoint file (created on first save)
    #[arg(long, default_value = "lantern-checkpoints.json")]
    checkpoints: PathBuf,

    /// Runtime worker threads (defaults to one per core)
    #[arg(long)]
    workers: Option<usize>,

    /// Seed for dice rolls and tie-breaks
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn bind_addr(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            // Host names are left to the resolver.
            Err(_) => format!("{}:{}", self.address, self.port),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing("info");

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(workers) = cli.workers {
        runtime.worker_threads(workers.max(1));
    }
    let runtime = match runtime.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start the runtime");
            return ExitStatus::Crashed.into();
        }
    };
    runtime.block_on(serve(cli)).into()
}

async fn serve(cli: Cli) -> ExitStatus {
    let rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let game = Arc::new(Lantern::new(JsonStore::new(&cli.checkpoints, rng)));

    let mut builder = QuestlineServer::builder()
        .bind(&cli.bind_addr())
        .countdown(Duration::from_millis(cli.countdown_ms));
    if let Some(seed) = cli.seed {
        builder = builder.seed(seed);
    }
    let server = match builder.build(game).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start the server");
            return ExitStatus::Crashed;
        }
    };
    tracing::info!(
        addr = %server.local_addr(),
        checkpoints = %cli.checkpoints.display(),
        "lantern ready"
    );
    server.run(shutdown_signal()).await
}

/// Resolves on the first termination signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = hup.recv() => {}
                }
            }
            _ => {
                tracing::warn!("cannot listen for SIGTERM/SIGHUP");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
