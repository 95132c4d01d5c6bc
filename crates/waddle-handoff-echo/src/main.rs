//! Echo server that restarts without dropping its listening sockets.
//!
//! Send `SIGUSR2` to start the next generation with the current listeners;
//! the new process then stops this one with `SIGTERM`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use waddle_handoff::{capture_launch_context, Net, NetBuilder};

mod config;
mod server;
mod telemetry;

use config::{EchoConfig, ListenArg};

#[derive(Parser, Debug)]
#[command(name = "waddle-handoff-echo")]
#[command(author, version, about = "Echo server with graceful restarts", long_about = None)]
struct Cli {
    /// Listener to open, as <network>=<address> (repeatable)
    #[arg(
        short,
        long = "listen",
        value_name = "NETWORK=ADDRESS",
        default_value = "tcp=127.0.0.1:7007"
    )]
    listen: Vec<ListenArg>,

    /// Prefix prepended to argv[0] when locating the next binary
    #[arg(long)]
    path_prefix: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before anything can change the working directory.
    capture_launch_context();

    let cli = Cli::parse();

    telemetry::init().map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    let config = EchoConfig::from_env();
    config.log_config();

    let mut builder = NetBuilder::from_env();
    if let Some(prefix) = &cli.path_prefix {
        builder = builder.path_prefix(prefix);
    }
    let net = Arc::new(builder.build());

    let mut listeners = Vec::with_capacity(cli.listen.len());
    for arg in &cli.listen {
        let listener = net
            .listen(&arg.network, &arg.address)
            .with_context(|| format!("failed to listen on {arg}"))?;
        listeners.push(listener);
    }
    if net.unclaimed_count() > 0 {
        warn!(
            count = net.unclaimed_count(),
            "Inherited listeners not requested by this generation"
        );
    }

    let stop = CancellationToken::new();
    let server = tokio::spawn(server::serve(listeners, stop.clone()));

    if config.should_stop_parent() {
        stop_parent(&net);
    }

    wait_for_signals(net, stop).await?;

    server.await.context("server task failed")??;
    info!("Shutdown complete");
    Ok(())
}

/// Stop the generation that handed us its listeners.
fn stop_parent(net: &Net) {
    let ppid = std::os::unix::process::parent_id();
    if ppid == 1 {
        // Parent already gone; we were reparented to init.
        return;
    }
    match net.kill(ppid as i32, libc::SIGTERM) {
        Ok(()) => info!(pid = ppid, "Asked previous generation to stop"),
        Err(e) => warn!(error = %e, "Failed to stop previous generation"),
    }
}

async fn wait_for_signals(net: Arc<Net>, stop: CancellationToken) -> Result<()> {
    let mut usr2 = signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    loop {
        tokio::select! {
            _ = usr2.recv() => {
                info!("Received SIGUSR2, starting next generation");
                let net = Arc::clone(&net);
                match tokio::task::spawn_blocking(move || net.start_process()).await {
                    Ok(Ok(pid)) => info!(pid, "Next generation started"),
                    Ok(Err(e)) => error!(error = %e, "Failed to start next generation"),
                    Err(e) => error!(error = %e, "Restart task panicked"),
                }
            }
            _ = term.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = int.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    stop.cancel();
    Ok(())
}
