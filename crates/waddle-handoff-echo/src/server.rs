//! Accept loops: every accepted connection gets its bytes echoed back.
//!
//! Accept loops stop when the stop token is cancelled. Connections already
//! accepted are not drained.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waddle_handoff::Listener;

/// Serve every listener until `stop` is cancelled.
pub async fn serve(listeners: Vec<Listener>, stop: CancellationToken) -> Result<()> {
    let mut tasks = JoinSet::new();

    for listener in listeners {
        match listener {
            Listener::Tcp(listener) => {
                listener
                    .set_nonblocking(true)
                    .context("failed to set TCP listener non-blocking")?;
                let listener = tokio::net::TcpListener::from_std(listener)
                    .context("failed to register TCP listener")?;
                tasks.spawn(accept_tcp(listener, stop.clone()));
            }
            Listener::Unix(listener) => match listener.into_std() {
                Ok(listener) => {
                    listener
                        .set_nonblocking(true)
                        .context("failed to set Unix listener non-blocking")?;
                    let listener = tokio::net::UnixListener::from_std(listener)
                        .context("failed to register Unix listener")?;
                    tasks.spawn(accept_unix(listener, stop.clone()));
                }
                Err(listener) => {
                    warn!(
                        addr = %listener.local_addr(),
                        "Seqpacket listener is passed on at restart but not served"
                    );
                }
            },
        }
    }

    while let Some(joined) = tasks.join_next().await {
        joined.context("accept loop panicked")?;
    }
    Ok(())
}

async fn accept_tcp(listener: tokio::net::TcpListener, stop: CancellationToken) {
    let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(addr = %addr, "Serving TCP");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(echo(stream, peer.to_string()));
                }
                Err(e) => warn!(addr = %addr, error = %e, "Accept failed"),
            },
        }
    }

    info!(addr = %addr, "Stopped accepting");
}

async fn accept_unix(listener: tokio::net::UnixListener, stop: CancellationToken) {
    let addr = listener
        .local_addr()
        .ok()
        .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
        .unwrap_or_default();
    info!(addr = %addr, "Serving Unix");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(echo(stream, addr.clone()));
                }
                Err(e) => warn!(addr = %addr, error = %e, "Accept failed"),
            },
        }
    }

    info!(addr = %addr, "Stopped accepting");
}

async fn echo<S>(stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(peer = %peer, bytes, "Connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection failed"),
    }
}
