use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns the process lifetime token, cancelled when either signal arrives.
pub fn install_shutdown_handler() -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = trigger.cancelled() => return,
        }
        trigger.cancel();
    });

    Ok(token)
}
