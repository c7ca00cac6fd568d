use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Spawn a task that cancels the returned token on SIGTERM or SIGINT.
///
/// The HTTP server and the reaper both watch this token; cancelling it is
/// the only shutdown path.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down coordinator");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down coordinator");
            }
            _ = trigger.cancelled() => return,
        }
        trigger.cancel();
    });

    Ok(token)
}
