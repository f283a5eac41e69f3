use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels `token` on the first SIGTERM or SIGINT.
///
/// A token that is already cancelled (the work finished on its own) ends the
/// listener without waiting for a signal.
pub async fn listen_shutdown(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        signal = wait_for_signal() => {
            warn!("shutdown signal received: signal={signal}");
            token.cancel();
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(err), _) | (_, Err(err)) => {
            warn!("failed to install signal handlers: error={err}");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(err) => {
            warn!("ctrl-c handler unavailable: error={err}");
            std::future::pending().await
        }
    }
}
