use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancellation token tripped by SIGTERM or SIGINT.
///
/// The coordinator flushes pending build events and minions drain their
/// in-flight work units off this token before exiting.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        let name = wait_for_signal().await;
        tracing::info!(signal = name, "Shutting down");
        trip.cancel();
    });
    token
}

async fn wait_for_signal() -> &'static str {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
