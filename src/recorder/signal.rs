use log::{error, info};

use super::StopHandle;

/**
 * Turns the first Ctrl-C (or SIGTERM, which is what cron and service
 * managers send) into an interrupt of the session.
 */
pub(crate) async fn forward_interrupts(stop: StopHandle) {
    match wait_for_signal().await {
        Ok(()) => {
            info!("Interrupt received, finishing the recording");
            stop.interrupt();
        }
        Err(e) => error!("Unable to listen for interrupts: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
