//! Waiting for an operator's request to shut down.
//!
//! On unix, SIGINT, SIGTERM and SIGQUIT all count; elsewhere only Ctrl-C.

/// Resolves once the process receives a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    log::info!("{} received. Shutting down.", name);
    Ok(())
}

/// Resolves once the process receives Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    log::info!("Ctrl+C received. Shutting down.");
    Ok(())
}
