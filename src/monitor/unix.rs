use std::io;

use futures::future::{self, Either, FutureExt};
use log::info;
use tokio::signal::unix::{signal, SignalKind};

/// Create a monitor future for signals
///
/// Resolves when `SIGTERM` or `SIGINT` is received, the service should then be stopped.
pub async fn create_signal_monitor() -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let signal_name = match future::select(sigterm.recv().boxed(), sigint.recv().boxed()).await {
        Either::Left(..) => "SIGTERM",
        Either::Right(..) => "SIGINT",
    };

    info!("received {}, stopping service", signal_name);

    Ok(())
}
