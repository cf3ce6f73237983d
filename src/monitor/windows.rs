use std::io;

use log::info;
use tokio::signal::ctrl_c;

/// Create a monitor future for signals
///
/// Resolves when Ctrl-C is received, the service should then be stopped.
pub async fn create_signal_monitor() -> io::Result<()> {
    ctrl_c().await?;
    info!("received CTRL-C, stopping service");

    Ok(())
}
