use std::io;

/// Create a monitor future for signals
///
/// There are no signals to watch on this platform, it never resolves.
pub async fn create_signal_monitor() -> io::Result<()> {
    futures::future::pending::<()>().await;
    Ok(())
}
