//! Cleanup of helper processes left behind by a previous run

use std::{collections::HashSet, io};

use async_trait::async_trait;

/// Kills running processes by executable name
///
/// Implemented by the platform layer, which knows how processes of this application can be enumerated.
#[async_trait]
pub trait ProcessScanner: Send + Sync {
    /// Kill every process whose executable file name is in `names`, returns how many were signalled
    async fn kill_by_executable_name(&self, names: &HashSet<String>) -> io::Result<usize>;
}

/// Scanner for platforms without stale helpers to clean up
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProcessScanner;

#[async_trait]
impl ProcessScanner for NoopProcessScanner {
    async fn kill_by_executable_name(&self, _names: &HashSet<String>) -> io::Result<usize> {
        Ok(0)
    }
}
