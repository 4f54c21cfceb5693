use crate::error::AppError;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use sysinfo::{ProcessExt, System, SystemExt};
use tracing::{debug, instrument};

#[derive(Debug, Serialize)]
pub struct ProcessInfo {
    pub pid: String,
    pub name: String,
    pub cpu_usage: f32,
    pub memory_mb: u64,
    pub command: String,
    pub status: String,
    pub user: Option<String>,
    pub start_time_epoch_secs: u64,
}

/// Process-table operations: pattern-matched kill for a tenant's lingering
/// processes, plus a host process listing.
#[derive(Debug)]
pub struct ProcessManager {
    system: Arc<StdMutex<System>>, // sysinfo is sync
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            system: Arc::new(StdMutex::new(sys)),
        }
    }

    /// Signal all of the tenant's processes whose command line matches
    /// `pattern` (e.g. a lingering local daemon started by an earlier
    /// command). Resolves true once the signalling sweep completes, whether or
    /// not anything matched; errors only for an invalid pattern or if the
    /// signalling tool itself fails to spawn.
    #[instrument(skip(self), fields(tenant = %tenant, pattern = %pattern))]
    pub async fn kill_matching(&self, tenant: &str, pattern: &str) -> Result<bool, AppError> {
        Regex::new(pattern).map_err(|e| {
            AppError::InvalidInputArgument(format!("Invalid process pattern '{}': {}", pattern, e))
        })?;

        self.sweep(tenant, pattern).await
    }

    #[cfg(unix)]
    async fn sweep(&self, tenant: &str, pattern: &str) -> Result<bool, AppError> {
        let status = tokio::process::Command::new("pkill")
            .args(["-TERM", "-u", tenant, "-f", pattern])
            .status()
            .await
            .map_err(|e| AppError::SpawnFailure(format!("failed to spawn pkill: {}", e)))?;

        // pkill exits nonzero when nothing matched; the sweep still completed.
        debug!(tenant = %tenant, pattern = %pattern, exit = ?status.code(), "Process sweep finished");
        Ok(true)
    }

    #[cfg(not(unix))]
    async fn sweep(&self, tenant: &str, pattern: &str) -> Result<bool, AppError> {
        tracing::warn!(tenant = %tenant, pattern = %pattern, "Pattern-matched kill is not supported on this platform");
        Ok(false)
    }

    /// Snapshot of the host's process table.
    #[instrument(skip(self))]
    pub fn list_processes(&self) -> Result<Vec<ProcessInfo>, AppError> {
        let mut sys_guard = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sys_guard.refresh_processes();
        debug!("Listing system processes. Found {} processes.", sys_guard.processes().len());

        let mut processes_info = Vec::new();
        for (pid_obj, process) in sys_guard.processes() {
            processes_info.push(ProcessInfo {
                pid: pid_obj.to_string(),
                name: process.name().to_string(),
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
                command: process.cmd().join(" "),
                status: process.status().to_string(),
                user: process.user_id().map(|uid| format!("{:?}", uid)),
                start_time_epoch_secs: process.start_time(),
            });
        }
        Ok(processes_info)
    }
}
