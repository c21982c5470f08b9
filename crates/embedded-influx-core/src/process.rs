use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::ChildStderr;

/// Unique identifier for a process
pub type ProcessId = u32;

/// How long a gracefully terminated process gets before it is killed
pub const GRACEFUL_SHUTDOWN_PERIOD: Duration = Duration::from_secs(5);

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Termination was requested successfully
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the process is gone or on its way out
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Trait representing a handle to a spawned process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Take ownership of the piped diagnostic stream, once
    fn take_stderr(&mut self) -> Option<ChildStderr>;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ExitStatus>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Kill the process and wait for it
    async fn kill(&mut self) -> Result<()>;

    /// Send a kill without waiting; safe to call from `Drop`
    fn start_kill(&mut self) -> Result<()>;
}

/// Core trait for spawning processes
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle;

    /// Spawn `command` with stderr piped and stdin/stdout detached.
    async fn spawn_process(
        &self,
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle>;

    /// Wait for a process to exit with optional timeout
    async fn wait_for_exit(
        &self,
        handle: &mut Self::Handle,
        timeout: Option<Duration>,
    ) -> Result<ExitStatus> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, handle.wait())
                .await
                .map_err(|_| anyhow::anyhow!("Timeout waiting for process exit"))?,
            None => handle.wait().await,
        }
    }
}

/// Trait for terminating spawned processes
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process to shut down (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill the process and anything in its group (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Synchronous best-effort kill by PID, for use from `Drop`
    fn kill_now(&self, pid: ProcessId) -> TerminationResult;
}

/// High-level process manager trait that combines lifecycle and termination
#[async_trait]
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;

    /// Graceful termination, escalating to a forced kill after `grace`.
    ///
    /// Returns the exit status once the process has been reaped.
    async fn terminate_and_wait(
        &self,
        handle: &mut Self::Handle,
        grace: Duration,
    ) -> Result<ExitStatus> {
        let pid = handle.get_pid();
        let requested = self.terminate_gracefully(&mut *handle).await;
        if requested.is_ok() {
            match self.wait_for_exit(&mut *handle, Some(grace)).await {
                Ok(status) => return Ok(status),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Process ignored termination request");
                }
            }
        }

        let killed = self.force_kill(&mut *handle).await;
        if !killed.is_ok() {
            tracing::warn!(pid = ?pid, result = ?killed, "Force kill failed");
        }
        handle.wait().await
    }
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
