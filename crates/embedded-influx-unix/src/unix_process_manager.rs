use anyhow::Result;
use async_trait::async_trait;
use embedded_influx_core::{
    ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessTermination,
    TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitStatus;
use tokio::process::ChildStderr;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::Stdio;
    use tokio::process::{Child, Command};
    use tracing::{info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child) -> Self {
            Self { child }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id()
        }

        fn take_stderr(&mut self) -> Option<ChildStderr> {
            self.child.stderr.take()
        }

        async fn is_running(&self) -> bool {
            match self.get_pid() {
                // Signal 0 only checks that the process exists
                Some(pid) => signal::kill(NixPid::from_raw(pid as i32), None).is_ok(),
                None => false,
            }
        }

        async fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
            Ok(self.child.try_wait()?)
        }

        async fn wait(&mut self) -> Result<ExitStatus> {
            Ok(self.child.wait().await?)
        }

        async fn kill(&mut self) -> Result<()> {
            self.child
                .kill()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
        }

        fn start_kill(&mut self) -> Result<()> {
            Ok(self.child.start_kill()?)
        }
    }

    /// Unix process manager; every child leads its own process group
    #[derive(Debug)]
    pub struct UnixProcessManager;

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        async fn spawn_process(
            &self,
            command: &Path,
            args: &[String],
            working_dir: Option<&Path>,
            env: &HashMap<String, String>,
        ) -> Result<Self::Handle> {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            // New process group so the whole tree can be signalled at once
            cmd.process_group(0);

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!(
                    pid = pid,
                    command = %command.display(),
                    args = ?args,
                    "Spawned Unix process"
                );
            }

            Ok(UnixProcessHandle::new(child))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            match handle.get_pid() {
                Some(pid) => signal_group(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            let result = signal_group(pid, Signal::SIGKILL);
            // Also call handle's kill method so the child is reaped
            if let Err(e) = handle.kill().await {
                warn!(pid = pid, error = %e, "Handle kill cleanup failed");
            }
            result
        }

        fn kill_now(&self, pid: ProcessId) -> TerminationResult {
            signal_group(pid, Signal::SIGKILL)
        }
    }

    /// Signal the process group led by `pid`, falling back to the process itself.
    fn signal_group(pid: ProcessId, sig: Signal) -> TerminationResult {
        let nix_pid = NixPid::from_raw(pid as i32);

        let result = match signal::killpg(nix_pid, sig) {
            Err(nix::errno::Errno::ESRCH) => signal::kill(nix_pid, sig),
            other => other,
        };

        match result {
            Ok(()) => {
                info!(pid = pid, signal = ?sig, "Signalled process group");
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                info!(pid = pid, "Process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!(pid = pid, "Permission denied to signal process");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!(pid = pid, signal = ?sig, error = %e, "Failed to signal process");
                TerminationResult::Failed(format!("{sig:?} failed: {e}"))
            }
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            Self
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
