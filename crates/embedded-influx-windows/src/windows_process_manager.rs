use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{info, warn};

use embedded_influx_core::*;

/// CREATE_NO_WINDOW: run without popping up a console
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
}

impl WindowsProcessHandle {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

fn pid_exists(pid: ProcessId) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(target).is_some()
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id()
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    async fn is_running(&self) -> bool {
        match self.get_pid() {
            Some(pid) => pid_exists(pid),
            None => {
                warn!("Windows process handle has no PID - process may have exited");
                false
            }
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

/// Windows-specific process manager built on taskkill
#[derive(Debug)]
pub struct WindowsProcessManager;

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    type Handle = WindowsProcessHandle;

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

        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn()?;

        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %command.display(),
                args = ?args,
                "Spawned Windows process"
            );
        }

        Ok(WindowsProcessHandle::new(child))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        match self.taskkill(pid, false).await {
            Ok(true) => {
                info!(pid = %pid, "Sent graceful termination to process tree");
                TerminationResult::Success
            }
            Ok(false) => {
                warn!(pid = %pid, "Graceful termination was refused");
                TerminationResult::Failed("taskkill refused graceful termination".to_string())
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to gracefully terminate process");
                TerminationResult::Failed(format!("Graceful termination failed: {e}"))
            }
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        let result = match self.taskkill(pid, true).await {
            Ok(true) => {
                info!(pid = %pid, "Force killed process tree");
                TerminationResult::Success
            }
            Ok(false) => TerminationResult::ProcessNotFound,
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to force kill process tree");
                TerminationResult::Failed(format!("Force kill failed: {e}"))
            }
        };

        // Also call handle's kill method for cleanup
        if let Err(e) = handle.kill().await {
            warn!(error = %e, "Handle kill cleanup failed");
        }
        result
    }

    fn kill_now(&self, pid: ProcessId) -> TerminationResult {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => TerminationResult::Success,
            Ok(_) => TerminationResult::ProcessNotFound,
            Err(e) => TerminationResult::Failed(format!("taskkill failed: {e}")),
        }
    }
}

impl WindowsProcessManager {
    /// Run `taskkill /T` against `pid`; `/F` when forcing
    async fn taskkill(&self, pid: u32, force: bool) -> Result<bool> {
        let pid_string = pid.to_string();
        let mut args = vec!["/T", "/PID", &pid_string];
        if force {
            args.push("/F");
        }

        let output = Command::new("taskkill").args(&args).output().await?;

        Ok(output.status.success())
    }
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager");
        Self
    }
}
