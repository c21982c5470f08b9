use crate::factory::{PlatformProcessHandle, PlatformProcessManager, PlatformProcessManagerFactory};
use embedded_influx_core::{
    GRACEFUL_SHUTDOWN_PERIOD, InfluxError, ProcessHandle, ProcessLifecycle, ProcessManager,
    ProcessManagerFactory, ProcessTermination, ScratchDir, ServerConfig, ServerConfigBuilder,
    ServerOptions, ServerOutput, SystemEnvironment, ports,
};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Runtime state of the supervised influxd, guarded by one lock
#[derive(Default)]
struct SupervisedProcess {
    process: Option<PlatformProcessHandle>,
    ready: bool,
    http_port: u16,
    internal_port: u16,
    scratch: Option<ScratchDir>,
    drain: Option<CancellationToken>,
}

/// Hosts one disposable InfluxDB instance.
///
/// Without any custom configuration the server listens on an HTTP port
/// picked by the OS on first start, and keeps that port across restarts.
///
/// ```rust,no_run
/// use embedded_influx::InfluxServer;
///
/// # async fn example() -> Result<(), embedded_influx::InfluxError> {
/// let server = InfluxServer::default();
/// server.start().await?;
/// println!("InfluxDB is up at {}", server.url());
/// server.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct InfluxServer {
    config: ServerConfig,
    manager: PlatformProcessManager,
    state: Mutex<SupervisedProcess>,
    http_port: AtomicU16,
    output: ServerOutput,
}

impl fmt::Debug for InfluxServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxServer")
            .field("config", &self.config)
            .field("port", &self.port())
            .finish()
    }
}

impl Default for InfluxServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl InfluxServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_output(config, ServerOutput::stderr())
    }

    /// Echo the server's diagnostic output to `output` instead of stderr
    pub fn with_output(config: ServerConfig, output: ServerOutput) -> Self {
        info!(
            platform = PlatformProcessManagerFactory::platform_name(),
            port = config.port,
            "Creating InfluxServer"
        );
        Self {
            http_port: AtomicU16::new(config.port),
            manager: PlatformProcessManagerFactory::create_process_manager(),
            state: Mutex::new(SupervisedProcess::default()),
            output,
            config,
        }
    }

    pub fn with_port(port: u16) -> Self {
        Self::new(ServerConfig {
            port,
            ..ServerConfig::default()
        })
    }

    pub fn builder() -> ServerConfigBuilder {
        ServerConfig::builder()
    }

    /// Configure from `EMBEDDED_INFLUX_*` environment variables
    pub fn from_env() -> Result<Self, InfluxError> {
        let config = ServerOptions::from_env(&SystemEnvironment)?.into_config()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// HTTP port; 0 until an auto-allocated port has been picked by `start()`
    pub fn port(&self) -> u16 {
        self.http_port.load(Ordering::Acquire)
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    /// Whether influxd came up and has not exited since
    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.ready {
            return false;
        }
        match state.process.as_mut() {
            Some(process) => matches!(process.try_wait().await, Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let state = self.state.lock().await;
        state.process.as_ref().and_then(|p| p.get_pid())
    }

    /// Scratch root of the running instance
    pub async fn scratch_dir(&self) -> Option<PathBuf> {
        let state = self.state.lock().await;
        state.scratch.as_ref().map(|s| s.root().to_path_buf())
    }

    /// Start influxd and wait until it reports readiness.
    ///
    /// Returns immediately if the server is already running. Concurrent
    /// callers are serialized; only the first one spawns a process.
    pub async fn start(&self) -> Result<(), InfluxError> {
        let mut state = self.state.lock().await;
        if state.process.is_some() {
            return Ok(());
        }

        let exe = self.config.executable_source.executable()?;

        if state.internal_port == 0 {
            state.internal_port = ports::find_free_port()?;
        }
        if state.http_port == 0 {
            state.http_port = ports::resolve_port(self.config.port)?;
            self.http_port.store(state.http_port, Ordering::Release);
        }

        // Registered with the reaper before anything is spawned
        let scratch = ScratchDir::create(state.internal_port, state.http_port)?;
        let args = vec![
            "-config".to_string(),
            scratch.config_file().display().to_string(),
        ];
        let mut pending = PendingStart {
            manager: &self.manager,
            process: None,
            scratch: Some(scratch),
            drain: None,
        };

        let mut process = self
            .manager
            .spawn_process(&exe, &args, exe.parent(), &HashMap::new())
            .await
            .map_err(|e| {
                InfluxError::process_error(format!("Failed to start {}: {e:#}", exe.display()))
            })?;
        let pid = process.get_pid();

        let (ready_tx, ready_rx) = oneshot::channel();
        let drain = CancellationToken::new();
        if let Some(stderr) = process.take_stderr() {
            let echo = self.config.echo_output.then(|| self.output.clone());
            tokio::spawn(drain_output(
                stderr,
                self.config.readiness_marker.clone(),
                echo,
                ready_tx,
                drain.clone(),
            ));
        }
        pending.process = Some(process);
        pending.drain = Some(drain);

        let deadline = Instant::now() + self.config.timeout;
        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(())) => {
                info!(pid = ?pid, url = %self.url(), "InfluxDB started");
                pending.commit(&mut state);
                Ok(())
            }
            Ok(Err(_)) => {
                let status = pending.abort().await;
                warn!(pid = ?pid, status = ?status, "InfluxDB exited before becoming ready");
                Err(InfluxError::ExitedBeforeReady { status })
            }
            Err(_) => {
                pending.abort().await;
                warn!(pid = ?pid, timeout = ?self.config.timeout, "InfluxDB did not become ready");
                Err(InfluxError::StartupTimeout(self.config.timeout))
            }
        }
    }

    /// Stop influxd and wait for it to exit. Does nothing if not running.
    ///
    /// The server is considered stopped afterwards even if this returns an
    /// error, and may be started again.
    pub async fn close(&self) -> Result<(), InfluxError> {
        let (process, scratch, drain) = {
            let mut state = self.state.lock().await;
            state.ready = false;
            (state.process.take(), state.scratch.take(), state.drain.take())
        };

        let Some(mut process) = process else {
            return Ok(());
        };
        let pid = process.get_pid();

        let result = self
            .manager
            .terminate_and_wait(&mut process, GRACEFUL_SHUTDOWN_PERIOD)
            .await;

        if let Some(drain) = drain {
            drain.cancel();
        }
        if let Some(scratch) = scratch {
            scratch.reclaim();
        }

        match result {
            Ok(status) => {
                info!(pid = ?pid, status = %status, "InfluxDB stopped");
                Ok(())
            }
            Err(e) => Err(InfluxError::stop_failed(format!("{e:#}"))),
        }
    }
}

impl Drop for InfluxServer {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(drain) = state.drain.take() {
            drain.cancel();
        }

        // Backstop for callers that never reached close()
        if let Some(mut process) = state.process.take() {
            warn!(pid = ?process.get_pid(), "InfluxServer dropped while running, killing process");
            kill_immediately(&self.manager, &mut process);
        }
    }
}

/// A spawned but not yet ready influxd, torn down unless committed.
///
/// Dropping it (including when the `start()` future is dropped mid-wait)
/// kills the process group and reclaims the scratch root.
struct PendingStart<'a> {
    manager: &'a PlatformProcessManager,
    process: Option<PlatformProcessHandle>,
    scratch: Option<ScratchDir>,
    drain: Option<CancellationToken>,
}

impl PendingStart<'_> {
    fn commit(mut self, state: &mut SupervisedProcess) {
        state.ready = true;
        state.process = self.process.take();
        state.scratch = self.scratch.take();
        state.drain = self.drain.take();
    }

    /// Kill and reap the process; the scratch root goes when `self` drops
    async fn abort(mut self) -> Option<ExitStatus> {
        if let Some(drain) = self.drain.take() {
            drain.cancel();
        }
        let manager = self.manager;
        let process = self.process.as_mut()?;
        let killed = manager.force_kill(&mut *process).await;
        if !killed.is_ok() {
            debug!(result = ?killed, "Force kill of half-started process failed");
        }
        let status = process.wait().await.ok();
        self.process = None;
        status
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.cancel();
        }
        if let Some(mut process) = self.process.take() {
            warn!(pid = ?process.get_pid(), "Startup abandoned, killing process");
            kill_immediately(self.manager, &mut process);
        }
        if let Some(scratch) = self.scratch.take() {
            scratch.reclaim();
        }
    }
}

/// Synchronous kill of the whole process group, usable from `Drop`
fn kill_immediately(manager: &PlatformProcessManager, process: &mut PlatformProcessHandle) {
    if let Some(pid) = process.get_pid() {
        let result = manager.kill_now(pid);
        if !result.is_ok() {
            debug!(pid = pid, result = ?result, "kill_now during drop failed");
        }
    }
    if let Err(e) = process.start_kill() {
        debug!(error = %e, "start_kill during drop failed");
    }
}

/// Read influxd's stderr line by line until EOF or cancellation, signalling
/// `ready` on the first line containing `marker`.
///
/// Lines are decoded lossily. Draining continues after readiness, and after
/// a read error the pipe is held open until cancellation, so the child never
/// blocks on a full pipe or dies writing to a closed one.
async fn drain_output(
    stderr: ChildStderr,
    marker: String,
    echo: Option<ServerOutput>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut ready = Some(ready);

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(['\n', '\r']);
                trace!(line = %line, "influxd");
                if let Some(echo) = &echo {
                    echo.println(line).await;
                }
                if line.contains(marker.as_str()) {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Failed to read influxd output");
                cancel.cancelled().await;
                break;
            }
        }
    }
}
