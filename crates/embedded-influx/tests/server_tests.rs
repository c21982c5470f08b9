#![cfg(unix)]

use embedded_influx::{
    ExecutableSource, InfluxError, InfluxServer, ServerConfig, ServerOutput, ServerRegistry,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const READY: &str = r#"echo 'ts=2024-01-01T00:00:00Z lvl=info msg="Listening for signals" log_id=0' >&2"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// Write an executable shell script named `influxd` into `dir`
fn fake_influxd(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("influxd");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A well-behaved influxd: checks its config, reports readiness, idles
fn ready_influxd(dir: &Path) -> PathBuf {
    fake_influxd(
        dir,
        &format!(
            r#"[ "$1" = "-config" ] || exit 2
[ -f "$2" ] || exit 3
echo $$ > "$(dirname "$0")/pid"
echo 'lvl=info msg="InfluxDB starting"' >&2
{READY}
exec sleep 60"#
        ),
    )
}

fn config_for(exe: &Path, timeout: Duration) -> ServerConfig {
    InfluxServer::builder()
        .executable(exe)
        .timeout(timeout)
        .echo_output(false)
        .build()
        .unwrap()
}

fn read_pid(dir: &Path) -> u32 {
    std::fs::read_to_string(dir.join("pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

/// Whether `pid` is alive; zombies awaiting reaping count as gone
fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(target)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// Plain HTTP/1.0 GET of `/`, returning the response body
async fn http_get(url: &str) -> String {
    let addr = url.trim_start_matches("http://");
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

#[derive(Debug)]
struct CountingSource {
    exe: PathBuf,
    calls: AtomicUsize,
}

impl ExecutableSource for CountingSource {
    fn executable(&self) -> Result<PathBuf, InfluxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.exe.clone())
    }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..50 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_start_and_close_lifecycle() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let server = InfluxServer::new(config_for(&ready_influxd(bin.path()), Duration::from_secs(10)));

    server.start().await.unwrap();
    assert!(server.is_running().await);
    assert_ne!(server.port(), 0);
    assert_eq!(server.url(), format!("http://127.0.0.1:{}", server.port()));

    let root = server.scratch_dir().await.unwrap();
    for sub in ["meta", "data", "wal"] {
        assert!(root.join(sub).is_dir(), "{sub} missing");
    }
    let conf = std::fs::read_to_string(root.join("influxd.conf")).unwrap();
    assert!(conf.contains(&format!(":{}", server.port())));

    let pid = server.pid().await.unwrap();
    assert_eq!(read_pid(bin.path()), pid);

    server.close().await.unwrap();
    assert!(!server.is_running().await);
    assert!(server.pid().await.is_none());
    assert!(!root.exists());
    assert!(wait_until_gone(pid).await);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let server = Arc::new(InfluxServer::new(config_for(
        &ready_influxd(bin.path()),
        Duration::from_secs(10),
    )));

    let (a, b) = tokio::join!(server.start(), server.start());
    a.unwrap();
    b.unwrap();
    let pid = server.pid().await.unwrap();
    let root = server.scratch_dir().await.unwrap();

    server.start().await.unwrap();
    assert_eq!(server.pid().await, Some(pid));
    assert_eq!(server.scratch_dir().await, Some(root));

    server.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_reuses_port_with_fresh_scratch_dir() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let server = InfluxServer::new(config_for(&ready_influxd(bin.path()), Duration::from_secs(10)));

    server.start().await.unwrap();
    let port = server.port();
    let first = server.scratch_dir().await.unwrap();
    server.close().await.unwrap();
    assert!(!first.exists());

    server.start().await.unwrap();
    let second = server.scratch_dir().await.unwrap();
    assert_eq!(server.port(), port);
    assert_ne!(first, second);
    assert!(second.join("data").is_dir());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_servers_are_isolated() {
    init_tracing();
    let bin_a = TempDir::new().unwrap();
    let bin_b = TempDir::new().unwrap();
    let a = InfluxServer::new(config_for(&ready_influxd(bin_a.path()), Duration::from_secs(10)));
    let b = InfluxServer::new(config_for(&ready_influxd(bin_b.path()), Duration::from_secs(10)));

    let (ra, rb) = tokio::join!(a.start(), b.start());
    ra.unwrap();
    rb.unwrap();

    assert_ne!(a.port(), b.port());
    assert_ne!(a.scratch_dir().await, b.scratch_dir().await);
    assert_ne!(a.pid().await, b.pid().await);

    let (ca, cb) = tokio::join!(a.close(), b.close());
    ca.unwrap();
    cb.unwrap();
}

#[tokio::test]
async fn test_explicit_port_is_written_to_config() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let port = embedded_influx::ports::find_free_port().unwrap();
    let config = InfluxServer::builder()
        .executable(ready_influxd(bin.path()))
        .port(port)
        .timeout(Duration::from_secs(10))
        .echo_output(false)
        .build()
        .unwrap();
    let server = InfluxServer::new(config);

    server.start().await.unwrap();
    assert_eq!(server.port(), port);
    let conf = std::fs::read_to_string(server.scratch_dir().await.unwrap().join("influxd.conf"))
        .unwrap();
    assert!(conf.contains(&format!("\":{port}\"")));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_startup_timeout_kills_process() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        r#"echo $$ > "$(dirname "$0")/pid"
echo 'lvl=info msg="still booting"' >&2
exec sleep 60"#,
    );
    let server = InfluxServer::new(config_for(&exe, Duration::from_millis(500)));

    let err = server.start().await.unwrap_err();
    assert!(
        matches!(err, InfluxError::StartupTimeout(d) if d == Duration::from_millis(500)),
        "{err:?}"
    );
    assert!(!server.is_running().await);
    assert!(server.pid().await.is_none());
    assert!(server.scratch_dir().await.is_none());
    assert!(wait_until_gone(read_pid(bin.path())).await);

    // Closing a server that never came up is fine
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_exit_before_ready_is_reported() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        r#"echo 'run: open server: listen tcp: address already in use' >&2
exit 1"#,
    );
    let server = InfluxServer::new(config_for(&exe, Duration::from_secs(10)));

    let err = server.start().await.unwrap_err();
    match err {
        InfluxError::ExitedBeforeReady { status } => {
            if let Some(status) = status {
                assert!(!status.success());
            }
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!server.is_running().await);
    assert!(server.scratch_dir().await.is_none());
}

#[tokio::test]
async fn test_term_resistant_process_is_killed_on_close() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        &format!(
            r#"trap '' TERM
{READY}
while true; do sleep 1; done"#
        ),
    );
    let server = InfluxServer::new(config_for(&exe, Duration::from_secs(10)));

    server.start().await.unwrap();
    let pid = server.pid().await.unwrap();

    server.close().await.unwrap();
    assert!(wait_until_gone(pid).await);
}

#[tokio::test]
async fn test_output_is_echoed_and_runs_next_to_binary() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        &format!(
            r#"echo "cwd=$(pwd)" >&2
{READY}
exec sleep 60"#
        ),
    );
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let config = InfluxServer::builder()
        .executable(&exe)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let server = InfluxServer::with_output(config, ServerOutput::new(Box::new(writer)));

    server.start().await.unwrap();
    server.close().await.unwrap();
    drop(server);

    let mut echoed = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_string(&mut echoed))
        .await
        .unwrap()
        .unwrap();

    let cwd = echoed
        .lines()
        .find_map(|l| l.strip_prefix("cwd="))
        .unwrap();
    assert_eq!(
        std::fs::canonicalize(cwd).unwrap(),
        std::fs::canonicalize(bin.path()).unwrap()
    );
    assert!(echoed.contains("Listening for signals"));
}

#[tokio::test]
async fn test_drop_kills_running_process() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let server = InfluxServer::new(config_for(&ready_influxd(bin.path()), Duration::from_secs(10)));

    server.start().await.unwrap();
    let pid = server.pid().await.unwrap();
    drop(server);

    assert!(wait_until_gone(pid).await);
}

#[tokio::test]
async fn test_registry_restarts_scope_on_same_port() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let registry = ServerRegistry::new(config_for(
        &ready_influxd(bin.path()),
        Duration::from_secs(10),
    ));

    let first = registry.before_each("SuiteA").await.unwrap();
    let port = first.port();
    registry.after_each("SuiteA").await.unwrap();
    assert!(!first.is_running().await);

    let second = registry.before_each("SuiteA").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.port(), port);
    assert!(second.is_running().await);

    registry.close_all().await.unwrap();
    assert!(!second.is_running().await);
    assert!(registry.scopes().is_empty());
}

#[tokio::test]
async fn test_non_utf8_output_is_tolerated() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        &format!(
            r#"printf 'caf\351\n' >&2
{READY}
printf 'caf\351\n' >&2
sleep 1
echo 'lvl=info msg="still serving"' >&2
touch "$(dirname "$0")/alive"
exec sleep 60"#
        ),
    );
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let config = InfluxServer::builder()
        .executable(&exe)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let server = InfluxServer::with_output(config, ServerOutput::new(Box::new(writer)));

    server.start().await.unwrap();

    // Writing to stderr after the bad bytes must not kill the child
    let alive = bin.path().join("alive");
    assert!(wait_until(|| alive.exists()).await);
    assert!(server.is_running().await);

    server.close().await.unwrap();
    drop(server);

    let mut echoed = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_string(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert!(echoed.contains("caf\u{FFFD}"));
    assert!(echoed.contains("still serving"));
}

#[tokio::test]
async fn test_is_running_reflects_exit_after_ready() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        &format!(
            r#"{READY}
sleep 0.3
exit 0"#
        ),
    );
    let server = InfluxServer::new(config_for(&exe, Duration::from_secs(10)));

    server.start().await.unwrap();

    let mut stopped = false;
    for _ in 0..50 {
        if !server.is_running().await {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stopped);

    // The exited process is still cleaned up normally
    server.close().await.unwrap();
    assert!(server.scratch_dir().await.is_none());
}

#[tokio::test]
async fn test_shared_executable_source_is_asked_per_start() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let source = Arc::new(CountingSource {
        exe: ready_influxd(bin.path()),
        calls: AtomicUsize::new(0),
    });
    let config = InfluxServer::builder()
        .shared_executable_source(source.clone())
        .timeout(Duration::from_secs(10))
        .echo_output(false)
        .build()
        .unwrap();
    let a = InfluxServer::new(config.clone());
    let b = InfluxServer::new(config);

    a.start().await.unwrap();
    b.start().await.unwrap();
    a.start().await.unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_servers_answer_on_their_own_ports() {
    init_tracing();
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }

    // Serves its own pid on the [http] bind-address from the config
    let body = r#"port=$(sed -n '/^\[http\]/,$ s/^bind-address = ":\([0-9]*\)"$/\1/p' "$2")
exec python3 -c '
import http.server, sys
class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        body = sys.argv[2].encode()
        self.send_response(200)
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)
    def log_message(self, *args):
        pass
server = http.server.HTTPServer(("127.0.0.1", int(sys.argv[1])), Handler)
print("Listening for signals", file=sys.stderr, flush=True)
server.serve_forever()
' "$port" "$$""#;
    let bin_a = TempDir::new().unwrap();
    let bin_b = TempDir::new().unwrap();
    let a = InfluxServer::new(config_for(&fake_influxd(bin_a.path(), body), Duration::from_secs(20)));
    let b = InfluxServer::new(config_for(&fake_influxd(bin_b.path(), body), Duration::from_secs(20)));

    let (ra, rb) = tokio::join!(a.start(), b.start());
    ra.unwrap();
    rb.unwrap();

    let pid_a = a.pid().await.unwrap().to_string();
    let pid_b = b.pid().await.unwrap().to_string();
    assert_ne!(pid_a, pid_b);
    assert_eq!(http_get(&a.url()).await, pid_a);
    assert_eq!(http_get(&b.url()).await, pid_b);

    let (ca, cb) = tokio::join!(a.close(), b.close());
    ca.unwrap();
    cb.unwrap();
}

#[tokio::test]
async fn test_abandoned_start_kills_process_group() {
    init_tracing();
    let bin = TempDir::new().unwrap();
    let exe = fake_influxd(
        bin.path(),
        r#"echo "$2" > "$(dirname "$0")/conf"
sleep 60 &
echo $! > "$(dirname "$0")/child"
echo $$ > "$(dirname "$0")/pid"
exec sleep 60"#,
    );
    let server = InfluxServer::new(config_for(&exe, Duration::from_secs(30)));

    let pid_file = bin.path().join("pid");
    let abandoned = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::select! {
            result = server.start() => Some(result),
            _ = async {
                while !pid_file.exists() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            } => None,
        }
    })
    .await
    .unwrap();
    assert!(abandoned.is_none(), "start() completed unexpectedly");

    let pid = read_pid(bin.path());
    let child: u32 = std::fs::read_to_string(bin.path().join("child"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let conf = PathBuf::from(
        std::fs::read_to_string(bin.path().join("conf"))
            .unwrap()
            .trim(),
    );

    assert!(wait_until_gone(pid).await);
    assert!(wait_until_gone(child).await);
    assert!(!conf.parent().unwrap().exists());
    assert!(!server.is_running().await);
    assert!(server.pid().await.is_none());
}
