//! Daemon runtime: socket server plus deadline sweeper.
//!
//! [`Testd::spawn`] runs a Tokio runtime on a background thread with two
//! tasks — the accept loop and the deadline ticker — until the handle stops
//! them (explicitly or on drop). The registration table is memory-only, so
//! stopping one instance and spawning another on the same socket path behaves
//! exactly like a daemon restart: every registration is forgotten.

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use wdog_proto::wire::{decode_line, encode_line};
use wdog_proto::{paths, ErrorCode, Payload, Request, Response};

use crate::error::{io_err, TestdError};
use crate::registry::Registry;
use crate::reset;

/// Tunables for one daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Socket to serve on.
    pub socket: PathBuf,
    /// Smallest timeout accepted at subscribe/extend.
    pub min_timeout: Duration,
    /// How often expired deadlines are swept.
    pub poll_interval: Duration,
    /// Reset-reason record, written on every missed deadline.
    pub reset_reason_file: Option<PathBuf>,
    /// Script spawned on every missed deadline.
    pub supervisor: Option<PathBuf>,
}

impl DaemonOptions {
    /// Defaults: 1 second floor, 50 ms sweep, no side channel.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            min_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            reset_reason_file: None,
            supervisor: None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    registry: Mutex<Registry>,
    options: DaemonOptions,
}

/// Handle on a running test daemon.
#[derive(Debug)]
pub struct Testd {
    shutdown: broadcast::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
    socket: PathBuf,
}

impl Testd {
    /// Binds the socket and starts serving. Returns once the daemon is
    /// accepting connections, or with the bind error if it never got there.
    pub fn spawn(options: DaemonOptions) -> Result<Self, TestdError> {
        init_tracing();

        let socket = options.socket.clone();
        if let Some(dir) = socket.parent() {
            paths::ensure_runtime_dir(dir).map_err(|e| io_err(dir, e))?;
        }

        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::new(options.min_timeout)),
            options,
        });
        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), TestdError>>();

        let thread = {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown_tx.clone();
            thread::Builder::new()
                .name("wdog-testd".to_owned())
                .spawn(move || run_daemon(shared, shutdown, ready_tx))
                .map_err(|e| TestdError::Runtime(format!("failed to spawn daemon thread: {e}")))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shutdown: shutdown_tx,
                thread: Some(thread),
                socket,
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(TestdError::Runtime(
                    "daemon thread exited before reporting readiness".to_owned(),
                ))
            }
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Stops the daemon and removes its socket file.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.socket);
    }
}

impl Drop for Testd {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

// ---------------------------------------------------------------------------
// Runtime body
// ---------------------------------------------------------------------------

fn run_daemon(
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    ready_tx: std_mpsc::Sender<Result<(), TestdError>>,
) {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready_tx.send(Err(TestdError::Runtime(format!(
                "failed to build tokio runtime: {err}"
            ))));
            return;
        }
    };
    runtime.block_on(run(shared, shutdown_tx, ready_tx));
}

async fn run(
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    ready_tx: std_mpsc::Sender<Result<(), TestdError>>,
) {
    let socket = shared.options.socket.clone();
    let listener = match bind_socket(&socket) {
        Ok(listener) => listener,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    // Subscribe before reporting ready, so a stop() issued the moment spawn()
    // returns cannot slip past a not-yet-listening task.
    let server_shutdown_rx = shutdown_tx.subscribe();
    let sweeper_shutdown_rx = shutdown_tx.subscribe();
    let _ = ready_tx.send(Ok(()));
    info!(socket = %socket.display(), "wdog test daemon listening");

    let server_handle = {
        let shared = Arc::clone(&shared);
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(listener, shared, server_shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let sweeper_handle = {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            deadline_sweep_task(shared, sweeper_shutdown_rx).await;
        })
    };

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "socket server task failed"),
        Err(err) => warn!(error = %err, "socket server task panicked"),
    }
    let _ = sweeper_handle.await;

    let _ = std::fs::remove_file(&socket);
    info!("wdog test daemon stopped");
}

fn bind_socket(socket: &Path) -> Result<UnixListener, TestdError> {
    prepare_socket_for_bind(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket)?;
    Ok(listener)
}

/// Refuses to clobber a live daemon's socket; removes a leftover file.
fn prepare_socket_for_bind(socket: &Path) -> Result<(), TestdError> {
    if !socket.exists() {
        return Ok(());
    }

    match std::os::unix::net::UnixStream::connect(socket) {
        Ok(_) => {
            return Err(TestdError::SocketBusy {
                socket: socket.to_path_buf(),
            });
        }
        Err(err) => {
            warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn socket_server_task(
    listener: UnixListener,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TestdError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&shared.options.socket, e))?;
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared).await {
                        debug!(error = %err, "client connection ended with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, shared: Arc<Shared>) -> Result<(), TestdError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let response = match decode_line::<Request>(&line) {
            Ok(request) => handle_request(&shared, request),
            Err(err) => Response::err(ErrorCode::BadRequest, format!("invalid request JSON: {err}")),
        };
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), TestdError> {
    let line = encode_line(response)?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

/// One request against the registration table.
fn handle_request(shared: &Shared, request: Request) -> Response {
    let now = Instant::now();
    let mut registry = lock_registry(shared);
    match request {
        Request::Ping => Response::ok(Payload::Pong),
        Request::Subscribe {
            pid,
            label,
            timeout_ms,
        } => match registry.subscribe(pid, label, timeout_ms, now) {
            Ok((id, ack)) => {
                info!(%id, pid, timeout_ms, "subscribed");
                Response::ok(Payload::Subscribed { id, ack })
            }
            Err(err) => err.into(),
        },
        Request::Unsubscribe { id, ack } => match registry.unsubscribe(id, ack) {
            Ok(()) => {
                info!(%id, "unsubscribed");
                Response::ok(Payload::Unsubscribed)
            }
            Err(err) => err.into(),
        },
        Request::Kick { id, ack } => match registry.kick(id, ack, now) {
            Ok(ack) => {
                debug!(%id, "kicked");
                Response::ok(Payload::Kicked { ack })
            }
            Err(err) => err.into(),
        },
        Request::Extend { id, timeout_ms, ack } => match registry.extend(id, timeout_ms, ack, now) {
            Ok(ack) => {
                debug!(%id, timeout_ms, "extended");
                Response::ok(Payload::Extended { ack })
            }
            Err(err) => err.into(),
        },
        Request::Enable { enable } => {
            let enabled = registry.set_enabled(enable, now);
            info!(enabled, "deadline enforcement switched");
            Response::ok(Payload::Enabled { enabled })
        }
        Request::Status => Response::ok(Payload::Status(registry.status())),
    }
}

async fn deadline_sweep_task(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(shared.options.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => sweep_deadlines(&shared),
        }
    }
}

fn sweep_deadlines(shared: &Shared) {
    let expired = lock_registry(shared).expire(Instant::now());
    for reg in expired {
        warn!(
            id = %reg.id,
            pid = reg.pid,
            timeout_ms = reg.timeout.as_millis() as u64,
            "subscriber missed its deadline",
        );
        if let Some(path) = &shared.options.reset_reason_file {
            if let Err(err) = reset::write_reset_reason(path, &reg) {
                warn!(error = %err, "failed to write reset-reason record");
            }
        }
        if let Some(script) = &shared.options.supervisor {
            reset::spawn_supervisor(script, &reg);
        }
    }
}

fn lock_registry(shared: &Shared) -> MutexGuard<'_, Registry> {
    match shared.registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Install the global tracing subscriber; keeps whichever was installed first.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), TestdError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), TestdError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn roundtrip_line(socket: &Path, line: &str) -> String {
        let mut stream = StdUnixStream::connect(socket).expect("connect");
        stream.write_all(line.as_bytes()).expect("write");
        stream.write_all(b"\n").expect("newline");
        let mut reader = std::io::BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).expect("read");
        reply
    }

    #[test]
    fn answers_ping_over_the_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = Testd::spawn(DaemonOptions::new(dir.path().join("wdogd.sock")))
            .expect("spawn");
        let reply = roundtrip_line(daemon.socket(), "{\"op\":\"ping\"}");
        assert!(reply.contains("\"pong\""), "got: {reply}");
        daemon.stop();
    }

    #[test]
    fn rejects_garbage_and_unknown_ops_with_bad_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = Testd::spawn(DaemonOptions::new(dir.path().join("wdogd.sock")))
            .expect("spawn");

        let mut stream = StdUnixStream::connect(daemon.socket()).expect("connect");
        let mut reader = std::io::BufReader::new(stream.try_clone().expect("clone"));
        let mut ask = |line: &str| {
            stream.write_all(line.as_bytes()).expect("write");
            stream.write_all(b"\n").expect("newline");
            let mut reply = String::new();
            reader.read_line(&mut reply).expect("read");
            reply
        };

        let reply = ask("this is not json");
        assert!(reply.contains("\"bad_request\""), "got: {reply}");

        // Well-formed JSON with an op the daemon does not know.
        let reply = ask("{\"op\":\"reboot\"}");
        assert!(reply.contains("\"bad_request\""), "got: {reply}");
        assert!(reply.contains("reboot"), "got: {reply}");

        // The same connection keeps serving after bad lines.
        let reply = ask("{\"op\":\"status\"}");
        assert!(reply.contains("\"subscribers\":0"), "got: {reply}");
        daemon.stop();
    }

    #[test]
    fn second_daemon_on_a_live_socket_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("wdogd.sock");
        let daemon = Testd::spawn(DaemonOptions::new(&socket)).expect("spawn");
        let err = Testd::spawn(DaemonOptions::new(&socket)).unwrap_err();
        assert!(matches!(err, TestdError::SocketBusy { .. }), "got: {err}");
        daemon.stop();
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("wdogd.sock");
        // A leftover file from a crashed daemon: bound once, never removed.
        drop(std::os::unix::net::UnixListener::bind(&socket).expect("bind"));
        assert!(socket.exists());
        let daemon = Testd::spawn(DaemonOptions::new(&socket)).expect("spawn over stale socket");
        let reply = roundtrip_line(daemon.socket(), "{\"op\":\"ping\"}");
        assert!(reply.contains("\"pong\""), "got: {reply}");
        daemon.stop();
    }

    #[test]
    fn stop_removes_the_socket_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("wdogd.sock");
        let daemon = Testd::spawn(DaemonOptions::new(&socket)).expect("spawn");
        assert!(socket.exists());
        daemon.stop();
        assert!(!socket.exists());
    }

    #[test]
    fn restart_on_the_same_socket_forgets_registrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("wdogd.sock");
        let options = DaemonOptions::new(&socket);

        let daemon = Testd::spawn(options.clone()).expect("spawn");
        let reply = roundtrip_line(
            &socket,
            "{\"op\":\"subscribe\",\"pid\":1,\"label\":null,\"timeout_ms\":5000}",
        );
        assert!(reply.contains("\"subscribed\""), "got: {reply}");
        daemon.stop();

        let daemon = Testd::spawn(options).expect("respawn");
        let reply = roundtrip_line(&socket, "{\"op\":\"status\"}");
        assert!(reply.contains("\"subscribers\":0"), "got: {reply}");
        let reply = roundtrip_line(&socket, "{\"op\":\"kick\",\"id\":0,\"ack\":1}");
        assert!(reply.contains("\"stale_registration\""), "got: {reply}");
        daemon.stop();
    }

    #[test]
    fn missed_deadline_writes_the_reset_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reset_file = dir.path().join("reset-reason");
        let mut options = DaemonOptions::new(dir.path().join("wdogd.sock"));
        options.min_timeout = Duration::from_millis(20);
        options.poll_interval = Duration::from_millis(10);
        options.reset_reason_file = Some(reset_file.clone());
        let daemon = Testd::spawn(options).expect("spawn");

        let reply = roundtrip_line(
            daemon.socket(),
            "{\"op\":\"subscribe\",\"pid\":777,\"label\":[115,118,99],\"timeout_ms\":40}",
        );
        assert!(reply.contains("\"subscribed\""), "got: {reply}");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !reset_file.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let contents = std::fs::read_to_string(&reset_file).expect("reset record must exist");
        let fields = reset::parse_reset_reason(&contents);
        assert_eq!(fields.get("PID").map(String::as_str), Some("777"));
        assert_eq!(fields.get("Label").map(String::as_str), Some("svc"));
        daemon.stop();
    }
}
