//! One tool-server child process.
//!
//! Each server gets exactly one reader task draining stdout, one writer task
//! draining a request queue onto stdin, and a stderr task feeding the log
//! sink. Callers suspend on a per-request oneshot slot; responses are routed
//! back by `id`. Requests hit stdin in submission order; responses may
//! arrive in any order.

use crate::protocol::{self, Inbound, ParsedLine, ToolListing, METHOD_LIST_TOOLS, METHOD_LOG};
use ferroclaw_core::error::ToolCallError;
use ferroclaw_core::tool::ToolSpec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};

/// How long a server gets to answer its first `tools/list`.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive malformed stdout lines before the server is restarted.
const MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 3;

/// Upper bound on outstanding requests per server.
const MAX_IN_FLIGHT: usize = 8;

/// How long a timed-out request id stays in the zombie set so a late
/// response cannot be misdelivered.
const ZOMBIE_GRACE: Duration = Duration::from_secs(60);

/// Grace between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Restart backoff bounds.
pub(crate) const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub(crate) const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Static description of one configured tool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Routing name, unique across the pool
    pub name: String,

    /// Full command line, split shell-style before spawning
    pub command: String,
}

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Spawned, discovery not finished
    Starting,
    /// Discovered and accepting calls
    Ready,
    /// Exited or failed discovery; may be restarted by the supervisor
    Failed,
    /// Shut down on purpose; never restarted
    Stopped,
}

/// Handle to one tool-server process. Cheap to clone.
#[derive(Clone)]
pub struct ToolServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    status: Mutex<ServerStatus>,
    specs: Mutex<Vec<ToolSpec>>,
    child: tokio::sync::Mutex<Option<Child>>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, ToolCallError>>>>,
    zombies: Mutex<HashMap<u64, Instant>>,
    next_id: AtomicU64,
    protocol_errors: AtomicU32,
    in_flight: Semaphore,
    exit_notify: Notify,
    /// Pokes the manager to rebuild the shared catalog.
    refresh: mpsc::UnboundedSender<()>,
}

impl ToolServer {
    pub(crate) fn new(config: ServerConfig, refresh: mpsc::UnboundedSender<()>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                status: Mutex::new(ServerStatus::Starting),
                specs: Mutex::new(Vec::new()),
                child: tokio::sync::Mutex::new(None),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                zombies: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                protocol_errors: AtomicU32::new(0),
                in_flight: Semaphore::new(MAX_IN_FLIGHT),
                exit_notify: Notify::new(),
                refresh,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.lock().unwrap()
    }

    /// Tools declared at the last successful discovery. Empty while the
    /// server is down.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.inner.specs.lock().unwrap().clone()
    }

    /// Spawn the process and run capability discovery. On success the
    /// server is `Ready` and its specs are published; on failure it is
    /// `Failed` and the child (if any) is reaped.
    pub(crate) async fn launch(&self) -> Result<usize, ToolCallError> {
        self.inner.set_status(ServerStatus::Starting);
        let stdout = self.inner.spawn_process().await?;
        let reader = Arc::clone(&self.inner);
        tokio::spawn(reader.read_loop(stdout));

        match self
            .inner
            .request(METHOD_LIST_TOOLS, &json!({}), STARTUP_TIMEOUT)
            .await
        {
            Ok(result) => {
                let listing: ToolListing =
                    match serde_json::from_value(result) {
                        Ok(l) => l,
                        Err(e) => {
                            self.inner.set_status(ServerStatus::Failed);
                            self.inner.teardown_child().await;
                            return Err(ToolCallError::ProtocolError {
                                server: self.inner.config.name.clone(),
                                detail: format!("unreadable tools/list result: {e}"),
                            });
                        }
                    };

                let specs: Vec<ToolSpec> = listing
                    .tools
                    .into_iter()
                    .map(|tool| ToolSpec {
                        server: self.inner.config.name.clone(),
                        name: tool.name,
                        description: tool.description,
                        input_schema: tool.input_schema,
                    })
                    .collect();
                let count = specs.len();

                *self.inner.specs.lock().unwrap() = specs;
                self.inner.set_status(ServerStatus::Ready);
                let _ = self.inner.refresh.send(());
                info!(
                    server = %self.inner.config.name,
                    tools = count,
                    "tool server ready"
                );
                Ok(count)
            }
            Err(e) => {
                warn!(
                    server = %self.inner.config.name,
                    error = %e,
                    "tool server failed discovery"
                );
                self.inner.set_status(ServerStatus::Failed);
                self.inner.teardown_child().await;
                Err(e)
            }
        }
    }

    /// Invoke one tool. The per-server in-flight cap is applied here;
    /// callers beyond it queue on the semaphore in FIFO order.
    pub async fn call_tool(
        &self,
        tool: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, ToolCallError> {
        if self.status() != ServerStatus::Ready {
            return Err(ToolCallError::ServerUnavailable(
                self.inner.config.name.clone(),
            ));
        }

        let _permit = self
            .inner
            .in_flight
            .acquire()
            .await
            .map_err(|_| ToolCallError::ServerUnavailable(self.inner.config.name.clone()))?;

        self.inner.request(tool, params, timeout).await
    }

    /// Restart loop: waits for a crash of an operational server, then
    /// respawns with exponential backoff, re-running discovery each time.
    pub(crate) async fn supervise(
        &self,
        events: Arc<ferroclaw_core::EventBus>,
    ) {
        loop {
            self.inner.exit_notify.notified().await;
            if self.status() == ServerStatus::Stopped {
                return;
            }

            let mut backoff = BACKOFF_INITIAL;
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                events.publish(ferroclaw_core::DomainEvent::ServerRestarting {
                    server: self.inner.config.name.clone(),
                    attempt,
                    backoff_ms: backoff.as_millis() as u64,
                    timestamp: chrono::Utc::now(),
                });
                warn!(
                    server = %self.inner.config.name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "tool server exited, restarting"
                );
                tokio::time::sleep(backoff).await;
                if self.status() == ServerStatus::Stopped {
                    return;
                }

                match self.launch().await {
                    Ok(count) => {
                        events.publish(ferroclaw_core::DomainEvent::ServerReady {
                            server: self.inner.config.name.clone(),
                            tool_count: count,
                            timestamp: chrono::Utc::now(),
                        });
                        break;
                    }
                    Err(e) => {
                        debug!(
                            server = %self.inner.config.name,
                            error = %e,
                            "restart attempt failed"
                        );
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        }
    }

    /// Terminate the process: close stdin, SIGTERM, and escalate to
    /// SIGKILL after a grace period. Pending callers observe
    /// `ServerCrashed` when the reader drains.
    pub(crate) async fn shutdown(&self) {
        self.inner.set_status(ServerStatus::Stopped);
        // Dropping the queue sender ends the writer task, which closes the
        // child's stdin.
        *self.inner.writer.lock().unwrap() = None;

        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // Ask politely first.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }

            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {
                    debug!(server = %self.inner.config.name, "tool server exited cleanly");
                }
                Err(_) => {
                    warn!(
                        server = %self.inner.config.name,
                        "tool server ignored SIGTERM, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }
    }
}

impl Inner {
    fn set_status(&self, status: ServerStatus) {
        *self.status.lock().unwrap() = status;
    }

    async fn spawn_process(&self) -> Result<ChildStdout, ToolCallError> {
        let argv = shlex::split(&self.config.command).unwrap_or_default();
        if argv.is_empty() {
            return Err(ToolCallError::ServerUnavailable(self.config.name.clone()));
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            warn!(server = %self.config.name, error = %e, "failed to spawn tool server");
            self.set_status(ServerStatus::Failed);
            ToolCallError::ServerUnavailable(self.config.name.clone())
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            self.set_status(ServerStatus::Failed);
            let _ = child.kill().await;
            return Err(ToolCallError::ServerUnavailable(self.config.name.clone()));
        };

        self.protocol_errors.store(0, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel::<String>(MAX_IN_FLIGHT * 2);
        *self.writer.lock().unwrap() = Some(tx);
        *self.child.lock().await = Some(child);

        tokio::spawn(Self::write_loop(self.config.name.clone(), rx, stdin));
        tokio::spawn(Self::stderr_loop(self.config.name.clone(), stderr));

        Ok(stdout)
    }

    /// Issue one request and suspend until the response, the deadline, or
    /// server exit — whichever comes first.
    async fn request(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, ToolCallError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let sender = self.writer.lock().unwrap().clone();
        let Some(sender) = sender else {
            self.pending.lock().unwrap().remove(&id);
            return Err(ToolCallError::ServerUnavailable(self.config.name.clone()));
        };

        let line = protocol::encode_request(id, method, params);
        if sender.send(line).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(ToolCallError::ServerCrashed(self.config.name.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without an explicit send — the exit flush always
            // sends, so this only covers an aborted flush.
            Ok(Err(_)) => Err(ToolCallError::ServerCrashed(self.config.name.clone())),
            Err(_) => {
                if self.pending.lock().unwrap().remove(&id).is_some() {
                    let mut zombies = self.zombies.lock().unwrap();
                    let now = Instant::now();
                    zombies.retain(|_, at| now.duration_since(*at) < ZOMBIE_GRACE);
                    zombies.insert(id, now);
                }
                Err(ToolCallError::CallTimeout {
                    server: self.config.name.clone(),
                    tool: method.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn write_loop(name: String, mut rx: mpsc::Receiver<String>, stdin: ChildStdin) {
        let mut writer = BufWriter::new(stdin);
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                warn!(server = %name, "write to tool server stdin failed");
                break;
            }
        }
        // Queue closed or broken pipe: dropping the writer closes stdin.
    }

    async fn stderr_loop(name: String, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(server = %name, line = %line, "tool server stderr");
        }
    }

    async fn read_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match protocol::parse_line(&line) {
                    ParsedLine::Empty => {}
                    ParsedLine::Message(inbound) => {
                        self.protocol_errors.store(0, Ordering::SeqCst);
                        self.route(inbound);
                    }
                    ParsedLine::Malformed(detail) => {
                        warn!(
                            server = %self.config.name,
                            detail = %detail,
                            "malformed line from tool server"
                        );
                        let faults = self.protocol_errors.fetch_add(1, Ordering::SeqCst) + 1;
                        if faults >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                            warn!(
                                server = %self.config.name,
                                faults,
                                "too many consecutive protocol errors, restarting server"
                            );
                            break;
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %self.config.name, error = %e, "stdout read error");
                    break;
                }
            }
        }
        self.handle_exit().await;
    }

    /// Route a parsed inbound message to its waiting caller.
    fn route(&self, inbound: Inbound) {
        match inbound {
            Inbound::Response { id, result } => {
                let slot = self.pending.lock().unwrap().remove(&id);
                match slot {
                    Some(tx) => {
                        let mapped = result.map_err(|failure| ToolCallError::RemoteError {
                            code: failure.code,
                            message: failure.message,
                        });
                        let _ = tx.send(mapped);
                    }
                    None => {
                        if self.zombies.lock().unwrap().remove(&id).is_some() {
                            debug!(
                                server = %self.config.name,
                                id,
                                "late response for timed-out request dropped"
                            );
                        } else {
                            debug!(
                                server = %self.config.name,
                                id,
                                "response with unknown id dropped"
                            );
                        }
                    }
                }
            }
            Inbound::Notification { method, params } => {
                if method == METHOD_LOG {
                    let message = params
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    info!(server = %self.config.name, message = %message, "tool server log");
                } else {
                    debug!(
                        server = %self.config.name,
                        method = %method,
                        "notification dropped"
                    );
                }
            }
            Inbound::Ignored => {
                debug!(server = %self.config.name, "unsupported message shape dropped");
            }
        }
    }

    /// Crash path: fail pending callers, clear declared tools, reap the
    /// child, and wake the supervisor if the server had been operational.
    async fn handle_exit(&self) {
        let was_ready = {
            let mut status = self.status.lock().unwrap();
            let previous = *status;
            if previous != ServerStatus::Stopped {
                *status = ServerStatus::Failed;
            }
            previous == ServerStatus::Ready
        };

        *self.writer.lock().unwrap() = None;
        self.specs.lock().unwrap().clear();

        let drained: Vec<(u64, oneshot::Sender<Result<Value, ToolCallError>>)> =
            self.pending.lock().unwrap().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(ToolCallError::ServerCrashed(self.config.name.clone())));
        }

        self.teardown_child().await;
        let _ = self.refresh.send(());
        if was_ready {
            self.exit_notify.notify_one();
        }
    }

    async fn teardown_child(&self) {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}
