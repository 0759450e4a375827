//! Persistent tool servers: one long-lived subprocess speaking line-delimited
//! JSON-RPC over stdio.
//!
//! The connection is split across three tasks:
//!
//! - a writer that owns stdin and writes queued frames in order;
//! - a reader that owns stdout, routes response frames to the waiting request
//!   by id, and forwards every other line to the log tap;
//! - a drain that owns stderr and forwards its lines to the log tap.
//!
//! Diagnostic lines are never interpreted as protocol frames. The log tap is
//! read only while a LOG wait strategy is pending and is dropped afterwards.

use crate::agent::config::{ServerKind, ToolServerDeclaration};
use crate::error::{ServerStartError, ToolCallError, WaitFailure};
use crate::tools::catalog::{ToolCatalogEntry, truncate_result};
use crate::tools::process::{self, STOP_GRACE};
use crate::tools::protocol::{
    self, CallToolResult, ListToolsResult, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_LIST_TOOLS, RemoteTool, Request, Response,
};
use crate::tools::server::{ServerFuture, ToolServer};
use crate::tools::wait::{ReadinessProbe, wait_until_ready};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long a process whose connection dropped during startup gets to be
/// reaped before the failure is reported as a handshake error.
const EXIT_SETTLE: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Response>>>>;

// ── Connection ─────────────────────────────────────────────────────

struct Connection {
    server: String,
    child: Child,
    writer: Option<mpsc::Sender<String>>,
    pending: PendingMap,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
    logs: Option<mpsc::UnboundedReceiver<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn open(server: &str, mut child: Child) -> Result<Self, String> {
        let stdin = child.stdin.take().ok_or("stdin was not captured")?;
        let stdout = child.stdout.take().ok_or("stdout was not captured")?;
        let stderr = child.stderr.take().ok_or("stderr was not captured")?;

        let alive = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (log_tx, log_rx) = mpsc::unbounded_channel::<String>();
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);

        let writer = {
            let alive = Arc::clone(&alive);
            let server = server.to_string();
            tokio::spawn(async move {
                let mut stdin = stdin;
                while let Some(line) = write_rx.recv().await {
                    trace!("[{server}] >> {}", line.trim_end());
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        debug!("[{server}] stdin write failed: {e}");
                        alive.store(false, Ordering::SeqCst);
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        debug!("[{server}] stdin flush failed: {e}");
                        alive.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                // Dropping stdin here delivers EOF to the server.
            })
        };

        let reader = {
            let alive = Arc::clone(&alive);
            let pending = Arc::clone(&pending);
            let log_tx = log_tx.clone();
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => match protocol::parse_response(&line) {
                            Some(response) => {
                                trace!("[{server}] << {line}");
                                let waiter = lock(&pending).remove(&response.id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(response);
                                    }
                                    None => debug!(
                                        "[{server}] response for unknown request id {}",
                                        response.id
                                    ),
                                }
                            }
                            None => {
                                debug!("[{server}] stdout: {line}");
                                let _ = log_tx.send(line);
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            debug!("[{server}] stdout read failed: {e}");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // Fail every in-flight request now rather than at its timeout.
                lock(&pending).clear();
            })
        };

        let drain = {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{server}] stderr: {line}");
                    let _ = log_tx.send(line);
                }
            })
        };

        Ok(Self {
            server: server.to_string(),
            child,
            writer: Some(write_tx),
            pending,
            next_id: AtomicI64::new(1),
            alive,
            logs: Some(log_rx),
            tasks: vec![writer, reader, drain],
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send_line(&self, frame: &Request) -> Result<(), String> {
        let line = protocol::encode_line(frame).map_err(|e| format!("encode failed: {e}"))?;
        let writer = self.writer.as_ref().ok_or("connection is closing")?;
        writer
            .send(line)
            .await
            .map_err(|_| "server stdin is closed".to_string())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), String> {
        if !self.is_alive() {
            return Err("connection closed".to_string());
        }
        self.send_line(&Request::notification(method, params)).await
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // The reader marks the connection dead before clearing `pending`, so
        // this check catches requests registered after the final clear.
        if !self.is_alive() {
            lock(&self.pending).remove(&id);
            return Err("connection closed".to_string());
        }

        if let Err(e) = self.send_line(&Request::call(id, method, params)).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err("connection closed before a response arrived".to_string()),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(format!("no response to {method} within {timeout:?}"))
            }
        }
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<RemoteTool>, String> {
        let value = self.request(METHOD_LIST_TOOLS, Value::Null, timeout).await?;
        let listing: ListToolsResult =
            serde_json::from_value(value).map_err(|e| format!("malformed tools/list result: {e}"))?;
        Ok(listing.tools)
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(process::describe_exit(status)),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    async fn close(mut self, grace: Duration) {
        self.writer = None;
        self.logs = None;
        process::stop_child(&self.server, &mut self.child, grace).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        lock(&self.pending).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Readiness view over a live connection. Remembers the last catalog it saw
/// so a TOOLS wait doesn't need a second listing.
struct ConnectionProbe<'a> {
    conn: &'a mut Connection,
    timeout: Duration,
    last_catalog: Option<Vec<RemoteTool>>,
}

impl ReadinessProbe for ConnectionProbe<'_> {
    fn exit_status(&mut self) -> Option<String> {
        self.conn.exit_status()
    }

    async fn next_log_line(&mut self) -> Option<String> {
        match self.conn.logs.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn tool_names(&mut self) -> Result<Vec<String>, String> {
        let tools = self.conn.list_tools(self.timeout).await?;
        let names = tools.iter().map(|t| t.name.clone()).collect();
        self.last_catalog = Some(tools);
        Ok(names)
    }
}

// ── Server ─────────────────────────────────────────────────────────

/// A long-lived stdio tool server.
pub struct PersistentServer {
    decl: ToolServerDeclaration,
    call_timeout: Duration,
    conn: Option<Connection>,
    tools: Vec<ToolCatalogEntry>,
}

impl PersistentServer {
    pub fn new(decl: ToolServerDeclaration, call_timeout: Duration) -> Self {
        Self {
            decl,
            call_timeout,
            conn: None,
            tools: Vec::new(),
        }
    }

    /// Classify a failed handshake step. The stdin writer can notice a dead
    /// process before the reader does, so any failure whose process exits
    /// within [`EXIT_SETTLE`] is an early exit.
    async fn handshake_failure(&self, conn: &mut Connection, message: String) -> ServerStartError {
        if let Ok(Ok(status)) = tokio::time::timeout(EXIT_SETTLE, conn.child.wait()).await {
            return self.not_ready(WaitFailure::ExitedEarly {
                condition: self.decl.wait.describe(),
                status: process::describe_exit(status),
            });
        }
        ServerStartError::Handshake {
            server: self.decl.id.clone(),
            kind: ServerKind::Persistent,
            command: self.decl.display_command(),
            message,
        }
    }

    async fn start_inner(&mut self) -> Result<(), ServerStartError> {
        let id = self.decl.id.clone();
        let command = self.decl.display_command();
        info!("Starting persistent tool server {id}: {command}");

        let mut cmd = process::build_command(&self.decl, &[]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|source| ServerStartError::Spawn {
            server: id.clone(),
            kind: ServerKind::Persistent,
            command: command.clone(),
            source,
        })?;
        debug!("Tool server {id} spawned (pid {:?})", child.id());

        let mut conn = Connection::open(&id, child).map_err(|message| {
            ServerStartError::Handshake {
                server: id.clone(),
                kind: ServerKind::Persistent,
                command: command.clone(),
                message,
            }
        })?;

        match self.ready(&mut conn).await {
            Ok(tools) => {
                conn.logs = None;
                self.tools = tools;
                self.conn = Some(conn);
                info!("Tool server {id} ready with {} tool(s)", self.tools.len());
                Ok(())
            }
            Err(e) => {
                warn!("Tool server {id} failed to start: {e}");
                conn.close(Duration::ZERO).await;
                Err(e)
            }
        }
    }

    /// Handshake, wait strategy, then catalog discovery.
    async fn ready(
        &self,
        conn: &mut Connection,
    ) -> Result<Vec<ToolCatalogEntry>, ServerStartError> {
        let handshake_timeout = self.decl.wait.timeout().max(self.call_timeout);
        let params = protocol::initialize_params(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        if let Err(e) = conn
            .request(METHOD_INITIALIZE, params, handshake_timeout)
            .await
        {
            let message = format!("initialize failed: {e}");
            return Err(self.handshake_failure(conn, message).await);
        }
        if let Err(e) = conn.notify(METHOD_INITIALIZED, Value::Null).await {
            let message = format!("initialized notification failed: {e}");
            return Err(self.handshake_failure(conn, message).await);
        }

        let mut probe = ConnectionProbe {
            conn,
            timeout: self.call_timeout,
            last_catalog: None,
        };
        wait_until_ready(&self.decl.wait, &mut probe)
            .await
            .map_err(|failure| self.not_ready(failure))?;

        let remote = match probe.last_catalog.take() {
            Some(tools) => tools,
            None => match probe.conn.list_tools(self.call_timeout).await {
                Ok(tools) => tools,
                Err(e) => {
                    let message = format!("tools/list failed: {e}");
                    return Err(self.handshake_failure(probe.conn, message).await);
                }
            },
        };

        Ok(remote
            .into_iter()
            .map(|t| ToolCatalogEntry::new(t.name, t.description, t.input_schema, &self.decl.id))
            .collect())
    }

    fn not_ready(&self, failure: WaitFailure) -> ServerStartError {
        ServerStartError::NotReady {
            server: self.decl.id.clone(),
            kind: ServerKind::Persistent,
            command: self.decl.display_command(),
            failure,
        }
    }

    async fn call_inner(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, ToolCallError> {
        let conn = self.conn.as_ref().ok_or_else(|| {
            ToolCallError::new(name, format!("server '{}' is not running", self.decl.id))
        })?;

        let params = serde_json::json!({"name": name, "arguments": arguments});
        let value = conn
            .request(METHOD_CALL_TOOL, params, self.call_timeout)
            .await
            .map_err(|m| ToolCallError::new(name, m))?;
        let result: CallToolResult = serde_json::from_value(value)
            .map_err(|e| ToolCallError::new(name, format!("malformed tools/call result: {e}")))?;

        let text = truncate_result(result.text(), self.decl.max_result_bytes);
        if result.is_error {
            Err(ToolCallError::new(name, text))
        } else {
            Ok(text)
        }
    }
}

impl ToolServer for PersistentServer {
    fn id(&self) -> &str {
        &self.decl.id
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Persistent
    }

    fn start(&mut self) -> ServerFuture<'_, Result<(), ServerStartError>> {
        Box::pin(self.start_inner())
    }

    fn tools(&self) -> &[ToolCatalogEntry] {
        &self.tools
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Map<String, Value>,
    ) -> ServerFuture<'a, Result<String, ToolCallError>> {
        Box::pin(self.call_inner(name, arguments))
    }

    fn stop(&mut self) -> ServerFuture<'_, ()> {
        Box::pin(async move {
            if let Some(conn) = self.conn.take() {
                info!("Stopping tool server {}", self.decl.id);
                conn.close(STOP_GRACE).await;
            }
        })
    }

    fn is_running(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_alive)
    }

    fn pid(&self) -> Option<u32> {
        self.conn.as_ref().and_then(|c| c.child.id())
    }
}
