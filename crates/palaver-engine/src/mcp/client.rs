use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use palaver_common::{Error, Result};
use palaver_config::ToolHostConfig;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

/// Maximum size for a single JSON-RPC response line. Larger frames are
/// dropped to keep a misbehaving host from exhausting memory.
const MAX_LINE_BYTES: usize = 512 * 1024;

/// Timeout for the initialize handshake.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Starting,
    Ready,
    Degraded,
    Dead,
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type SharedState = Arc<StdMutex<HostState>>;

/// One spawned MCP tool host: owns the child process and speaks JSON-RPC
/// 2.0 over its stdio, one request per line.
///
/// All RPCs multiplex over the single pipe: writes are serialized under
/// the stdin mutex, a dedicated reader task dispatches responses to
/// per-request completion slots by id. Ids are process-unique, so calls
/// from many request tasks can be in flight concurrently.
pub struct ToolHostClient {
    name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    state: SharedState,
    next_id: AtomicU64,
}

impl ToolHostClient {
    /// Spawn the host process and complete the MCP initialize handshake.
    pub async fn spawn(config: &ToolHostConfig) -> Result<Arc<Self>> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Tool {
                    name: config.name.clone(),
                    reason: format!("failed to spawn host process: {e}"),
                }
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Invariant(format!("host '{}' has no stdin", config.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Invariant(format!("host '{}' has no stdout", config.name)))?;

        // Surface host diagnostics instead of swallowing them.
        if let Some(stderr) = child.stderr.take() {
            let host = config.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end();
                            if !trimmed.is_empty() {
                                warn!(host = %host, "{}", truncate(trimmed, 500));
                            }
                        }
                    }
                }
            });
        }

        let client = Arc::new(Self {
            name: config.name.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            state: Arc::new(StdMutex::new(HostState::Starting)),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(read_loop(
            BufReader::new(stdout),
            Arc::clone(&client.pending),
            Arc::clone(&client.state),
            client.name.clone(),
        ));

        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "palaver", "version": env!("CARGO_PKG_VERSION") },
        });

        let response = self.request("initialize", params, INIT_TIMEOUT).await?;
        self.notify("notifications/initialized", json!({})).await?;

        let negotiated = response
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        info!(host = %self.name, protocol = %negotiated, "tool host handshake completed");

        self.set_state(HostState::Ready);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HostState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: HostState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Send a request and wait for its correlated response. A timeout
    /// cancels only this waiter slot; the host keeps running and a late
    /// response is discarded by the reader.
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if self.state() == HostState::Dead {
            return Err(Error::HostDead(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Reader dropped the sender: the host died mid-call.
            Ok(Err(_)) => Err(Error::HostDead(self.name.clone())),
            Err(_) => {
                self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
                Err(Error::ToolTimeout {
                    name: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::HostDead(format!("{}: write failed: {e}", self.name)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::HostDead(format!("{}: flush failed: {e}", self.name)))?;
        Ok(())
    }

    /// List the host's tools.
    pub async fn list_tools(&self) -> Result<Vec<Value>> {
        let result = self.request("tools/list", json!({}), INIT_TIMEOUT).await?;
        Ok(result["tools"].as_array().cloned().unwrap_or_default())
    }

    /// Invoke one tool with a per-call deadline.
    pub async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<String> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }), timeout)
            .await
            .map_err(|e| match e {
                Error::ToolTimeout { timeout_ms, .. } => {
                    Error::ToolTimeout { name: name.to_string(), timeout_ms }
                }
                other => other,
            })?;

        flatten_tool_result(name, &result)
    }

    /// Terminate the host process. Pending calls fail via the reader.
    pub async fn shutdown(&self) {
        self.set_state(HostState::Dead);
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

/// The single reader for one host. Parses stdout frames and completes the
/// matching pending slot. EOF or a read error means the process is gone:
/// the host is marked dead and every waiter fails with `HostDead`.
async fn read_loop<R: AsyncBufRead + Unpin>(
    mut reader: R,
    pending: PendingMap,
    state: SharedState,
    host: String,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(n) if n > MAX_LINE_BYTES => {
                warn!(host = %host, "dropping oversized frame ({n} bytes)");
                continue;
            }
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: Value = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(host = %host, "unparseable frame from host: {e}");
                continue;
            }
        };

        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            // Server-initiated notification; nothing correlates to it.
            continue;
        };

        let slot = pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
        let Some(slot) = slot else {
            // Waiter timed out or was cancelled; discard the late result.
            continue;
        };

        let outcome = if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
            Err(Error::Tool { name: host.clone(), reason: format!("rpc error: {error}") })
        } else {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = slot.send(outcome);
    }

    warn!(host = %host, "tool host process closed its stdout, marking dead");
    *state.lock().unwrap_or_else(|p| p.into_inner()) = HostState::Dead;

    let waiters: Vec<_> = {
        let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(Error::HostDead(host.clone())));
    }
}

/// Flatten MCP content blocks into the text fed back to the model.
fn flatten_tool_result(tool: &str, result: &Value) -> Result<String> {
    let mut rendered = Vec::new();

    for block in result.get("content").and_then(Value::as_array).into_iter().flatten() {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" | "" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        rendered.push(text.to_string());
                    }
                }
            }
            "image" => {
                let mime = block
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                rendered.push(format!("[image content: mime={mime}]"));
            }
            "resource" => {
                let uri = block
                    .get("resource")
                    .and_then(|r| r.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                rendered.push(format!("[resource content: {uri}]"));
            }
            other => rendered.push(format!("[{other} content block]")),
        }
    }

    let text = if rendered.is_empty() { result.to_string() } else { rendered.join("\n") };

    let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
    if is_error {
        return Err(Error::Tool { name: tool.to_string(), reason: text });
    }

    Ok(text)
}

/// Bounded exponential backoff for host restarts: 1s, 2s, 4s, ... capped
/// at 60s.
pub(crate) fn restart_backoff(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(6)).unwrap_or(64).min(60);
    Duration::from_secs(secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_pending() -> PendingMap {
        Arc::new(StdMutex::new(HashMap::new()))
    }

    fn new_state() -> SharedState {
        Arc::new(StdMutex::new(HostState::Ready))
    }

    #[tokio::test]
    async fn reader_dispatches_responses_by_id() {
        let (client_end, mut host_end) = tokio::io::duplex(4096);
        let pending = new_pending();
        let state = new_state();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx1);
        pending.lock().unwrap().insert(2, tx2);

        tokio::spawn(read_loop(
            BufReader::new(client_end),
            Arc::clone(&pending),
            Arc::clone(&state),
            "test".into(),
        ));

        // Out-of-order responses still land on the right slots.
        host_end
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":2}}\n")
            .await
            .unwrap();
        host_end
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":1}}\n")
            .await
            .unwrap();

        assert_eq!(rx2.await.unwrap().unwrap()["ok"], 2);
        assert_eq!(rx1.await.unwrap().unwrap()["ok"], 1);
    }

    #[tokio::test]
    async fn reader_surfaces_rpc_errors() {
        let (client_end, mut host_end) = tokio::io::duplex(4096);
        let pending = new_pending();
        let state = new_state();

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        tokio::spawn(read_loop(
            BufReader::new(client_end),
            Arc::clone(&pending),
            Arc::clone(&state),
            "test".into(),
        ));

        host_end
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":7,\"error\":{\"code\":-32601,\"message\":\"no such method\"}}\n",
            )
            .await
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("no such method"));
    }

    #[tokio::test]
    async fn eof_marks_dead_and_fails_pending() {
        let (client_end, host_end) = tokio::io::duplex(4096);
        let pending = new_pending();
        let state = new_state();

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, tx);

        let handle = tokio::spawn(read_loop(
            BufReader::new(client_end),
            Arc::clone(&pending),
            Arc::clone(&state),
            "test".into(),
        ));

        drop(host_end); // host exits
        handle.await.unwrap();

        assert_eq!(*state.lock().unwrap(), HostState::Dead);
        assert!(matches!(rx.await.unwrap().unwrap_err(), Error::HostDead(_)));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_responses_for_timed_out_calls_are_discarded() {
        let (client_end, mut host_end) = tokio::io::duplex(4096);
        let pending = new_pending();
        let state = new_state();

        tokio::spawn(read_loop(
            BufReader::new(client_end),
            Arc::clone(&pending),
            Arc::clone(&state),
            "test".into(),
        ));

        // No pending slot for id 99 — simulates a timed-out waiter.
        host_end
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":99,\"result\":{}}\n")
            .await
            .unwrap();
        host_end
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":100,\"result\":\"later\"}\n")
            .await
            .unwrap();

        // The loop must keep dispatching after a dangling id.
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(101, tx);
        host_end
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":101,\"result\":\"still alive\"}\n")
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), "still alive");
    }

    #[test]
    fn flattens_text_blocks() {
        let result = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"}
            ],
            "isError": false
        });
        assert_eq!(flatten_tool_result("t", &result).unwrap(), "line one\nline two");
    }

    #[test]
    fn non_text_blocks_become_placeholders() {
        let result = json!({
            "content": [{"type": "image", "mimeType": "image/png", "data": "aGk="}]
        });
        let out = flatten_tool_result("t", &result).unwrap();
        assert!(out.contains("image content"));
        assert!(out.contains("image/png"));
    }

    #[test]
    fn is_error_flag_fails_the_call() {
        let result = json!({
            "content": [{"type": "text", "text": "permission denied"}],
            "isError": true
        });
        let err = flatten_tool_result("read_file", &result).unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert!(err.is_tool_recoverable());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(restart_backoff(0), Duration::from_secs(1));
        assert_eq!(restart_backoff(1), Duration::from_secs(2));
        assert_eq!(restart_backoff(4), Duration::from_secs(16));
        assert_eq!(restart_backoff(10), Duration::from_secs(60));
        assert_eq!(restart_backoff(u32::MAX), Duration::from_secs(60));
    }
}
