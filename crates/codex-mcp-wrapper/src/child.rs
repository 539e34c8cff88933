//! Runtime handle for one child server.
//!
//! A [`ChildClient`] owns the child's stdin (outbound) and stdout (inbound),
//! correlates aggregator-originated requests with responses through a pending
//! map, and hands everything else — forwarded responses, notifications,
//! child-initiated requests — to the aggregator as [`ChildEvent`]s.
//!
//! Id spaces are partitioned: requests issued through
//! [`ChildClient::request`] carry string ids `"wrapper-<n>"`, while
//! parent-forwarded traffic reuses the parent's id verbatim. A response id
//! therefore resolves in exactly one place.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::config::ChildSpec;
use crate::error::WrapperError;
use crate::framing::{MessageReader, write_newline_delimited};
use crate::rpc::{self, MessageKind};
use crate::transport::ChildTransport;

/// Prefix of the id namespace reserved for aggregator-originated requests.
pub const LOCAL_ID_PREFIX: &str = "wrapper-";

/// The payload of a child's response: `Ok(result)` or `Err(error object)`.
pub type ChildReply = Result<Value, Value>;

/// Messages from a child's reader task to the aggregator loop.
#[derive(Debug)]
pub enum ChildEvent {
    /// A decoded message that is not a response to a local request:
    /// a forwarded response, a notification, or a child-initiated request.
    Message { child: usize, msg: Value },
    /// The child's stream closed; `status` is its exit status when known.
    Exited {
        child: usize,
        status: Option<ExitStatus>,
    },
}

type PendingMap = HashMap<String, oneshot::Sender<ChildReply>>;

/// Handle for one running child server.
pub struct ChildClient {
    index: usize,
    spec: ChildSpec,
    key: String,
    stdin: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    process: Arc<Mutex<Option<Child>>>,
}

impl std::fmt::Debug for ChildClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildClient")
            .field("index", &self.index)
            .field("key", &self.key)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ChildClient {
    /// Spawn the child via `transport` and wire up its reader task.
    ///
    /// Inbound dispatch runs until the child's stdout closes; at that point
    /// pending requests are failed, the client is marked dead, and
    /// [`ChildEvent::Exited`] is emitted with the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Spawn`] when the transport cannot start the
    /// child.
    pub async fn spawn(
        index: usize,
        spec: ChildSpec,
        transport: &dyn ChildTransport,
        events: mpsc::Sender<ChildEvent>,
    ) -> Result<Arc<Self>, WrapperError> {
        let io = transport.spawn().await?;
        let key = spec.key();

        let client = Arc::new(Self {
            index,
            spec,
            key,
            stdin: Mutex::new(io.stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            alive: Arc::new(AtomicBool::new(true)),
            process: io.process,
        });

        let reader_client = Arc::clone(&client);
        tokio::spawn(async move {
            reader_client.read_loop(io.stdout, events).await;
        });

        Ok(client)
    }

    /// Index of this child in the aggregator's child list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The tool-prefix key (see [`ChildSpec::key`]).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The spec this child was started from.
    pub fn spec(&self) -> &ChildSpec {
        &self.spec
    }

    /// Whether the child's stream is still open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send an aggregator-originated request and await the child's reply.
    ///
    /// The request carries a local `"wrapper-<n>"` id; callers bound the wait
    /// with `tokio::time::timeout` where the protocol requires it.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::ChildWrite`] when the message cannot be
    /// written and [`WrapperError::ChildGone`] when the child goes away
    /// without replying.
    pub async fn request(&self, method: &str, params: Value) -> Result<ChildReply, WrapperError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{LOCAL_ID_PREFIX}{n}");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let msg = rpc::make_request(Value::String(id.clone()), method, params);
        if let Err(e) = self.send(&msg).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(WrapperError::ChildGone {
                child: self.key.clone(),
            }),
        }
    }

    /// Fire-and-forget notification.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::ChildWrite`] when the write fails.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), WrapperError> {
        self.send(&rpc::make_notification(method, params)).await
    }

    /// Write a message to the child verbatim (parent-forwarded traffic).
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::ChildWrite`] when the write fails.
    pub async fn send(&self, msg: &Value) -> Result<(), WrapperError> {
        let text = msg.to_string();
        let mut stdin = self.stdin.lock().await;
        write_newline_delimited(&mut *stdin, &text)
            .await
            .map_err(|source| WrapperError::ChildWrite {
                child: self.key.clone(),
                source,
            })
    }

    /// Inbound dispatch: runs on a dedicated task until stdout closes.
    async fn read_loop(
        self: Arc<Self>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        events: mpsc::Sender<ChildEvent>,
    ) {
        let mut reader = MessageReader::new(stdout);
        loop {
            let frame = match reader.next_message().await {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("child '{}': read error: {e}", self.key);
                    break;
                }
            };

            let msg: Value = match serde_json::from_str(&frame) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("child '{}': dropping unparseable frame: {e}", self.key);
                    continue;
                }
            };

            tracing::debug!(child = %self.key, direction = "child->wrapper", %msg);

            if rpc::classify(&msg) == MessageKind::Response && self.resolve_local(&msg).await {
                continue;
            }
            if events
                .send(ChildEvent::Message {
                    child: self.index,
                    msg,
                })
                .await
                .is_err()
            {
                break;
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        let status = match self.process.lock().await.take() {
            Some(mut child) => child.wait().await.ok(),
            None => None,
        };
        self.fail_pending().await;
        let _ = events
            .send(ChildEvent::Exited {
                child: self.index,
                status,
            })
            .await;
    }

    /// Resolve a response against the local pending map. Returns `true` when
    /// the id belonged to an aggregator-originated request.
    async fn resolve_local(&self, msg: &Value) -> bool {
        let Some(id) = msg.get("id").and_then(Value::as_str) else {
            return false;
        };
        if !id.starts_with(LOCAL_ID_PREFIX) {
            return false;
        }
        let Some(tx) = self.pending.lock().await.remove(id) else {
            tracing::debug!("child '{}': response for unknown local id {id}", self.key);
            return true;
        };
        let reply = match msg.get("error") {
            Some(err) => Err(err.clone()),
            None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
        true
    }

    /// Fail every outstanding local request after the child exits.
    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(serde_json::json!({
                "code": rpc::ERR_SERVER,
                "message": format!("MCP server '{}' exited before responding", self.key),
                "data": {"kind": "server_error"}
            })));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn spec() -> ChildSpec {
        ChildSpec {
            name: Some("mock".to_string()),
            command: "mock-server".to_string(),
            args: Vec::new(),
            env: Default::default(),
        }
    }

    async fn spawn_mock() -> (
        Arc<ChildClient>,
        crate::transport::MockTransportHandle,
        mpsc::Receiver<ChildEvent>,
    ) {
        let (transport, handle) = MockTransport::pair();
        let (events_tx, events_rx) = mpsc::channel(16);
        let client = ChildClient::spawn(0, spec(), &transport, events_tx)
            .await
            .unwrap();
        (client, handle, events_rx)
    }

    #[tokio::test]
    async fn test_request_uses_local_id_and_resolves_result() {
        let (client, handle, _events) = spawn_mock().await;

        let mut child_in = BufReader::new(handle.child_stdin);
        let mut child_out = handle.child_stdout;

        let request = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("tools/list", json!({})).await }
        });

        let mut line = String::new();
        child_in.read_line(&mut line).await.unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["method"], "tools/list");
        let id = req["id"].as_str().unwrap().to_string();
        assert!(id.starts_with(LOCAL_ID_PREFIX), "unexpected id {id}");

        let resp = json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}});
        child_out
            .write_all(format!("{resp}\n").as_bytes())
            .await
            .unwrap();

        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.unwrap(), json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_request_resolves_error_reply() {
        let (client, handle, _events) = spawn_mock().await;
        let mut child_in = BufReader::new(handle.child_stdin);
        let mut child_out = handle.child_stdout;

        let request = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("tools/list", json!({})).await }
        });

        let mut line = String::new();
        child_in.read_line(&mut line).await.unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        let resp = json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": {"code": -32603, "message": "boom"}
        });
        child_out
            .write_all(format!("{resp}\n").as_bytes())
            .await
            .unwrap();

        let reply = request.await.unwrap().unwrap();
        let err = reply.unwrap_err();
        assert_eq!(err["code"], -32603);
    }

    #[tokio::test]
    async fn test_notification_goes_to_aggregator() {
        let (_client, mut handle, mut events) = spawn_mock().await;

        let notif = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"p": 1}});
        handle
            .child_stdout
            .write_all(format!("{notif}\n").as_bytes())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChildEvent::Message { child, msg } => {
                assert_eq!(child, 0);
                assert_eq!(msg["method"], "notifications/progress");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forwarded_response_goes_to_aggregator() {
        let (_client, mut handle, mut events) = spawn_mock().await;

        // A response whose id is not in the local namespace belongs to the
        // aggregator's routing table.
        let resp = json!({"jsonrpc": "2.0", "id": 42, "result": {}});
        handle
            .child_stdout
            .write_all(format!("{resp}\n").as_bytes())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChildEvent::Message { msg, .. } => assert_eq!(msg["id"], 42),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_dropped_not_fatal() {
        let (_client, mut handle, mut events) = spawn_mock().await;

        handle.child_stdout.write_all(b"not json\n").await.unwrap();
        let notif = json!({"jsonrpc": "2.0", "method": "notifications/ok"});
        handle
            .child_stdout
            .write_all(format!("{notif}\n").as_bytes())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChildEvent::Message { msg, .. } => assert_eq!(msg["method"], "notifications/ok"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_fails_and_exit_event_on_stream_close() {
        let (client, handle, mut events) = spawn_mock().await;

        let request = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("tools/list", json!({})).await }
        });

        // Wait until the request is registered before closing the stream.
        let mut child_in = BufReader::new(handle.child_stdin);
        let mut line = String::new();
        child_in.read_line(&mut line).await.unwrap();

        drop(handle.child_stdout);

        let reply = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let err = reply.unwrap_err();
        assert!(
            err["message"].as_str().unwrap().contains("exited"),
            "unexpected error {err}"
        );

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ChildEvent::Exited { child: 0, .. }));
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn test_send_after_peer_close_errors() {
        let (client, handle, _events) = spawn_mock().await;
        // Dropping the test-side ends closes both pipes.
        drop(handle);
        let err = client
            .notify("notifications/initialized", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WrapperError::ChildWrite { .. }));
    }

    #[tokio::test]
    async fn test_child_speaks_content_length_framing() {
        let (client, handle, _events) = spawn_mock().await;
        let mut child_in = BufReader::new(handle.child_stdin);
        let mut child_out = handle.child_stdout;

        let request = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("ping", json!({})).await }
        });

        let mut line = String::new();
        child_in.read_line(&mut line).await.unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();

        let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"ok": true}});
        let framed = crate::framing::encode_content_length(&resp.to_string());
        child_out.write_all(&framed).await.unwrap();

        let reply = request.await.unwrap().unwrap().unwrap();
        assert_eq!(reply["ok"], true);
    }
}
