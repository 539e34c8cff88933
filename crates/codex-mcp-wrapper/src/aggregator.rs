//! The aggregating proxy core.
//!
//! [`Aggregator::run`] sits between the parent (upstream, on stdin/stdout)
//! and the configured child servers (downstream subprocesses). It:
//!
//! - Decodes upstream frames in either framing and dispatches by method
//! - Fans `initialize` and `tools/list` out to every child under a timeout
//! - Merges tool catalogs into one namespace (`<key>__<name>`, first
//!   publisher wins) and normalizes the merged schemas
//! - Routes `tools/call` to the owning child, reusing the parent's id
//! - Broadcasts parent notifications and forwards child notifications
//! - Shapes every child failure through the error normalizer
//! - Exits with the last child's exit status once the live list empties
//!
//! The dispatcher is a single `select!` loop; fan-outs run on spawned tasks
//! that report back through the upstream write channel, so nothing holds the
//! loop while waiting on a child.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use crate::child::{ChildClient, ChildEvent};
use crate::config::{ChildSpec, WrapperOptions};
use crate::envelope::{ErrorContext, normalize_error};
use crate::error::WrapperError;
use crate::framing::{MessageReader, write_newline_delimited};
use crate::rpc::{self, ERR_METHOD_NOT_FOUND, ERR_SERVER, MessageKind};
use crate::schema::normalize_tools;
use crate::transport::ProcessTransport;

/// Capacity of the upstream write channel and the child event channel.
const CHANNEL_CAPACITY: usize = 256;

/// Protocol version used when neither a child nor the parent supplies one.
const FALLBACK_PROTOCOL_VERSION: &str = "2024-06-13";

/// Context retained for every in-flight parent request.
#[derive(Debug, Clone)]
struct ReqCtx {
    method: String,
    params: Value,
}

/// The three routing tables. Mutated by the dispatcher; fan-out tasks only
/// touch `parent_ctx` (to retire their own entry) and `tool_to_child` (the
/// `tools/list` merge), each under the lock.
#[derive(Debug, Default)]
struct Routing {
    /// published tool name -> (child index, original tool name)
    tool_to_child: HashMap<String, (usize, String)>,
    /// parent request id -> child index owning the forwarded request
    parent_to_child: HashMap<Value, usize>,
    /// parent request id -> (method, params) for error shaping
    parent_ctx: HashMap<Value, ReqCtx>,
}

/// The aggregating proxy.
#[derive(Debug)]
pub struct Aggregator {
    specs: Vec<ChildSpec>,
    options: WrapperOptions,
}

impl Aggregator {
    pub fn new(specs: Vec<ChildSpec>, options: WrapperOptions) -> Self {
        Self { specs, options }
    }

    /// Run the proxy loop until upstream EOF or the last child exits.
    ///
    /// Returns the process exit code: the exit code of the last child to
    /// exit, or zero when unknown.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable upstream I/O failures; child
    /// failures surface as JSON-RPC error responses.
    pub async fn run<R, W>(self, upstream_in: R, mut upstream_out: W) -> anyhow::Result<i32>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, mut events_rx) = mpsc::channel::<ChildEvent>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

        let mut children: Vec<Arc<ChildClient>> = Vec::new();
        for spec in &self.specs {
            let transport = ProcessTransport::new(spec.clone());
            match ChildClient::spawn(children.len(), spec.clone(), &transport, events_tx.clone())
                .await
            {
                Ok(client) => {
                    tracing::debug!("started child '{}' ({})", client.key(), spec.command);
                    children.push(client);
                }
                Err(e) => {
                    let raw = spawn_failure_value(&e);
                    let envelope = normalize_error(
                        &raw,
                        &ErrorContext {
                            server_name: Some(spec.key()),
                            ..Default::default()
                        },
                        false,
                    );
                    tracing::error!("failed to start child '{}': {envelope}", spec.key());
                }
            }
        }

        if self.options.summary && !children.is_empty() {
            let names: Vec<&str> = children.iter().map(|c| c.key()).collect();
            eprintln!(
                "codex-mcp-wrapper: serving {} MCP server(s): {}",
                children.len(),
                names.join(", ")
            );
        }

        let spawned_any = !children.is_empty();
        let mut live = children.len();
        let mut last_exit_code: Option<i32> = None;

        let state = Arc::new(Mutex::new(Routing::default()));
        let mut reader = MessageReader::new(upstream_in);

        let exit_code = loop {
            tokio::select! {
                frame = reader.next_message() => {
                    match frame? {
                        Some(raw) => {
                            self.handle_upstream_frame(&raw, &children, &state, &out_tx).await;
                        }
                        None => {
                            tracing::info!("upstream EOF, shutting down");
                            break last_exit_code.unwrap_or(0);
                        }
                    }
                }

                Some(event) = events_rx.recv() => {
                    match event {
                        ChildEvent::Message { child, msg } => {
                            self.handle_child_message(child, msg, &children, &state, &out_tx).await;
                        }
                        ChildEvent::Exited { child, status } => {
                            let key = children
                                .get(child)
                                .map(|c| c.key().to_string())
                                .unwrap_or_default();
                            let code = status.and_then(|s| s.code());
                            tracing::info!(
                                "child '{key}' exited (code {})",
                                code.map_or("unknown".to_string(), |c| c.to_string())
                            );
                            last_exit_code = Some(code.unwrap_or(0));
                            self.fail_routed_requests(child, &key, &state, &out_tx).await;
                            live = live.saturating_sub(1);
                            if spawned_any && live == 0 {
                                break last_exit_code.unwrap_or(0);
                            }
                        }
                    }
                }

                Some(msg) = out_rx.recv() => {
                    let text = msg.to_string();
                    tracing::debug!(direction = "wrapper->parent", %text);
                    if write_newline_delimited(&mut upstream_out, &text).await.is_err() {
                        break last_exit_code.unwrap_or(0);
                    }
                }
            }
        };

        // Flush replies queued behind the loop exit (e.g. errors for
        // requests stranded by the last child's death). No shutdown is sent
        // to the children; the host OS reaps them when the process exits.
        while let Ok(msg) = out_rx.try_recv() {
            let text = msg.to_string();
            if write_newline_delimited(&mut upstream_out, &text).await.is_err() {
                break;
            }
        }

        Ok(exit_code)
    }

    /// Dispatch one decoded parent frame.
    async fn handle_upstream_frame(
        &self,
        raw: &str,
        children: &[Arc<ChildClient>],
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("dropping unparseable parent frame: {e}");
                return;
            }
        };
        tracing::debug!(direction = "parent->wrapper", %msg);

        match rpc::classify(&msg) {
            MessageKind::Request => {
                let id = msg.get("id").cloned().unwrap_or(Value::Null);
                let method = msg
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let params = msg.get("params").cloned().unwrap_or(Value::Null);

                state.lock().await.parent_ctx.insert(
                    id.clone(),
                    ReqCtx {
                        method: method.clone(),
                        params: params.clone(),
                    },
                );

                match method.as_str() {
                    "initialize" => {
                        self.spawn_initialize(id, params, live_children(children), state, out_tx);
                    }
                    "tools/list" => {
                        self.spawn_tools_list(id, live_children(children), state, out_tx);
                    }
                    "tools/call" => {
                        self.handle_tools_call(id, params, msg, children, state, out_tx)
                            .await;
                    }
                    "ping" => {
                        state.lock().await.parent_ctx.remove(&id);
                        let _ = out_tx
                            .send(rpc::make_result_response(id, json!({"ok": true})))
                            .await;
                    }
                    _ => {
                        self.forward_unknown_method(id, &method, msg, children, state, out_tx)
                            .await;
                    }
                }
            }
            MessageKind::Notification => {
                for child in live_children(children) {
                    if let Err(e) = child.send(&msg).await {
                        tracing::warn!("broadcast to '{}' failed: {e}", child.key());
                    }
                }
            }
            MessageKind::Response => {
                tracing::debug!("ignoring response from parent");
            }
            MessageKind::Other => {
                tracing::debug!("dropping unclassifiable parent message");
            }
        }
    }

    /// `initialize` fan-out (spawned; replies through the write channel).
    fn spawn_initialize(
        &self,
        id: Value,
        params: Value,
        children: Vec<Arc<ChildClient>>,
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        let state = Arc::clone(state);
        let out_tx = out_tx.clone();
        let init_timeout = self.options.init_timeout;
        let passthrough = self.options.error_passthrough;

        tokio::spawn(async move {
            let requested = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .map(String::from);

            let reply = if children.is_empty() {
                rpc::make_result_response(id.clone(), minimal_initialize_result(requested.as_deref()))
            } else {
                let total = children.len();
                let (tx, mut rx) = mpsc::channel(total);
                for child in children {
                    let tx = tx.clone();
                    let params = params.clone();
                    tokio::spawn(async move {
                        let outcome = match child.request("initialize", params).await {
                            Ok(reply) => reply,
                            Err(e) => Err(request_failure_value(&e)),
                        };
                        let _ = tx.send(outcome).await;
                    });
                }
                drop(tx);

                let deadline = tokio::time::sleep(init_timeout);
                tokio::pin!(deadline);
                let mut first_error: Option<Value> = None;
                let mut failures = 0usize;

                loop {
                    tokio::select! {
                        _ = &mut deadline => {
                            tracing::warn!("initialize fan-out timed out; replying with synthesized result");
                            break rpc::make_result_response(
                                id.clone(),
                                minimal_initialize_result(requested.as_deref()),
                            );
                        }
                        outcome = rx.recv() => match outcome {
                            Some(Ok(result)) => {
                                break rpc::make_result_response(
                                    id.clone(),
                                    coerce_initialize_result(result, requested.as_deref()),
                                );
                            }
                            Some(Err(e)) => {
                                failures += 1;
                                first_error.get_or_insert(e);
                                if failures == total {
                                    let raw = first_error.take().unwrap_or(Value::Null);
                                    let ctx = ErrorContext {
                                        method: Some("initialize".to_string()),
                                        ..Default::default()
                                    };
                                    break rpc::make_error_response_from(
                                        id.clone(),
                                        normalize_error(&raw, &ctx, passthrough),
                                    );
                                }
                            }
                            None => {
                                break rpc::make_result_response(
                                    id.clone(),
                                    minimal_initialize_result(requested.as_deref()),
                                );
                            }
                        }
                    }
                }
            };

            state.lock().await.parent_ctx.remove(&id);
            let _ = out_tx.send(reply).await;
        });
    }

    /// `tools/list` fan-out and merge (spawned).
    fn spawn_tools_list(
        &self,
        id: Value,
        children: Vec<Arc<ChildClient>>,
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        let state = Arc::clone(state);
        let out_tx = out_tx.clone();
        let per_child = self.options.tools_list_timeout;

        tokio::spawn(async move {
            let total = children.len();
            let (tx, mut rx) = mpsc::channel::<(usize, Option<Vec<Value>>)>(total.max(1));
            for (slot, child) in children.iter().enumerate() {
                let tx = tx.clone();
                let child = Arc::clone(child);
                tokio::spawn(async move {
                    let tools = match timeout(per_child, child.request("tools/list", json!({}))).await
                    {
                        Ok(Ok(Ok(result))) => Some(
                            result
                                .get("tools")
                                .and_then(Value::as_array)
                                .cloned()
                                .unwrap_or_default(),
                        ),
                        Ok(Ok(Err(err))) => {
                            tracing::warn!(
                                "child '{}' failed tools/list: {err}; skipping",
                                child.key()
                            );
                            None
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("child '{}' unreachable for tools/list: {e}", child.key());
                            None
                        }
                        Err(_) => {
                            tracing::warn!(
                                "child '{}' timed out on tools/list; skipping",
                                child.key()
                            );
                            None
                        }
                    };
                    let _ = tx.send((slot, tools)).await;
                });
            }
            drop(tx);

            let mut per_slot: Vec<Option<Vec<Value>>> = vec![None; total];
            while let Some((slot, tools)) = rx.recv().await {
                per_slot[slot] = tools;
            }

            let contributions: Vec<(usize, String, Option<Vec<Value>>)> = children
                .iter()
                .zip(per_slot)
                .map(|(child, tools)| (child.index(), child.key().to_string(), tools))
                .collect();

            let mut merged = {
                let mut st = state.lock().await;
                merge_catalogs(contributions, &mut st.tool_to_child)
            };
            normalize_tools(&mut merged);

            state.lock().await.parent_ctx.remove(&id);
            let _ = out_tx
                .send(rpc::make_result_response(id, json!({"tools": merged})))
                .await;
        });
    }

    /// Route a `tools/call` to the owning child.
    async fn handle_tools_call(
        &self,
        id: Value,
        params: Value,
        msg: Value,
        children: &[Arc<ChildClient>],
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let target = {
            let st = state.lock().await;
            st.tool_to_child.get(&name).cloned()
        };

        let reachable = target.and_then(|(idx, original)| {
            children
                .get(idx)
                .filter(|c| c.is_alive())
                .map(|c| (Arc::clone(c), original))
        });

        let Some((child, original)) = reachable else {
            state.lock().await.parent_ctx.remove(&id);
            let _ = out_tx
                .send(rpc::make_error_response_from(id, tool_not_found(&name)))
                .await;
            return;
        };

        state
            .lock()
            .await
            .parent_to_child
            .insert(id.clone(), child.index());

        let mut forwarded = msg;
        if let Some(p) = forwarded.get_mut("params").and_then(Value::as_object_mut) {
            p.insert("name".to_string(), Value::String(original));
        }

        if let Err(e) = child.send(&forwarded).await {
            let mut st = state.lock().await;
            st.parent_to_child.remove(&id);
            st.parent_ctx.remove(&id);
            drop(st);
            let ctx = ErrorContext::for_tool_call(&name, child.key());
            let raw = request_failure_value(&e);
            let _ = out_tx
                .send(rpc::make_error_response_from(
                    id,
                    normalize_error(&raw, &ctx, self.options.error_passthrough),
                ))
                .await;
        }
    }

    /// Forward an unrecognized method to the first live child, or reply
    /// `-32601` when there is none.
    async fn forward_unknown_method(
        &self,
        id: Value,
        method: &str,
        msg: Value,
        children: &[Arc<ChildClient>],
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        let Some(child) = children.iter().find(|c| c.is_alive()) else {
            state.lock().await.parent_ctx.remove(&id);
            let error = json!({
                "code": ERR_METHOD_NOT_FOUND,
                "message": format!("Method not found: {method}"),
            });
            let _ = out_tx
                .send(rpc::make_error_response_from(id, error))
                .await;
            return;
        };

        tracing::debug!("forwarding unknown method '{method}' to child '{}'", child.key());
        state
            .lock()
            .await
            .parent_to_child
            .insert(id.clone(), child.index());

        if let Err(e) = child.send(&msg).await {
            let mut st = state.lock().await;
            st.parent_to_child.remove(&id);
            st.parent_ctx.remove(&id);
            drop(st);
            let ctx = ErrorContext {
                method: Some(method.to_string()),
                server_name: Some(child.key().to_string()),
                ..Default::default()
            };
            let raw = request_failure_value(&e);
            let _ = out_tx
                .send(rpc::make_error_response_from(
                    id,
                    normalize_error(&raw, &ctx, self.options.error_passthrough),
                ))
                .await;
        }
    }

    /// Dispatch one message surfaced by a child's reader task.
    async fn handle_child_message(
        &self,
        child_idx: usize,
        msg: Value,
        children: &[Arc<ChildClient>],
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        match rpc::classify(&msg) {
            MessageKind::Response => {
                let id = msg.get("id").cloned().unwrap_or(Value::Null);
                let (routed, ctx) = {
                    let mut st = state.lock().await;
                    let owner = st.parent_to_child.get(&id).copied();
                    match owner {
                        Some(owner) if owner == child_idx => {
                            st.parent_to_child.remove(&id);
                            let ctx = st.parent_ctx.remove(&id);
                            (true, ctx)
                        }
                        _ => (false, None),
                    }
                };
                if !routed {
                    tracing::debug!("ignoring unmatched child response (id {id})");
                    return;
                }

                let error = msg.get("error").cloned();
                let reply = match error {
                    Some(error) => {
                        let server = children.get(child_idx).map(|c| c.key().to_string());
                        let ectx = error_context(ctx.as_ref(), server.as_deref());
                        rpc::make_error_response_from(
                            id,
                            normalize_error(&error, &ectx, self.options.error_passthrough),
                        )
                    }
                    None => msg,
                };
                let _ = out_tx.send(reply).await;
            }
            MessageKind::Notification => {
                let _ = out_tx.send(msg).await;
            }
            MessageKind::Request => {
                // Child-initiated request (e.g. elicitation): forwarded
                // verbatim; the parent's reply is not correlated back.
                let _ = out_tx.send(msg).await;
            }
            MessageKind::Other => {
                tracing::debug!("dropping unclassifiable child message");
            }
        }
    }

    /// Answer every forwarded request routed at a child that just died.
    async fn fail_routed_requests(
        &self,
        child_idx: usize,
        child_key: &str,
        state: &Arc<Mutex<Routing>>,
        out_tx: &mpsc::Sender<Value>,
    ) {
        let stranded: Vec<(Value, Option<ReqCtx>)> = {
            let mut st = state.lock().await;
            let ids: Vec<Value> = st
                .parent_to_child
                .iter()
                .filter(|&(_, &owner)| owner == child_idx)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .map(|id| {
                    st.parent_to_child.remove(&id);
                    let ctx = st.parent_ctx.remove(&id);
                    (id, ctx)
                })
                .collect()
        };

        for (id, ctx) in stranded {
            let raw = json!({
                "code": ERR_SERVER,
                "message": format!("MCP server '{child_key}' exited before responding"),
                "data": {"kind": "server_error"}
            });
            let ectx = error_context(ctx.as_ref(), Some(child_key));
            let _ = out_tx
                .send(rpc::make_error_response_from(
                    id,
                    normalize_error(&raw, &ectx, self.options.error_passthrough),
                ))
                .await;
        }
    }
}

/// Snapshot of the children that still have an open stream.
fn live_children(children: &[Arc<ChildClient>]) -> Vec<Arc<ChildClient>> {
    children
        .iter()
        .filter(|c| c.is_alive())
        .map(Arc::clone)
        .collect()
}

/// Merge per-child catalogs into one namespace, rebuilding the routing table.
///
/// `contributions` is ordered like the child list; `None` marks a child that
/// errored or timed out and contributes nothing. Tools without a `name` pass
/// through unchanged; the first publisher of a prefixed name wins.
fn merge_catalogs(
    contributions: Vec<(usize, String, Option<Vec<Value>>)>,
    tool_to_child: &mut HashMap<String, (usize, String)>,
) -> Vec<Value> {
    tool_to_child.clear();
    let mut merged = Vec::new();
    for (child_idx, key, tools) in contributions {
        let Some(tools) = tools else {
            continue;
        };
        for mut tool in tools {
            let Some(original) = tool.get("name").and_then(Value::as_str).map(String::from)
            else {
                merged.push(tool);
                continue;
            };
            let published = format!("{key}__{original}");
            if tool_to_child.contains_key(&published) {
                tracing::warn!("dropping duplicate tool '{published}'");
                continue;
            }
            tool_to_child.insert(published.clone(), (child_idx, original));
            tool["name"] = Value::String(published);
            merged.push(tool);
        }
    }
    merged
}

/// Coerce a child's `initialize` result into the advertised shape.
fn coerce_initialize_result(result: Value, requested_version: Option<&str>) -> Value {
    let Value::Object(mut obj) = result else {
        return minimal_initialize_result(requested_version);
    };

    if !obj.get("protocolVersion").is_some_and(Value::is_string) {
        obj.insert(
            "protocolVersion".to_string(),
            json!(requested_version.unwrap_or(FALLBACK_PROTOCOL_VERSION)),
        );
    }

    let caps = obj
        .entry("capabilities".to_string())
        .or_insert_with(|| json!({}));
    if let Some(caps) = caps.as_object_mut() {
        caps.entry("tools".to_string())
            .or_insert_with(|| json!({"listChanged": false}));
    }

    if !obj.get("serverInfo").is_some_and(Value::is_object) {
        obj.insert(
            "serverInfo".to_string(),
            json!({"version": env!("CARGO_PKG_VERSION")}),
        );
    }
    if let Some(info) = obj.get_mut("serverInfo").and_then(Value::as_object_mut) {
        info.insert("name".to_string(), json!("mcp"));
    }

    Value::Object(obj)
}

/// The synthesized `initialize` result used for timeouts and empty rosters.
fn minimal_initialize_result(requested_version: Option<&str>) -> Value {
    json!({
        "protocolVersion": requested_version.unwrap_or(FALLBACK_PROTOCOL_VERSION),
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": "mcp", "version": env!("CARGO_PKG_VERSION")},
    })
}

/// Pre-normalized envelope for a call to a name absent from the routing table.
fn tool_not_found(name: &str) -> Value {
    json!({
        "code": ERR_METHOD_NOT_FOUND,
        "message": format!("Tool not found: {name}"),
        "data": {
            "kind": "server_error",
            "retryable": false,
            "original": Value::Null,
            "toolName": name,
        }
    })
}

/// Raw error value for a spawn failure, in the shape the normalizer expects.
fn spawn_failure_value(e: &WrapperError) -> Value {
    match e {
        WrapperError::Spawn { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            json!({"code": "ENOENT", "message": e.to_string()})
        }
        _ => json!({"code": ERR_SERVER, "message": e.to_string()}),
    }
}

/// Raw error value for a request that failed inside the wrapper.
fn request_failure_value(e: &WrapperError) -> Value {
    json!({"code": ERR_SERVER, "message": e.to_string()})
}

/// Build normalizer context from a retired request's `(method, params)`.
fn error_context(ctx: Option<&ReqCtx>, server_name: Option<&str>) -> ErrorContext {
    let method = ctx.map(|c| c.method.clone());
    let tool_name = ctx
        .filter(|c| c.method == "tools/call")
        .and_then(|c| c.params.get("name"))
        .and_then(Value::as_str)
        .map(String::from);
    ErrorContext {
        method,
        tool_name,
        server_name: server_name.map(String::from),
    }
}
