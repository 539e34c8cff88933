//! Scripted MCP server for integration testing.
//!
//! Reads newline-delimited JSON from stdin and writes newline-delimited JSON
//! responses to stdout. Behavior is configured through environment variables
//! so one binary can play every child the proxy tests need:
//!
//! - `TOOL_SERVER_NAME` — `serverInfo.name` (default `echo-tool-server`)
//! - `TOOL_SERVER_TOOLS` — comma-separated tool names to advertise
//!   (default `echo`)
//! - `TOOL_SERVER_INT_SCHEMA=1` — advertise an `integer`-typed property in
//!   each tool's `inputSchema`
//! - `TOOL_SERVER_HANG_INITIALIZE=1` — never answer `initialize`
//! - `TOOL_SERVER_HANG_TOOLS_LIST=1` — never answer `tools/list`
//!
//! # Special tools
//!
//! - `crash` — the process exits with code 42 instead of responding
//! - `fail` — responds with a JSON-RPC error carrying
//!   `data.kind = "tool_error"`
//! - anything else — echoes the received tool name and arguments back in
//!   `structuredContent`

use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};

fn env_flag(name: &str) -> bool {
    std::env::var(name).as_deref() == Ok("1")
}

fn main() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        handle_message(&msg, &mut writer);
    }
}

fn handle_message(msg: &Value, writer: &mut impl Write) {
    let method = msg.get("method").and_then(|v| v.as_str());
    let id = msg.get("id").cloned();

    match method {
        Some("initialize") => {
            if env_flag("TOOL_SERVER_HANG_INITIALIZE") {
                return;
            }
            let name = std::env::var("TOOL_SERVER_NAME")
                .unwrap_or_else(|_| "echo-tool-server".to_string());
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {
                        "tools": { "listChanged": true }
                    },
                    "serverInfo": {
                        "name": name,
                        "version": "0.1.0"
                    }
                }
            });
            write_msg(writer, &resp);
        }

        Some("tools/list") => {
            if env_flag("TOOL_SERVER_HANG_TOOLS_LIST") {
                return;
            }
            let names = std::env::var("TOOL_SERVER_TOOLS")
                .unwrap_or_else(|_| "echo".to_string());
            let schema = if env_flag("TOOL_SERVER_INT_SCHEMA") {
                json!({
                    "type": "object",
                    "properties": { "n": { "type": "integer" } }
                })
            } else {
                json!({
                    "type": "object",
                    "properties": { "message": { "type": "string" } }
                })
            };
            let tools: Vec<Value> = names
                .split(',')
                .filter(|n| !n.is_empty())
                .map(|n| {
                    json!({
                        "name": n.trim(),
                        "description": format!("test tool {n}"),
                        "inputSchema": schema.clone()
                    })
                })
                .collect();
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tools }
            });
            write_msg(writer, &resp);
        }

        Some("tools/call") => {
            let tool_name = msg
                .pointer("/params/name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let arguments = msg
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or(json!({}));

            if tool_name == "crash" {
                std::process::exit(42);
            }

            if tool_name == "fail" {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32050,
                        "message": "tool exploded",
                        "data": { "kind": "tool_error", "retryable": true }
                    }
                });
                write_msg(writer, &resp);
                return;
            }

            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{
                        "type": "text",
                        "text": format!("echo from {tool_name}")
                    }],
                    "structuredContent": {
                        "receivedName": tool_name,
                        "receivedArguments": arguments
                    }
                }
            });
            write_msg(writer, &resp);
        }

        Some("ping") => {
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            });
            write_msg(writer, &resp);
        }

        Some("notifications/initialized") | Some("notifications/cancelled") => {}

        Some(unknown) => {
            if let Some(req_id) = id {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": req_id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {unknown}")
                    }
                });
                write_msg(writer, &resp);
            }
        }

        None => {}
    }
}

fn write_msg(writer: &mut impl Write, msg: &Value) {
    let s = serde_json::to_string(msg).expect("serialize JSON");
    writeln!(writer, "{s}").expect("write to stdout");
    writer.flush().expect("flush stdout");
}
