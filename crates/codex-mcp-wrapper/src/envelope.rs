//! Error normalization.
//!
//! Child failures are heterogeneous: JSON-RPC error objects, spawn failures,
//! write failures. Everything routed back to the parent goes through
//! [`normalize_error`], which produces one envelope shape:
//!
//! ```json
//! {"code": <number>, "message": <non-empty line>,
//!  "data": {"kind": "...", "retryable": <bool>, "original": <raw>,
//!           "toolName": "...", "serverName": "..."}}
//! ```
//!
//! `data.kind` is one of `spawn_error`, `server_error`, `tool_error`.

use serde_json::{Map, Value, json};

use crate::rpc::{ERR_INTERNAL, ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND, ERR_SERVER, ERR_SPAWN, SERVER_RANGE};

/// Context available at the failure site, used to shape the message and the
/// envelope's `toolName`/`serverName` fields.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub method: Option<String>,
    pub tool_name: Option<String>,
    pub server_name: Option<String>,
}

impl ErrorContext {
    pub fn for_tool_call(tool_name: &str, server_name: &str) -> Self {
        Self {
            method: Some("tools/call".to_string()),
            tool_name: Some(tool_name.to_string()),
            server_name: Some(server_name.to_string()),
        }
    }
}

/// Normalize a raw child/runtime error into the single envelope shape.
///
/// With `passthrough` set the raw error is returned unchanged (the
/// `WRAPPER_ERROR_PASSTHROUGH` escape hatch).
pub fn normalize_error(original: &Value, ctx: &ErrorContext, passthrough: bool) -> Value {
    if passthrough {
        return original.clone();
    }

    let mut code = ERR_SERVER;
    let mut message: Option<String> = original
        .get("message")
        .and_then(Value::as_str)
        .map(String::from);
    let mut kind = "server_error";
    let mut retryable = false;

    let tool_suffix = ctx
        .tool_name
        .as_deref()
        .map(|t| format!(" for tool '{t}'"))
        .unwrap_or_default();

    if original.get("code").and_then(Value::as_str) == Some("ENOENT") {
        code = ERR_SPAWN;
        kind = "spawn_error";
        message = Some(
            "Spawn error (ENOENT): command not found. Check PATH or use 'npx tsx <path-to-index.ts>'."
                .to_string(),
        );
    } else if let Some(n) = original.get("code").and_then(Value::as_i64) {
        code = n;
        match n {
            ERR_METHOD_NOT_FOUND => {
                message = Some(format!("Method not found{tool_suffix}"));
            }
            ERR_INVALID_PARAMS => {
                message = Some(format!("Invalid params{tool_suffix}"));
            }
            ERR_INTERNAL => {
                message = Some(format!("Internal error{tool_suffix}"));
                retryable = true;
            }
            n if (SERVER_RANGE.0..=SERVER_RANGE.1).contains(&n) => {
                retryable = data_bool(original, "retryable");
            }
            _ => {}
        }
    }

    if original
        .pointer("/data/kind")
        .and_then(Value::as_str)
        == Some("tool_error")
    {
        kind = "tool_error";
        retryable = data_bool(original, "retryable");
    }

    let message = match message {
        Some(m) if !m.trim().is_empty() && m != "[object Object]" => single_line(&m),
        // Present but degenerate (empty, stringified object, non-string).
        Some(_) => "Tool/server error".to_string(),
        None if original.get("message").is_some() => "Tool/server error".to_string(),
        None => "Server error".to_string(),
    };

    let mut data = Map::new();
    data.insert("kind".to_string(), json!(kind));
    data.insert("retryable".to_string(), json!(retryable));
    data.insert("original".to_string(), original.clone());
    if let Some(t) = &ctx.tool_name {
        data.insert("toolName".to_string(), json!(t));
    }
    if let Some(s) = &ctx.server_name {
        data.insert("serverName".to_string(), json!(s));
    }

    json!({
        "code": code,
        "message": message,
        "data": Value::Object(data),
    })
}

/// Coerce `original.data.<key>` to a boolean, JavaScript style.
fn data_bool(original: &Value, key: &str) -> bool {
    match original.pointer(&format!("/data/{key}")) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(_) => true,
    }
}

fn single_line(message: &str) -> String {
    message
        .replace(['\r', '\n'], " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_ctx() -> ErrorContext {
        ErrorContext::default()
    }

    #[test]
    fn test_passthrough_returns_raw() {
        let raw = json!({"code": -32700, "message": "parse", "weird": true});
        let out = normalize_error(&raw, &plain_ctx(), true);
        assert_eq!(out, raw);
    }

    #[test]
    fn test_enoent_spawn_error() {
        let raw = json!({"code": "ENOENT", "message": "spawn failed"});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["code"], ERR_SPAWN);
        assert_eq!(out["data"]["kind"], "spawn_error");
        assert_eq!(out["data"]["retryable"], false);
        assert!(
            out["message"]
                .as_str()
                .unwrap()
                .starts_with("Spawn error (ENOENT)")
        );
    }

    #[test]
    fn test_method_not_found_with_tool_suffix() {
        let raw = json!({"code": -32601, "message": "?"});
        let ctx = ErrorContext::for_tool_call("serena__list_dir", "serena");
        let out = normalize_error(&raw, &ctx, false);
        assert_eq!(out["code"], -32601);
        assert_eq!(
            out["message"],
            "Method not found for tool 'serena__list_dir'"
        );
        assert_eq!(out["data"]["kind"], "server_error");
        assert_eq!(out["data"]["retryable"], false);
        assert_eq!(out["data"]["toolName"], "serena__list_dir");
        assert_eq!(out["data"]["serverName"], "serena");
    }

    #[test]
    fn test_method_not_found_without_tool() {
        let raw = json!({"code": -32601});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["message"], "Method not found");
        assert!(out["data"].get("toolName").is_none());
    }

    #[test]
    fn test_invalid_params() {
        let raw = json!({"code": -32602, "message": "bad"});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["message"], "Invalid params");
        assert_eq!(out["data"]["retryable"], false);
    }

    #[test]
    fn test_internal_error_is_retryable() {
        let raw = json!({"code": -32603});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["message"], "Internal error");
        assert_eq!(out["data"]["retryable"], true);
    }

    #[test]
    fn test_server_range_retryable_coercion() {
        let raw = json!({"code": -32050, "message": "busy", "data": {"retryable": true}});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["code"], -32050);
        assert_eq!(out["message"], "busy");
        assert_eq!(out["data"]["retryable"], true);

        let raw = json!({"code": -32050, "message": "busy", "data": {"retryable": "yes"}});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["data"]["retryable"], true);

        let raw = json!({"code": -32050, "message": "busy"});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["data"]["retryable"], false);
    }

    #[test]
    fn test_tool_error_kind_override() {
        let raw = json!({
            "code": -32050,
            "message": "tool blew up",
            "data": {"kind": "tool_error", "retryable": true}
        });
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["data"]["kind"], "tool_error");
        assert_eq!(out["data"]["retryable"], true);
    }

    #[test]
    fn test_degenerate_messages_replaced() {
        for raw in [
            json!({"code": -32000, "message": ""}),
            json!({"code": -32000, "message": "[object Object]"}),
            json!({"message": {"nested": true}}),
        ] {
            let out = normalize_error(&raw, &plain_ctx(), false);
            assert_eq!(out["message"], "Tool/server error", "input {raw}");
        }
        // An absent message falls back to the plain default instead.
        let out = normalize_error(&json!({"code": -32000}), &plain_ctx(), false);
        assert_eq!(out["message"], "Server error");
    }

    #[test]
    fn test_defaults_for_unrecognized_error() {
        let raw = json!({"something": "odd"});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["code"], ERR_SERVER);
        assert_eq!(out["message"], "Server error");
        assert_eq!(out["data"]["kind"], "server_error");
        assert_eq!(out["data"]["retryable"], false);
    }

    #[test]
    fn test_original_preserved_verbatim() {
        let raw = json!({"code": -32603, "message": "x", "data": {"trace": [1, 2]}});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["data"]["original"], raw);
    }

    #[test]
    fn test_message_flattened_to_single_line() {
        let raw = json!({"code": -32050, "message": "line one\nline two"});
        let out = normalize_error(&raw, &plain_ctx(), false);
        assert_eq!(out["message"], "line one line two");
    }

    #[test]
    fn test_envelope_shape_property() {
        // Property 7: code numeric, message non-empty single line, kind in
        // the taxonomy.
        let inputs = [
            json!({"code": "ENOENT"}),
            json!({"code": -32601}),
            json!({"code": -32602, "message": "x"}),
            json!({"code": -32603}),
            json!({"code": -32010, "data": {"retryable": 1}}),
            json!({"code": 99, "message": "custom"}),
            json!({"data": {"kind": "tool_error"}}),
            json!(null),
            json!("boom"),
        ];
        for raw in inputs {
            let out = normalize_error(&raw, &plain_ctx(), false);
            assert!(out["code"].is_i64(), "input {raw}");
            let msg = out["message"].as_str().unwrap();
            assert!(!msg.is_empty() && !msg.contains('\n'), "input {raw}");
            let kind = out["data"]["kind"].as_str().unwrap();
            assert!(
                ["spawn_error", "server_error", "tool_error"].contains(&kind),
                "input {raw}"
            );
        }
    }
}
