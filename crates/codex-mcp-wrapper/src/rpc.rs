//! JSON-RPC 2.0 message helpers.
//!
//! All wire traffic is handled as raw [`serde_json::Value`]; this module
//! provides the constructors, the classification used by both dispatch loops,
//! and the error-code constants.

use serde_json::{Value, json};

/// JSON-RPC error code: generic server error (also the default envelope code).
pub const ERR_SERVER: i64 = -32000;

/// JSON-RPC error code: child process could not be spawned.
pub const ERR_SPAWN: i64 = -32001;

/// JSON-RPC error code: method not found.
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code: invalid params.
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// JSON-RPC error code: internal error.
pub const ERR_INTERNAL: i64 = -32603;

/// Inclusive bounds of the implementation-defined server error range.
pub const SERVER_RANGE: (i64, i64) = (-32099, -32000);

/// The shape of a decoded message, as far as routing cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `method` and a non-null `id`.
    Request,
    /// Has `method` and no `id`.
    Notification,
    /// Has a non-null `id` and `result` or `error`, no `method`.
    Response,
    /// Anything else; dropped by both loops.
    Other,
}

/// Classify a decoded JSON-RPC message.
pub fn classify(msg: &Value) -> MessageKind {
    let has_id = msg.get("id").is_some_and(|id| !id.is_null());
    let has_method = msg.get("method").is_some();
    let has_payload = msg.get("result").is_some() || msg.get("error").is_some();

    match (has_method, has_id) {
        (true, true) => MessageKind::Request,
        (true, false) => MessageKind::Notification,
        (false, true) if has_payload => MessageKind::Response,
        _ => MessageKind::Other,
    }
}

/// Build a request with an explicit id.
pub fn make_request(id: Value, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification (no id).
pub fn make_notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Build a successful response.
pub fn make_result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build an error response from a raw error object.
pub fn make_error_response_from(id: Value, error: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

/// Build an error response from code/message/data parts.
pub fn make_error_response(id: Value, code: i64, message: &str, data: Value) -> Value {
    make_error_response_from(
        id,
        json!({
            "code": code,
            "message": message,
            "data": data,
        }),
    )
}
