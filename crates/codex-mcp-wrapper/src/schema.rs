//! Tool-catalog schema normalization.
//!
//! Rewrites the merged `tools/list` catalog into a shape strict downstream
//! consumers accept: `integer` types become `number`, union `type` arrays
//! collapse to a single string, untyped nodes get an inferred type, and
//! malformed `required` lists are repaired. The pass is idempotent.
//!
//! `serde_json::Value` trees are acyclic by construction, so the walk needs
//! no identity set; a depth guard bounds pathological nesting instead.

use serde_json::{Map, Value};

/// Recursion limit for the schema walk.
const MAX_DEPTH: usize = 128;

/// Keys holding a map of subschemas.
const MAP_CONTAINERS: [&str; 4] = ["properties", "patternProperties", "dependentSchemas", "$defs"];

/// Keys holding a list of subschemas.
const LIST_CONTAINERS: [&str; 3] = ["anyOf", "oneOf", "allOf"];

/// Collapse preference when nothing structural decides a union.
const TYPE_PRIORITY: [&str; 5] = ["object", "array", "string", "number", "boolean"];

/// Normalize every tool object in a merged catalog.
pub fn normalize_tools(tools: &mut [Value]) {
    for tool in tools {
        normalize_tool(tool);
    }
}

/// Normalize one tool object: alias schema fields, then walk both schemas.
pub fn normalize_tool(tool: &mut Value) {
    let Some(obj) = tool.as_object_mut() else {
        return;
    };

    alias_field(obj, "input_schema", "inputSchema");
    alias_field(obj, "output_schema", "outputSchema");
    // Legacy `parameters` moves to `inputSchema` only when no input schema
    // of either spelling is present.
    if !obj.contains_key("inputSchema") {
        if let Some(params) = obj.remove("parameters") {
            obj.insert("inputSchema".to_string(), params);
        }
    }

    if let Some(schema) = obj.get_mut("inputSchema") {
        normalize_schema(schema);
    }
    if let Some(schema) = obj.get_mut("outputSchema") {
        normalize_schema(schema);
    }
}

/// Copy `from` to `to` when `to` is absent.
fn alias_field(obj: &mut Map<String, Value>, from: &str, to: &str) {
    if obj.contains_key(from) && !obj.contains_key(to) {
        if let Some(v) = obj.get(from).cloned() {
            obj.insert(to.to_string(), v);
        }
    }
}

/// Normalize a schema tree in place.
pub fn normalize_schema(schema: &mut Value) {
    walk(schema, 0);
}

fn walk(node: &mut Value, depth: usize) {
    if depth > MAX_DEPTH {
        return;
    }
    let Some(obj) = node.as_object_mut() else {
        return;
    };

    normalize_type(obj);
    sanitize_required(obj);

    for key in MAP_CONTAINERS {
        if let Some(map) = obj.get_mut(key).and_then(Value::as_object_mut) {
            for (_, sub) in map.iter_mut() {
                walk(sub, depth + 1);
            }
        }
    }
    if let Some(map) = obj.get_mut("definitions").and_then(Value::as_object_mut) {
        for (_, sub) in map.iter_mut() {
            walk(sub, depth + 1);
        }
    }
    for key in LIST_CONTAINERS {
        if let Some(list) = obj.get_mut(key).and_then(Value::as_array_mut) {
            for sub in list.iter_mut() {
                walk(sub, depth + 1);
            }
        }
    }
    if let Some(items) = obj.get_mut("items") {
        match items {
            Value::Array(list) => {
                for sub in list.iter_mut() {
                    walk(sub, depth + 1);
                }
            }
            other => walk(other, depth + 1),
        }
    }
    if let Some(ap) = obj.get_mut("additionalProperties") {
        if ap.is_object() {
            walk(ap, depth + 1);
        }
    }
    if let Some(pn) = obj.get_mut("propertyNames") {
        walk(pn, depth + 1);
    }
}

/// Rewrite or infer the node's `type`.
fn normalize_type(obj: &mut Map<String, Value>) {
    enum Rewrite {
        SetNumber,
        Collapse(Vec<Value>),
        Infer,
        Keep,
    }

    let rewrite = match obj.get("type") {
        Some(Value::String(s)) if s == "integer" => Rewrite::SetNumber,
        Some(Value::Array(members)) => Rewrite::Collapse(members.clone()),
        Some(_) => Rewrite::Keep,
        None if obj.contains_key("$ref") => Rewrite::Keep,
        None => Rewrite::Infer,
    };

    match rewrite {
        Rewrite::SetNumber => {
            obj.insert("type".to_string(), Value::String("number".to_string()));
        }
        Rewrite::Collapse(members) => {
            let collapsed = collapse_union(&members, obj);
            obj.insert("type".to_string(), Value::String(collapsed));
        }
        Rewrite::Infer => {
            let inferred = infer_type(obj);
            obj.insert("type".to_string(), Value::String(inferred));
        }
        Rewrite::Keep => {}
    }
}

/// Collapse a union `type` array to a single type string.
fn collapse_union(members: &[Value], obj: &Map<String, Value>) -> String {
    let mut candidates: Vec<String> = Vec::new();
    for m in members {
        let Some(s) = m.as_str() else {
            continue;
        };
        if s.is_empty() || s == "null" || s == "undefined" {
            continue;
        }
        let s = if s == "integer" { "number" } else { s };
        if !candidates.iter().any(|c| c == s) {
            candidates.push(s.to_string());
        }
    }

    match candidates.len() {
        0 => return "string".to_string(),
        1 => return candidates.remove(0),
        _ => {}
    }

    // Prefer the candidate the node's own structure points at.
    let has = |t: &str| candidates.iter().any(|c| c == t);
    if obj.get("properties").is_some_and(Value::is_object) && has("object") {
        return "object".to_string();
    }
    if obj.contains_key("items") && has("array") {
        return "array".to_string();
    }
    if let Some(first) = obj
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
    {
        let native = native_type_name(first);
        if has(native) {
            return native.to_string();
        }
    }

    for t in TYPE_PRIORITY {
        if has(t) {
            return t.to_string();
        }
    }
    candidates.remove(0)
}

/// Pick a type for a node that has none (and no `$ref`).
fn infer_type(obj: &Map<String, Value>) -> String {
    if let Some(first) = obj
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
    {
        return native_type_name(first).to_string();
    }
    if obj.contains_key("properties") {
        return "object".to_string();
    }
    if obj.contains_key("items") {
        return "array".to_string();
    }
    "string".to_string()
}

/// The native type name of a JSON value, with `typeof`-style semantics:
/// arrays map to `array`, objects and `null` to `object`.
fn native_type_name(v: &Value) -> &'static str {
    match v {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) | Value::Null => "object",
    }
}

/// Drop a non-array `required`; keep only string entries otherwise.
fn sanitize_required(obj: &mut Map<String, Value>) {
    let malformed = matches!(obj.get("required"), Some(v) if !v.is_array());
    if malformed {
        obj.remove("required");
    } else if let Some(Value::Array(list)) = obj.get_mut("required") {
        list.retain(Value::is_string);
    }
}
