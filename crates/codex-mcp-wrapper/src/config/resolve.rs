//! Config discovery and parsing.
//!
//! Resolution order (highest priority first):
//!
//! 1. Passthrough: everything after `--` on the command line is a single
//!    child command; no file is consulted.
//! 2. The `--config` CLI flag.
//! 3. The `CODEX_MCP_WRAPPER_CONFIG` environment variable.
//! 4. `~/.codex/.mcp.json`.
//! 5. `.mcp.json` in the current directory, walking up to the filesystem root.
//!
//! The first readable file that parses and yields at least one server
//! specification wins. Documents are JSON with best-effort leniency: line and
//! block comments and trailing commas are stripped before parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::types::ChildSpec;
use crate::error::{Result, WrapperError};

/// Environment variable overriding the config search path.
pub const ENV_CONFIG_PATH: &str = "CODEX_MCP_WRAPPER_CONFIG";

/// Environment variable restricting startup to a single named server.
pub const ENV_SERVER_NAME: &str = "MCP_WRAPPER_SERVER_NAME";

/// Resolve the child specifications for this invocation.
///
/// `passthrough` is the argument vector after the `--` sentinel; when
/// non-empty it names a single child and short-circuits file discovery.
///
/// # Errors
///
/// Returns [`WrapperError::NoConfig`] when no candidate file yields a server.
pub fn resolve_children(
    explicit: Option<&Path>,
    passthrough: &[String],
) -> Result<Vec<ChildSpec>> {
    if let Some((command, args)) = passthrough.split_first() {
        return Ok(vec![ChildSpec {
            name: None,
            command: command.clone(),
            args: args.to_vec(),
            env: HashMap::new(),
        }]);
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let candidates = candidate_paths(explicit, &cwd, dirs::home_dir().as_deref());
    let searched = candidates.len();

    for path in candidates {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Some(mut specs) = parse_config_text(&text) else {
            tracing::debug!("config {} parsed to no servers, skipping", path.display());
            continue;
        };
        tracing::debug!("using config {} ({} servers)", path.display(), specs.len());
        if let Ok(only) = std::env::var(ENV_SERVER_NAME) {
            if specs.iter().any(|s| s.name.as_deref() == Some(only.as_str())) {
                specs.retain(|s| s.name.as_deref() == Some(only.as_str()));
            }
        }
        return Ok(specs);
    }

    Err(WrapperError::NoConfig { searched }.into())
}

/// The ordered list of candidate config paths.
fn candidate_paths(
    explicit: Option<&Path>,
    cwd: &Path,
    home: Option<&Path>,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        if !p.is_empty() {
            out.push(PathBuf::from(p));
        }
    }
    if let Some(home) = home {
        out.push(home.join(".codex").join(".mcp.json"));
    }
    let mut dir = Some(cwd);
    while let Some(d) = dir {
        out.push(d.join(".mcp.json"));
        dir = d.parent();
    }
    out
}

/// Parse a configuration document into child specs.
///
/// Returns `None` unless the text parses (after comment/trailing-comma
/// stripping) and matches one of the recognized shapes with at least one
/// valid entry. An entry is valid when `command` is a string.
pub fn parse_config_text(text: &str) -> Option<Vec<ChildSpec>> {
    let lenient = strip_trailing_commas(&strip_comments(text));
    let doc: Value = serde_json::from_str(&lenient).ok()?;

    if let Some(obj) = doc.as_object() {
        for section in ["servers", "mcp_servers", "mcpServers"] {
            if let Some(map) = obj.get(section).and_then(Value::as_object) {
                let specs: Vec<ChildSpec> = map
                    .iter()
                    .filter_map(|(name, entry)| spec_from_entry(Some(name.as_str()), entry))
                    .collect();
                if !specs.is_empty() {
                    return Some(specs);
                }
            }
        }
    }

    if let Some(list) = doc.as_array() {
        let specs: Vec<ChildSpec> = list
            .iter()
            .filter_map(|entry| spec_from_entry(None, entry))
            .collect();
        if !specs.is_empty() {
            return Some(specs);
        }
        return None;
    }

    spec_from_entry(None, &doc).map(|s| vec![s])
}

/// Build a [`ChildSpec`] from one entry object, if it is valid.
fn spec_from_entry(name_hint: Option<&str>, entry: &Value) -> Option<ChildSpec> {
    let command = entry.get("command")?.as_str()?.to_string();
    let name = name_hint
        .map(String::from)
        .or_else(|| entry.get("name").and_then(Value::as_str).map(String::from));
    let args = entry
        .get("args")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let env = entry
        .get("env")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Some(ChildSpec {
        name,
        command,
        args,
        env,
    })
}

/// Remove `//` line comments and `/* */` block comments outside strings.
///
/// Works byte-wise: only ASCII segments are ever removed, so the output is
/// valid UTF-8 whenever the input is.
fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            b'"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    if bytes[i] == b'\n' {
                        out.push(b'\n');
                    }
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}

/// Remove commas that directly precede a closing `}` or `]` outside strings.
fn strip_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in bytes.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = false;
            }
            continue;
        }
        match c {
            b'"' => {
                in_string = true;
                out.push(c);
            }
            b',' => {
                let next = bytes[i + 1..].iter().find(|b| !b.is_ascii_whitespace());
                if !matches!(next, Some(b'}') | Some(b']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}
