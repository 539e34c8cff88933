//! Configuration types for the wrapper.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::env_truthy;

/// Default fan-out timeout (`initialize` overall, `tools/list` per child).
const DEFAULT_TIMEOUT_MS: u64 = 4000;

/// Immutable description of one child server.
///
/// Produced by the config loader (or the `--` passthrough arguments) and
/// consumed once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Logical name; used as the tool-prefix key when set.
    #[serde(default)]
    pub name: Option<String>,

    /// Executable path or name resolved via `PATH`.
    pub command: String,

    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlaid on the wrapper's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ChildSpec {
    /// The namespace key under which this child's tools are published.
    ///
    /// Logical name if set, else the basename of the command; lower-cased,
    /// with every run of characters outside `[a-z0-9]` collapsed to a single
    /// `_` and leading/trailing `_` trimmed.
    pub fn key(&self) -> String {
        let raw = match self.name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => Path::new(&self.command)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.command.clone()),
        };
        sanitize_key(&raw)
    }
}

fn sanitize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Recognized environment options (§ external interfaces).
#[derive(Debug, Clone)]
pub struct WrapperOptions {
    /// `DEBUG` truthy: verbose diagnostics on stderr.
    pub debug: bool,
    /// Emit the one-line startup summary on stderr.
    pub summary: bool,
    /// `WRAPPER_ERROR_PASSTHROUGH`: hand child errors through unshaped.
    pub error_passthrough: bool,
    /// Per-child bound on `tools/list` fan-out.
    pub tools_list_timeout: Duration,
    /// Overall bound on `initialize` fan-out.
    pub init_timeout: Duration,
}

impl Default for WrapperOptions {
    fn default() -> Self {
        Self {
            debug: false,
            summary: true,
            error_passthrough: false,
            tools_list_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            init_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl WrapperOptions {
    /// Read the recognized environment variables.
    ///
    /// Unparseable timeout values fall back to the defaults rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let summary = std::env::var("WRAPPER_SUMMARY").as_deref() != Ok("0")
            && std::env::var("WRAPPER_NO_SUMMARY").as_deref() != Ok("1");
        let error_passthrough = matches!(
            std::env::var("WRAPPER_ERROR_PASSTHROUGH").as_deref(),
            Ok("1") | Ok("true")
        );
        Self {
            debug: env_truthy("DEBUG"),
            summary,
            error_passthrough,
            tools_list_timeout: timeout_from_env("WRAPPER_TOOLS_LIST_TIMEOUT_MS"),
            init_timeout: timeout_from_env("WRAPPER_INIT_TIMEOUT_MS"),
        }
    }
}

fn timeout_from_env(name: &str) -> Duration {
    let ms = std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    Duration::from_millis(ms)
}
