//! Logging initialization for the wrapper binary.
//!
//! All diagnostics go to stderr; stdout carries the JSON-RPC protocol and
//! must never receive log output.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

/// Truthiness rule shared by `DEBUG` and the other boolean env options:
/// set and not one of `""`, `"0"`, `"false"`, `"no"` (case-insensitive).
pub fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim().to_ascii_lowercase();
            !(v.is_empty() || v == "0" || v == "false" || v == "no")
        }
        Err(_) => false,
    }
}

fn parse_level() -> tracing::Level {
    if env_truthy("DEBUG") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    }
}

/// Initialize process-level tracing output on stderr.
///
/// Verbosity is controlled by the `DEBUG` environment variable. Safe to call
/// multiple times; only the first call installs the subscriber. Best-effort
/// and never returns an error.
pub fn init() {
    if INIT.get().is_some() {
        return;
    }
    let level = parse_level();
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}
