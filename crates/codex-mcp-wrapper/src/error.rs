//! Error types for the wrapper.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the wrapper's own machinery.
///
/// Child-side JSON-RPC errors are not represented here; they travel as raw
/// `serde_json::Value` error objects and are shaped by [`crate::envelope`]
/// before reaching the parent.
#[derive(Error, Debug)]
pub enum WrapperError {
    /// No configuration file yielded at least one child specification.
    #[error("No MCP server configuration found (searched {searched} locations)")]
    NoConfig { searched: usize },

    /// An explicitly named configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration document parsed but matched none of the recognized shapes.
    #[error("Config {path} does not describe any MCP servers")]
    ConfigShape { path: PathBuf },

    /// A child subprocess could not be started.
    #[error("Failed to spawn child `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// Writing to a child's stdin failed (broken pipe, child gone).
    #[error("Write to child `{child}` failed: {source}")]
    ChildWrite {
        child: String,
        source: std::io::Error,
    },

    /// The child exited while requests were still in flight.
    #[error("Child `{child}` exited with requests in flight")]
    ChildGone { child: String },
}

/// Result alias used throughout the crate.
pub type Result<T> = anyhow::Result<T>;
