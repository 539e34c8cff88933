//! CLI argument types for codex-mcp-wrapper.

use clap::Parser;
use std::path::PathBuf;

/// Aggregating MCP proxy over stdio.
///
/// Without arguments, child servers come from a discovered `.mcp.json`
/// (see `CODEX_MCP_WRAPPER_CONFIG`). With a trailing `-- <command> [args...]`,
/// that single command is the only child and no config file is consulted.
#[derive(Parser, Debug)]
#[command(name = "codex-mcp-wrapper", version, about)]
pub struct Cli {
    /// Path to the config file (overrides discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Single child command, after `--`
    #[arg(last = true, value_name = "COMMAND")]
    pub child_command: Vec<String>,
}
