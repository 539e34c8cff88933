//! codex-mcp-wrapper — aggregating MCP proxy over stdio.

use clap::Parser;

use codex_mcp_wrapper::aggregator::Aggregator;
use codex_mcp_wrapper::cli::Cli;
use codex_mcp_wrapper::config::{WrapperOptions, resolve_children};
use codex_mcp_wrapper::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    let options = WrapperOptions::from_env();
    let specs = resolve_children(cli.config.as_deref(), &cli.child_command)?;
    tracing::debug!("resolved {} child server(s)", specs.len());

    let aggregator = Aggregator::new(specs, options);
    let code = aggregator
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    std::process::exit(code);
}
