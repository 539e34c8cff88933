//! codex-mcp-wrapper library crate.
//!
//! An aggregating proxy for the Model Context Protocol: it presents itself to
//! the parent client as a single MCP server on stdin/stdout while fanning out
//! to a configured set of child servers launched as subprocesses. Child tool
//! catalogs are merged under collision-free `<key>__<name>` names, schemas
//! are normalized for strict consumers, and child failures are shaped into a
//! single error envelope.
//!
//! Exposed as a library for integration testing; the `codex-mcp-wrapper`
//! binary is a thin entry point over [`aggregator::Aggregator`].

pub mod aggregator;
pub mod child;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod logging;
pub mod rpc;
pub mod schema;
pub mod transport;

#[doc(inline)]
pub use transport::{MockTransport, MockTransportHandle, RawChildIo};
