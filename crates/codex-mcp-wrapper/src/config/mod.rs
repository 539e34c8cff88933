//! Configuration for the wrapper.
//!
//! [`resolve_children`](resolve::resolve_children) is the entry point: it
//! turns the invocation (passthrough `--` command or a discovered `.mcp.json`)
//! into the list of [`ChildSpec`]s started at boot. [`WrapperOptions`] carries
//! the recognized environment options.

mod resolve;
mod types;

pub use resolve::{resolve_children, ENV_CONFIG_PATH, ENV_SERVER_NAME};
pub use types::{ChildSpec, WrapperOptions};
