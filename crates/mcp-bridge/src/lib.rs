//! MCP Bridge
//!
//! A transport-switching proxy and aggregating bridge for the Model Context
//! Protocol. Two shapes share one core: a client-side proxy that exposes a
//! local stdio MCP server tunnelling to a remote SSE or streamable-HTTP
//! endpoint, and a server-side bridge that spawns stdio MCP servers as
//! children and fronts them over HTTP, optionally unioned behind a single
//! namespaced surface.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_bridge::bridge::Bridge;
//! use mcp_bridge::config::{BridgeSettings, ServerConfig};
//! use mcp_bridge::backend::RuntimeOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = ServerConfig::from_command_line("fetch", "uvx mcp-server-fetch")?;
//!     let bridge = Bridge::new(vec![server], BridgeSettings::default(), RuntimeOptions::default());
//!     bridge.start();
//!     mcp_bridge::server::run(Arc::clone(&bridge), mcp_bridge::server::ServeOptions::default())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::Bridge;
pub use config::{BridgeConfig, BridgeSettings, ServerConfig};
pub use error::{BridgeError, ConfigError, SessionError, TransportError};
pub use session::ClientSession;
