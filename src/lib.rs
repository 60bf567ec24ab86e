//! Capability-negotiated RPC protocol engine
//!
//! This crate implements a bidirectional RPC runtime in the Model Context
//! Protocol family: JSON-RPC 2.0 framing, an initialize/initialized
//! handshake with protocol version and capability negotiation, concurrent
//! request handling with progress and cooperative cancellation, and a
//! transport abstraction that runs the same session logic over a stdio pipe
//! or over HTTP with an event-stream push channel.
//!
//! # Architecture
//!
//! - **[`protocol`]**: message types, the strict wire codec, capability sets
//!   and the error code registry
//! - **[`rpc`]**: the session state machine, correlation table, dispatcher
//!   and progress/cancellation plumbing
//! - **[`transport`]**: stdio, HTTP client and in-memory transports behind
//!   one trait
//! - **[`server`]**: the axum HTTP host (POST ingress, event-stream push,
//!   session tokens)
//! - **[`error`]**: the engine error taxonomy
//!
//! # Protocol Flow
//!
//! ```text
//! Initiator                       Responder
//!   |                               |
//!   |-- initialize ---------------->|
//!   |<------------- capabilities ---|
//!   |-- notifications/initialized ->|
//!   |                               |
//!   |-- tools/call ---------------->|
//!   |<--- notifications/progress ---|
//!   |<------------------ result ----|
//!   |                               |
//!   |-- shutdown ------------------>|
//!   |<----------------------- ok ---|
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley_mcp::config::Config;
//! use parley_mcp::protocol::capabilities::{CapabilitySet, PeerInfo};
//! use parley_mcp::rpc::{Dispatcher, Role, Session, SessionOptions};
//! use parley_mcp::transport::TransportFactory;
//!
//! # async fn example() -> parley_mcp::Result<()> {
//! let dispatcher = Arc::new(Dispatcher::new());
//! let (session, handle) = Session::new(
//!     TransportFactory::http_client("http://127.0.0.1:8900/rpc"),
//!     dispatcher,
//!     SessionOptions {
//!         role: Role::Initiator,
//!         capabilities: CapabilitySet::new().declare("tools"),
//!         info: PeerInfo::new("example-client", "0.1.0"),
//!         config: Config::default(),
//!     },
//! );
//! tokio::spawn(session.run());
//!
//! let negotiated = handle.initialize().await?;
//! println!("agreed on {}", negotiated.protocol_version);
//! let tools = handle.request("tools/list", None).await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod transport;


#[cfg(test)]
mod lifecycle_tests;

pub use error::{Error, Result};
