/// Core Server Framework Module
///
/// This module contains the protocol engine and its transports:
/// - envelope.rs: JSON-RPC request/response envelopes
/// - params.rs: per-call handler context and typed argument binding
/// - registry.rs: tool, resource and prompt registration
/// - dispatcher.rs: method routing and error mapping
/// - session.rs: session lifecycle and SSE event sinks
/// - origin.rs: Origin header policy
/// - server.rs: HTTP transport (Actix Web)
/// - stdio.rs: line-delimited STDIO transport
/// - config.rs: environment-driven configuration
/// - error.rs: error types shared by the above

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod origin;
pub mod params;
pub mod registry;
pub mod server;
pub mod session;
pub mod stdio;
