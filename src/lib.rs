/// MCP Engine
///
/// Protocol engine for the Model Context Protocol: JSON-RPC envelopes, an
/// operation registry, the dispatcher, sessions with SSE streams and the
/// origin policy, plus the STDIO and HTTP transports that drive them.
/// `main.rs` wires these together from environment configuration; embedders
/// can register their own tools, resources and prompts on an
/// `OperationRegistry` and run either transport directly.

pub mod core;
pub mod prompts;
pub mod resources;
pub mod tools;
