/// Tools Module
///
/// This module contains all MCP tool implementations. Each tool is implemented
/// as a separate module that exports a `register` function to add the tool to
/// the registry during server initialization.

pub mod calc;
pub mod echo;

use crate::core::registry::OperationRegistry;

/// Register every built-in tool.
pub fn register(registry: &OperationRegistry) {
    echo::register(registry);
    calc::register(registry);
}
