/// Echo Tool Implementation
///
/// Returns the `message` argument, optionally preceded by a caller-supplied
/// `prefix`. Useful as a connectivity check from MCP clients.

use serde_json::{Value, json};

use crate::core::error::HandlerError;
use crate::core::params::ToolContext;
use crate::core::registry::{OperationDefinition, OperationRegistry, tool_fn};

/// Register the echo tool with the registry.
pub fn register(registry: &OperationRegistry) {
    let definition = OperationDefinition::new("echo", "Echo a message back to the client.")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                },
                "prefix": {
                    "type": "string",
                    "description": "Optional text prepended to the message"
                }
            },
            "required": ["message"]
        }));

    registry.register_tool(definition, tool_fn(echo));
}

async fn echo(ctx: ToolContext) -> Result<Value, HandlerError> {
    let message: String = ctx.param("message")?;
    let prefix: String = ctx.optional_param("prefix", String::new())?;

    let result = if prefix.is_empty() {
        message
    } else {
        // Pre-allocate with known capacity
        let mut result = String::with_capacity(prefix.len() + message.len());
        result.push_str(&prefix);
        result.push_str(&message);
        result
    };

    Ok(json!({ "result": result }))
}
