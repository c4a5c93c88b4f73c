/// Calculator Tool
///
/// `add`: sums two numbers. Both arguments are required JSON numbers.
/// Two integers add as integers (`2 + 3` is `5`, not `5.0`); anything else,
/// or an integer sum that would overflow, is added as `f64`.

use serde_json::{Number, Value, json};

use crate::core::error::HandlerError;
use crate::core::params::ToolContext;
use crate::core::registry::{OperationDefinition, OperationRegistry, tool_fn};

pub fn register(registry: &OperationRegistry) {
    let definition = OperationDefinition::new("add", "Add two numbers.").with_schema(json!({
        "type": "object",
        "properties": {
            "a": { "type": "number", "description": "First addend" },
            "b": { "type": "number", "description": "Second addend" }
        },
        "required": ["a", "b"]
    }));
    registry.register_tool(definition, tool_fn(add));
}

async fn add(ctx: ToolContext) -> Result<Value, HandlerError> {
    let a: Number = ctx.param("a")?;
    let b: Number = ctx.param("b")?;

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(json!(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN);
    Ok(json!(sum))
}
