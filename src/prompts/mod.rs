/// Prompts Module
///
/// Built-in MCP prompt templates. Prompt handlers are synchronous and return
/// the rendered text; the dispatcher wraps it into a single user message.

use serde_json::json;

use crate::core::registry::{OperationDefinition, OperationRegistry, prompt_fn};

/// Register every built-in prompt.
pub fn register(registry: &OperationRegistry) {
    let definition = OperationDefinition::new("greeting", "Greet someone by name")
        .with_schema(json!([
            {
                "name": "name",
                "description": "Who to greet",
                "required": false
            }
        ]));

    registry.register_prompt(
        definition,
        prompt_fn(|ctx| {
            let name: String = ctx.optional_param("name", "there".to_string())?;
            Ok(format!("Write a short, friendly greeting for {name}."))
        }),
    );
}
