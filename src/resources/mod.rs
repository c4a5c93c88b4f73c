/// Resources Module
///
/// Built-in MCP resources. Each resource is addressed as `<scheme>://<name>`
/// where the scheme comes from the registry (`mcp` by default).

use serde_json::json;
use std::time::Instant;

use crate::core::error::HandlerError;
use crate::core::registry::{OperationDefinition, OperationRegistry, tool_fn};

/// Register every built-in resource.
pub fn register(registry: &OperationRegistry) {
    register_status(registry);
}

/// `status`: liveness and uptime of the running server, served as JSON.
fn register_status(registry: &OperationRegistry) {
    let started = Instant::now();
    registry.register_resource(
        OperationDefinition::new("status", "Server status and uptime"),
        tool_fn(move |_ctx| async move {
            Ok::<_, HandlerError>(json!({
                "status": "ok",
                "uptimeSecs": started.elapsed().as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::ToolContext;
    use serde_json::Map;

    #[tokio::test]
    async fn status_is_addressable_and_reports_ok() {
        let registry = OperationRegistry::new();
        register(&registry);

        let uri = registry.resource_uri("status");
        assert_eq!(uri, "mcp://status");
        let (definition, handler) = registry.resource_by_uri(&uri).expect("registered");
        assert_eq!(definition.name, "status");

        let out = handler(ToolContext::new(None, "status", Map::new()))
            .await
            .expect("read");
        assert_eq!(out["status"], "ok");
        assert!(out["uptimeSecs"].is_u64());
    }
}
