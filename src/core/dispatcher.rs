/// Dispatcher
///
/// Routes a decoded request to the registry and produces exactly one
/// response carrying the request's id. Handler failures and panics are
/// converted to JSON-RPC errors here and never escape to a transport.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use tracing::{Instrument, debug, debug_span, warn};

use crate::core::envelope::{Request, Response, tool_content};
use crate::core::error::{DispatchError, HandlerError};
use crate::core::params::ToolContext;
use crate::core::registry::OperationRegistry;

/// Newest protocol version; answered when the client asks for an unknown one.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Server identity reported by `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    info: ServerInfo,
}

impl Dispatcher {
    pub fn new(registry: Arc<OperationRegistry>, info: ServerInfo) -> Self {
        Self { registry, info }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Execute one request. Always returns a response with the request's id;
    /// transports drop it for notifications.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone();
        let span = debug_span!("dispatch", method = %request.method);
        let outcome = AssertUnwindSafe(self.route(request))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| {
                let msg = panic_message(panic.as_ref());
                warn!(panic = %msg, "handler panicked");
                Err(DispatchError::Internal(format!("Handler panicked: {msg}")))
            });
        Response::from_dispatch(id, outcome)
    }

    async fn route(&self, request: Request) -> Result<Value, DispatchError> {
        let Request {
            id, method, params, ..
        } = request;
        debug!(method = %method, "dispatching");

        match method.as_str() {
            "initialize" => Ok(self.initialize(params.as_ref())),
            "ping" => Ok(ping()),
            "tools/list" => Ok(self.list_tools()),
            "resources/list" => Ok(self.list_resources()),
            "prompts/list" => Ok(self.list_prompts()),
            "tools/call" => self.call_tool(id, params).await,
            "resources/read" => self.read_resource(id, params).await,
            "prompts/get" => self.get_prompt(id, params),
            // Client notifications need no handling.
            m if m.starts_with("notifications/") => Ok(Value::Null),
            other => Err(DispatchError::MethodNotFound(format!(
                "Method not found: {other}"
            ))),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let negotiated = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v,
            _ => PROTOCOL_VERSION,
        };
        json!({
            "protocolVersion": negotiated,
            "capabilities": {
                "tools": !self.registry.tools().is_empty(),
                "resources": !self.registry.resources().is_empty(),
                "prompts": !self.registry.prompts().is_empty()
            },
            "serverInfo": {
                "name": self.info.name,
                "version": self.info.version
            }
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .tools()
            .into_iter()
            .map(|def| {
                json!({
                    "name": def.name,
                    "description": def.description,
                    "inputSchema": def
                        .schema
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}}))
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    fn list_resources(&self) -> Value {
        let resources: Vec<Value> = self
            .registry
            .resources()
            .into_iter()
            .map(|def| {
                json!({
                    "uri": self.registry.resource_uri(&def.name),
                    "name": def.name,
                    "description": def.description
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    fn list_prompts(&self) -> Value {
        let prompts: Vec<Value> = self
            .registry
            .prompts()
            .into_iter()
            .map(|def| {
                json!({
                    "name": def.name,
                    "description": def.description,
                    "arguments": def.schema.unwrap_or_else(|| json!([]))
                })
            })
            .collect();
        json!({ "prompts": prompts })
    }

    async fn call_tool(
        &self,
        id: Option<Value>,
        params: Option<Value>,
    ) -> Result<Value, DispatchError> {
        let params = params_object(params)?;
        let name = required_str(&params, "name")?;
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => {
                return Err(DispatchError::InvalidParams(
                    "'arguments' must be an object".to_string(),
                ));
            }
        };

        let (_, handler) = self
            .registry
            .tool(&name)
            .ok_or_else(|| DispatchError::MethodNotFound(format!("Unknown tool: {name}")))?;

        let ctx = ToolContext::new(id, name.clone(), arguments);
        let value = handler(ctx)
            .await
            .map_err(|e| handler_failure("Tool", &name, e))?;
        Ok(tool_content(&value))
    }

    async fn read_resource(
        &self,
        id: Option<Value>,
        params: Option<Value>,
    ) -> Result<Value, DispatchError> {
        let params = params_object(params)?;
        let uri = required_str(&params, "uri")?;

        let (def, handler) = self
            .registry
            .resource_by_uri(&uri)
            .ok_or_else(|| DispatchError::MethodNotFound(format!("Unknown resource: {uri}")))?;

        let ctx = ToolContext::new(id, def.name.clone(), params);
        let value = handler(ctx)
            .await
            .map_err(|e| handler_failure("Resource", &def.name, e))?;

        let (mime_type, text) = match value {
            Value::String(text) => ("text/plain", text),
            other => (
                "application/json",
                serde_json::to_string(&other).unwrap_or_default(),
            ),
        };
        Ok(json!({
            "contents": [
                { "uri": uri, "mimeType": mime_type, "text": text }
            ]
        }))
    }

    fn get_prompt(&self, id: Option<Value>, params: Option<Value>) -> Result<Value, DispatchError> {
        let params = params_object(params)?;
        let name = required_str(&params, "name")?;
        let arguments = match params.get("arguments") {
            Some(Value::Object(args)) => args.clone(),
            _ => Map::new(),
        };

        let (def, handler) = self
            .registry
            .prompt(&name)
            .ok_or_else(|| DispatchError::MethodNotFound(format!("Unknown prompt: {name}")))?;

        let ctx = ToolContext::new(id, name.clone(), arguments);
        let text = handler(&ctx).map_err(|e| handler_failure("Prompt", &name, e))?;
        Ok(json!({
            "description": def.description,
            "messages": [
                {
                    "role": "user",
                    "content": { "type": "text", "text": text }
                }
            ]
        }))
    }
}

fn ping() -> Value {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    json!({ "status": "ok", "timestamp": timestamp })
}

fn params_object(params: Option<Value>) -> Result<Map<String, Value>, DispatchError> {
    match params {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(DispatchError::InvalidParams(
            "params must be an object".to_string(),
        )),
    }
}

fn required_str(params: &Map<String, Value>, key: &str) -> Result<String, DispatchError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidParams(format!("missing '{key}'")))
}

fn handler_failure(kind: &str, name: &str, err: HandlerError) -> DispatchError {
    match err {
        HandlerError::InvalidParams(e) => DispatchError::InvalidParams(e.to_string()),
        HandlerError::Failed(msg) => {
            debug!(kind, name, error = %msg, "handler failed");
            DispatchError::Internal(format!("{kind} '{name}' failed: {msg}"))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{OperationDefinition, prompt_fn, tool_fn};

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(OperationRegistry::new());
        crate::tools::calc::register(&registry);
        registry.register_tool(
            OperationDefinition::new("boom", "Always fails"),
            tool_fn(|_ctx| async { Err(HandlerError::failed("kaboom")) }),
        );
        registry.register_tool(
            OperationDefinition::new("panic", "Panics"),
            tool_fn(|_ctx| async { panic!("handler exploded") }),
        );
        registry.register_resource(
            OperationDefinition::new("x", "A resource"),
            tool_fn(|_ctx| async { Ok(json!({"ok": true})) }),
        );
        registry.register_prompt(
            OperationDefinition::new("greet", "Greets someone"),
            prompt_fn(|ctx| {
                let name: String = ctx.optional_param("name", "world".to_string())?;
                Ok(format!("Say hello to {name}"))
            }),
        );
        Dispatcher::new(
            registry,
            ServerInfo {
                name: "test".into(),
                version: "0.0.0".into(),
            },
        )
    }

    fn req(id: Value, method: &str, params: Value) -> Request {
        Request::new(Some(id), method, Some(params))
    }

    fn error_code(resp: &Response) -> Option<i32> {
        resp.error.as_ref().map(|e| e.code)
    }

    #[tokio::test]
    async fn every_branch_preserves_the_request_id() {
        let d = dispatcher();
        let cases = [
            ("initialize", json!({})),
            ("ping", json!({})),
            ("tools/list", json!({})),
            ("resources/list", json!({})),
            ("prompts/list", json!({})),
            ("tools/call", json!({"name": "add", "arguments": {"a": 1, "b": 2}})),
            ("tools/call", json!({"name": "missing"})),
            ("tools/call", json!({"name": "boom", "arguments": {}})),
            ("tools/call", json!({"name": "panic", "arguments": {}})),
            ("tools/call", json!({})),
            ("resources/read", json!({"uri": "mcp://nope"})),
            ("prompts/get", json!({"name": "greet"})),
            ("no/such/method", json!({})),
        ];
        for (n, (method, params)) in cases.into_iter().enumerate() {
            let id = json!(format!("id-{n}"));
            let resp = d.handle(req(id.clone(), method, params)).await;
            assert_eq!(resp.id, Some(id), "method {method}");
            assert!(resp.result.is_some() != resp.error.is_some());
        }
    }

    #[tokio::test]
    async fn initialize_reports_version_capabilities_and_identity() {
        let d = dispatcher();
        let resp = d
            .handle(req(json!(1), "initialize", json!({"protocolVersion": "2024-11-05"})))
            .await;
        let result = resp.result.expect("result");
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["tools"], json!(true));
        assert_eq!(result["serverInfo"]["name"], "test");

        let resp = d
            .handle(req(json!(2), "initialize", json!({"protocolVersion": "1999-01-01"})))
            .await;
        assert_eq!(resp.result.expect("result")["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn ping_returns_status_and_timestamp() {
        let resp = dispatcher().handle(Request::new(Some(json!(9)), "ping", None)).await;
        let result = resp.result.expect("result");
        assert_eq!(result["status"], "ok");
        assert!(result["timestamp"].as_u64().is_some());
    }

    #[tokio::test]
    async fn tools_call_wraps_result_as_text_content() {
        let resp = dispatcher()
            .handle(req(
                json!("3"),
                "tools/call",
                json!({"name": "add", "arguments": {"a": 2, "b": 3}}),
            ))
            .await;
        let result = resp.result.expect("result");
        let text = result["content"][0]["text"].as_str().expect("text");
        assert_eq!(text, "5");
        let value: Value = serde_json::from_str(text).expect("json");
        assert_eq!(value, json!(5));
    }

    #[tokio::test]
    async fn tools_call_error_paths() {
        let d = dispatcher();

        let resp = d.handle(req(json!(1), "tools/call", json!({"name": "nope"}))).await;
        assert_eq!(error_code(&resp), Some(-32601));

        let resp = d.handle(req(json!(2), "tools/call", json!({"arguments": {}}))).await;
        assert_eq!(error_code(&resp), Some(-32602));

        let resp = d
            .handle(req(json!(3), "tools/call", json!({"name": "boom", "arguments": {}})))
            .await;
        assert_eq!(error_code(&resp), Some(-32603));
        assert!(resp.error.expect("error").message.contains("kaboom"));

        let resp = d
            .handle(req(json!(4), "tools/call", json!({"name": "panic", "arguments": {}})))
            .await;
        assert_eq!(error_code(&resp), Some(-32603));
        assert!(resp.error.expect("error").message.contains("handler exploded"));

        let resp = d
            .handle(req(
                json!(5),
                "tools/call",
                json!({"name": "add", "arguments": {"a": "two", "b": 3}}),
            ))
            .await;
        assert_eq!(error_code(&resp), Some(-32602));
    }

    #[tokio::test]
    async fn resources_read_dispatches_by_uri() {
        let d = dispatcher();
        let resp = d
            .handle(req(json!(1), "resources/read", json!({"uri": "mcp://x"})))
            .await;
        let result = resp.result.expect("result");
        assert_eq!(result["contents"][0]["uri"], "mcp://x");
        assert_eq!(result["contents"][0]["mimeType"], "application/json");

        for uri in ["mcp://y", "x", "other://x"] {
            let resp = d.handle(req(json!(2), "resources/read", json!({"uri": uri}))).await;
            assert_eq!(error_code(&resp), Some(-32601), "uri {uri}");
        }

        let resp = d.handle(req(json!(3), "resources/read", json!({}))).await;
        assert_eq!(error_code(&resp), Some(-32602));
    }

    #[tokio::test]
    async fn prompts_get_wraps_text_in_a_user_message() {
        let resp = dispatcher()
            .handle(req(
                json!(1),
                "prompts/get",
                json!({"name": "greet", "arguments": {"name": "Ada"}}),
            ))
            .await;
        let result = resp.result.expect("result");
        assert_eq!(result["description"], "Greets someone");
        assert_eq!(result["messages"][0]["role"], "user");
        assert_eq!(result["messages"][0]["content"]["text"], "Say hello to Ada");
    }

    #[tokio::test]
    async fn unknown_method_names_the_method() {
        let resp = dispatcher()
            .handle(req(json!(1), "tools/frobnicate", json!({})))
            .await;
        let err = resp.error.expect("error");
        assert_eq!(err.code, -32601);
        assert!(err.message.contains("tools/frobnicate"));
    }

    #[tokio::test]
    async fn listing_is_stable_between_calls() {
        let d = dispatcher();
        let first = d.handle(req(json!(1), "tools/list", json!({}))).await.result;
        let second = d.handle(req(json!(2), "tools/list", json!({}))).await.result;
        assert_eq!(first, second);
        let tools = first.expect("result")["tools"].clone();
        assert_eq!(tools[0]["name"], "add");
        assert!(tools[0]["inputSchema"].is_object());

        let resources = d.handle(req(json!(3), "resources/list", json!({}))).await;
        assert_eq!(resources.result.expect("result")["resources"][0]["uri"], "mcp://x");
    }
}
