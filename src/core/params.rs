/// Handler call context and typed parameter binding.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::error::ParamError;

/// Read-only view handed to a handler for a single call.
///
/// Built by the dispatcher per invocation and dropped once the handler
/// returns.
#[derive(Debug, Clone)]
pub struct ToolContext {
    request_id: Option<Value>,
    operation: String,
    arguments: Map<String, Value>,
}

impl ToolContext {
    pub fn new(
        request_id: Option<Value>,
        operation: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            request_id,
            operation: operation.into(),
            arguments,
        }
    }

    pub fn request_id(&self) -> Option<&Value> {
        self.request_id.as_ref()
    }

    /// Name of the tool/resource/prompt being invoked.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// Bind a required argument. Fails on a missing key (or explicit null)
    /// and on a value that does not deserialize into `T`.
    pub fn param<T: DeserializeOwned>(&self, name: &str) -> Result<T, ParamError> {
        match self.arguments.get(name) {
            None | Some(Value::Null) => Err(ParamError::Missing(name.to_string())),
            Some(value) => Self::bind(name, value),
        }
    }

    /// Bind an optional argument, falling back to `default` when absent.
    /// A present value of the wrong type is still an error.
    pub fn optional_param<T: DeserializeOwned>(
        &self,
        name: &str,
        default: T,
    ) -> Result<T, ParamError> {
        match self.arguments.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => Self::bind(name, value),
        }
    }

    fn bind<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, ParamError> {
        T::deserialize(value).map_err(|e| ParamError::TypeMismatch {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
