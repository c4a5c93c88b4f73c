/// Envelope Model
///
/// Request and response envelopes shared by every transport, plus their wire
/// encode/decode. Decoding never panics: malformed payloads come back as a
/// `ParseError` that still carries the request id whenever one could be
/// recovered, so the transport can answer with a best-effort error envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{DispatchError, codes};

/// JSON-RPC version tag written on every response.
pub const JSONRPC_VERSION: &str = "2.0";

/// Incoming request envelope.
///
/// `id` is an opaque correlation token; `None` marks a fire-and-forget
/// notification that is dispatched but never answered.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Protocol version advertised by the caller, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: Option<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            version: None,
            id,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decode one request from its wire form.
    pub fn decode(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ParseError {
            id: None,
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Decode a request from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let id = value.get("id").filter(|v| !v.is_null()).cloned();
        let Some(obj) = value.as_object() else {
            return Err(ParseError {
                id: None,
                message: "request must be a JSON object".to_string(),
            });
        };
        if !obj.get("method").is_some_and(Value::is_string) {
            return Err(ParseError {
                id,
                message: "missing 'method'".to_string(),
            });
        }
        serde_json::from_value(value).map_err(|e| ParseError {
            id,
            message: e.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// JSON-RPC error object carried by a failed response.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outgoing response envelope. Exactly one of `result`/`error` is set.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Response {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

impl Response {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_dispatch(id: Option<Value>, outcome: Result<Value, DispatchError>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(e) => Self::failure(id, e.to_error_object()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Decode a response; rejects envelopes carrying neither or both of
    /// `result` and `error`.
    pub fn decode(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ParseError {
            id: None,
            message: e.to_string(),
        })?;
        let id = value.get("id").filter(|v| !v.is_null()).cloned();
        let response: Response = serde_json::from_value(value).map_err(|e| ParseError {
            id: id.clone(),
            message: e.to_string(),
        })?;
        match (&response.result, &response.error) {
            (Some(_), None) | (None, Some(_)) => Ok(response),
            (None, None) => Err(ParseError {
                id,
                message: "response carries neither 'result' nor 'error'".to_string(),
            }),
            (Some(_), Some(_)) => Err(ParseError {
                id,
                message: "response carries both 'result' and 'error'".to_string(),
            }),
        }
    }

    pub fn encode(&self) -> String {
        // Value/String/i32 fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Envelope bytes that could not be decoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Parse error: {message}")]
pub struct ParseError {
    /// Correlation id recovered from the payload, if any.
    pub id: Option<Value>,
    pub message: String,
}

impl ParseError {
    /// Error envelope answering the malformed payload.
    pub fn into_response(self) -> Response {
        Response::failure(
            self.id.clone(),
            ErrorObject {
                code: codes::PARSE_ERROR,
                message: self.to_string(),
                data: None,
            },
        )
    }
}

/// Wrap a raw tool return value into the uniform typed-content envelope
/// `{content: [{type: "text", text: <json>}]}`.
pub fn tool_content(value: &Value) -> Value {
    serde_json::json!({
        "content": [
            {
                "type": "text",
                "text": serde_json::to_string(value).unwrap_or_default()
            }
        ],
        "isError": false
    })
}
