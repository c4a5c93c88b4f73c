/// Error Taxonomy
///
/// Errors are split by the layer that reports them:
/// - `DispatchError` becomes a JSON-RPC error object inside a response envelope
/// - `HandlerError` is what tool/resource/prompt handlers return
/// - `ParamError` comes from typed argument binding in `ToolContext`
/// - `TransportError` never reaches the dispatcher and is answered with an
///   HTTP status instead of a JSON-RPC body
/// - `ConfigError` aborts startup

use actix_web::{HttpResponse, ResponseError, http::StatusCode, http::header};
use thiserror::Error;

use crate::core::envelope::ErrorObject;

/// JSON-RPC error codes used by the protocol.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Failure produced while routing or executing a decoded request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    MethodNotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}

/// Failure while binding a named argument to a concrete type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("missing required parameter: {0}")]
    Missing(String),
    #[error("parameter '{name}' has the wrong type: {reason}")]
    TypeMismatch { name: String, reason: String },
}

/// Error returned by an operation handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    InvalidParams(#[from] ParamError),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Request rejected at the HTTP layer before dispatch.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("origin not allowed: {0}")]
    OriginRejected(String),
    #[error("session not found or expired: {0}")]
    SessionNotFound(String),
    #[error("mcp-session-id header required")]
    MissingSessionId,
    #[error("GET requires Accept: text/event-stream")]
    NotAcceptable,
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),
}

impl ResponseError for TransportError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::OriginRejected(_) => StatusCode::FORBIDDEN,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::MissingSessionId => StatusCode::BAD_REQUEST,
            Self::NotAcceptable => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnsupportedProtocolVersion(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if matches!(self, Self::NotAcceptable) {
            builder.insert_header((header::ALLOW, "POST"));
        }
        builder.json(serde_json::json!({ "error": self.to_string() }))
    }
}

/// Invalid value in the environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid transport mode '{0}', must be 'stdio', 'http', or 'both'")]
    TransportMode(String),
}
