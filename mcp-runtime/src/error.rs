use serde_json::{Value, json};
use thiserror::Error;

/// Failure of a single call against the Metabase HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication with Metabase failed: {0}")]
    Authentication(String),

    #[error("Metabase API returned {status} {status_text}: {}", upstream_message(.body))]
    Upstream {
        status: u16,
        status_text: String,
        body: Value,
    },

    #[error("Metabase API returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("Failed to reach Metabase at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid Metabase URL/path: {0}")]
    InvalidUrl(String),
}

/// Startup configuration errors. Any of these aborts the process before
/// the transport is opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("METABASE_URL must be set")]
    MissingBaseUrl,

    #[error("METABASE_URL is not a valid http(s) URL: {0}")]
    InvalidBaseUrl(String),

    #[error(
        "Either METABASE_API_KEY or both METABASE_USER_EMAIL and METABASE_PASSWORD must be set"
    )]
    MissingCredentials,
}

/// Error classes surfaced to the protocol caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InternalError,
    InvalidRequest,
    InvalidParams,
    MethodNotFound,
}

impl ErrorKind {
    /// JSON-RPC 2.0 error code.
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError => -32603,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InternalError => "internal_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::MethodNotFound => "method_not_found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
    pub field: Option<String>,
    pub data: Option<Value>,
}

impl RpcError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            data: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn code(&self) -> i64 {
        self.kind.code()
    }

    /// Payload embedded in an error-flagged tool response.
    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.kind.as_str(),
            "code": self.kind.code(),
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(data) = &self.data {
            payload["details"] = data.clone();
        }
        payload
    }

    /// `data` member of a JSON-RPC error object.
    pub fn rpc_data(&self) -> Option<Value> {
        match (&self.field, &self.data) {
            (None, None) => None,
            (Some(field), None) => Some(json!({ "field": field })),
            (None, Some(data)) => Some(data.clone()),
            (Some(field), Some(data)) => Some(json!({ "field": field, "details": data })),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_str(), self.code(), self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<ApiError> for RpcError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        match err {
            ApiError::Upstream {
                status,
                status_text,
                body,
            } => RpcError::internal(message).with_data(json!({
                "status": status,
                "status_text": status_text,
                "body": body
            })),
            _ => RpcError::internal(message),
        }
    }
}

/// Best-effort human message out of an upstream error body.
fn upstream_message(body: &Value) -> String {
    match body {
        Value::String(text) if !text.is_empty() => text.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Value::Null => "no response body".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_jsonrpc_codes() {
        assert_eq!(ErrorKind::InvalidRequest.code(), -32600);
        assert_eq!(ErrorKind::MethodNotFound.code(), -32601);
        assert_eq!(ErrorKind::InvalidParams.code(), -32602);
        assert_eq!(ErrorKind::InternalError.code(), -32603);
    }

    #[test]
    fn upstream_errors_become_internal_with_status_detail() {
        let err = ApiError::Upstream {
            status: 404,
            status_text: "Not Found".to_string(),
            body: json!({ "message": "Card 9 not found" }),
        };
        assert_eq!(
            err.to_string(),
            "Metabase API returned 404 Not Found: Card 9 not found"
        );

        let rpc: RpcError = err.into();
        assert_eq!(rpc.kind, ErrorKind::InternalError);
        assert!(rpc.message.contains("Card 9 not found"));
        let data = rpc.data.expect("upstream detail should be kept");
        assert_eq!(data["status"], 404);
        assert_eq!(data["body"]["message"], "Card 9 not found");
    }

    #[test]
    fn upstream_message_tolerates_empty_bodies() {
        let err = ApiError::Upstream {
            status: 502,
            status_text: "Bad Gateway".to_string(),
            body: json!({}),
        };
        assert_eq!(err.to_string(), "Metabase API returned 502 Bad Gateway: {}");
    }

    #[test]
    fn tool_payload_carries_kind_code_and_field() {
        let err =
            RpcError::invalid_params("Missing required field 'card_id'").with_field("card_id");
        let payload = err.to_value();
        assert_eq!(payload["error"], "invalid_params");
        assert_eq!(payload["code"], -32602);
        assert_eq!(payload["field"], "card_id");
        assert_eq!(err.rpc_data(), Some(json!({ "field": "card_id" })));
    }
}
