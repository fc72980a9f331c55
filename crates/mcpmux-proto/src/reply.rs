use serde_json::{Value, json};

/// JSON-RPC error codes used on the client-facing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed request shape (missing command, id collision).
    InvalidRequest,
    /// Unknown command.
    MethodNotFound,
    /// Missing or invalid parameters, unknown service.
    InvalidParams,
    /// Internal failure, timeout, or inactive service.
    Internal,
    /// Unreadable JSON frame.
    ParseError,
    /// Error reported by the downstream MCP tool itself.
    ToolError,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Internal => -32603,
            Self::ParseError => -32700,
            Self::ToolError => -32000,
        }
    }
}

/// Success reply: `{id, success: true, result}`.
pub fn success(id: &Value, result: Value) -> Value {
    json!({"id": id, "success": true, "result": result})
}

/// Failure reply: `{id, success: false, error: {code, message}}`.
pub fn failure(id: &Value, code: ErrorCode, message: impl AsRef<str>) -> Value {
    json!({
        "id": id,
        "success": false,
        "error": {"code": code.code(), "message": message.as_ref()},
    })
}

/// JSON-RPC-shaped parse-error reply; `id` is the best-effort extraction
/// from the unreadable frame, or null.
pub fn parse_error(id: Option<Value>, message: impl AsRef<str>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": {"code": ErrorCode::ParseError.code(), "message": message.as_ref()},
    })
}

/// JSON-RPC-shaped invalid-request reply (frame had no `command`).
pub fn invalid_request(id: &Value, message: impl AsRef<str>) -> Value {
    json!({
        "id": id,
        "jsonrpc": "2.0",
        "error": {"code": ErrorCode::InvalidRequest.code(), "message": message.as_ref()},
    })
}
