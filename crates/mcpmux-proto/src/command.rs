use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::descriptor::ConnectionType;

/// One framed client request, before the command is interpreted.
///
/// `id` may be a string, a number, or absent; the dispatcher generates one
/// when the client omits it. `params` stays dynamic here — each command
/// deserializes it into its own parameter struct.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Parameters for `register`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterParams {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub endpoint: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub bearer_token: Option<String>,
    pub headers: HashMap<String, String>,
    pub description: Option<String>,
}

/// Parameters for commands addressing one service by name
/// (`unregister`, `unspawn`, `shutdown`).
#[derive(Debug, Clone, Deserialize)]
pub struct NameParams {
    pub name: String,
}

/// Parameters for `spawn`. The optional command group auto-registers the
/// service as local when the name is unknown.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnParams {
    pub name: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub description: Option<String>,
}

/// Parameters for `list` and `listtools`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub name: Option<String>,
}

/// Parameters for `toolcall`: `method` is the tool name, `params` its
/// arguments, `name` the target service (first active one when absent).
#[derive(Debug, Clone, Deserialize)]
pub struct ToolcallParams {
    #[serde(default)]
    pub name: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Parameters for `cachetools`.
#[derive(Debug, Clone, Deserialize)]
pub struct CachetoolsParams {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_tolerates_missing_fields() {
        let envelope: RequestEnvelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.id.is_none());
        assert!(envelope.command.is_none());
        assert!(envelope.params.is_null());
    }

    #[test]
    fn envelope_keeps_numeric_ids() {
        let envelope: RequestEnvelope =
            serde_json::from_value(json!({"id": 7, "command": "list"})).unwrap();
        assert_eq!(envelope.id, Some(json!(7)));
        assert_eq!(envelope.command.as_deref(), Some("list"));
    }

    #[test]
    fn register_params_accept_camel_case() {
        let params: RegisterParams = serde_json::from_value(json!({
            "name": "r",
            "type": "remote",
            "endpoint": "https://example.com/mcp",
            "connectionType": "httpStream",
            "bearerToken": "secret",
        }))
        .unwrap();

        assert_eq!(params.service_type.as_deref(), Some("remote"));
        assert_eq!(params.connection_type, Some(ConnectionType::HttpStream));
        assert_eq!(params.bearer_token.as_deref(), Some("secret"));
    }

    #[test]
    fn toolcall_params_default_to_null_arguments() {
        let params: ToolcallParams =
            serde_json::from_value(json!({"method": "echo"})).unwrap();
        assert!(params.name.is_none());
        assert_eq!(params.method, "echo");
        assert!(params.params.is_null());
    }
}
