use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::command::RegisterParams;

/// How a remote service is reached.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    #[default]
    HttpStream,
    Sse,
}

/// Service-specific half of a registry entry.
///
/// Tagged with `type` so the wire form reads `"type": "local"` /
/// `"type": "remote"`; exactly one field group exists per variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServiceKind {
    /// MCP server spawned as a child of the helper, speaking stdio.
    #[serde(rename_all = "camelCase")]
    Local {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Remote MCP endpoint reached over streamable HTTP (or legacy SSE).
    #[serde(rename_all = "camelCase")]
    Remote {
        endpoint: String,
        #[serde(default)]
        connection_type: ConnectionType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ServiceKind {
    /// Short human-readable label for the service type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Remote { .. } => "remote",
        }
    }
}

/// A registry entry: one named MCP service.
///
/// Timestamps are epoch milliseconds; `last_used` stays `None` until the
/// service sees activity (a tool call or a single-service `list` query).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: ServiceKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
}

/// Validation failures when building a descriptor from `register` input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("service name must not be empty")]
    MissingName,
    #[error("service '{name}': missing 'type' field (expected: local, remote)")]
    MissingType { name: String },
    #[error("service '{name}': unknown service type '{given}' (expected: local, remote)")]
    UnknownType { name: String, given: String },
    #[error("service '{name}': type = \"local\" requires 'command' field")]
    MissingCommand { name: String },
    #[error("service '{name}': type = \"remote\" requires 'endpoint' field")]
    MissingEndpoint { name: String },
}

impl ServiceDescriptor {
    /// Build a descriptor from `register` parameters, validating that the
    /// field group matching `type` is populated.
    pub fn from_register(params: RegisterParams, now_ms: u64) -> Result<Self, DescriptorError> {
        if params.name.is_empty() {
            return Err(DescriptorError::MissingName);
        }

        let kind = match params.service_type.as_deref() {
            Some("local") => {
                let command = params.command.ok_or_else(|| DescriptorError::MissingCommand {
                    name: params.name.clone(),
                })?;
                ServiceKind::Local {
                    command,
                    args: params.args,
                    cwd: params.cwd,
                    env: params.env,
                }
            }
            Some("remote") => {
                let endpoint = params.endpoint.ok_or_else(|| DescriptorError::MissingEndpoint {
                    name: params.name.clone(),
                })?;
                ServiceKind::Remote {
                    endpoint,
                    connection_type: params.connection_type.unwrap_or_default(),
                    bearer_token: params.bearer_token,
                    headers: params.headers,
                }
            }
            Some(other) => {
                return Err(DescriptorError::UnknownType {
                    name: params.name,
                    given: other.to_string(),
                });
            }
            None => {
                return Err(DescriptorError::MissingType { name: params.name });
            }
        };

        Ok(Self {
            name: params.name,
            kind,
            description: params.description.unwrap_or_default(),
            created: now_ms,
            last_used: None,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ServiceKind::Local { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_params(name: &str) -> RegisterParams {
        RegisterParams {
            name: name.to_string(),
            service_type: Some("local".to_string()),
            command: Some("node".to_string()),
            args: vec!["server.js".to_string()],
            ..RegisterParams::default()
        }
    }

    #[test]
    fn local_descriptor_round_trips_with_type_tag() {
        let descriptor = ServiceDescriptor::from_register(local_params("t"), 1_000).unwrap();
        let value = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(value["type"], "local");
        assert_eq!(value["command"], "node");
        assert_eq!(value["args"], json!(["server.js"]));
        assert_eq!(value["created"], 1_000);
        assert!(value.get("lastUsed").is_none());

        let back: ServiceDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn remote_descriptor_uses_camel_case_fields() {
        let descriptor = ServiceDescriptor::from_register(
            RegisterParams {
                name: "r".to_string(),
                service_type: Some("remote".to_string()),
                endpoint: Some("https://mcp.example.com/mcp".to_string()),
                bearer_token: Some("token123".to_string()),
                ..RegisterParams::default()
            },
            5,
        )
        .unwrap();

        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["type"], "remote");
        assert_eq!(value["endpoint"], "https://mcp.example.com/mcp");
        assert_eq!(value["connectionType"], "httpStream");
        assert_eq!(value["bearerToken"], "token123");
    }

    #[test]
    fn sse_connection_type_parses() {
        let descriptor: ServiceDescriptor = serde_json::from_value(json!({
            "name": "legacy",
            "type": "remote",
            "endpoint": "https://example.com/sse",
            "connectionType": "sse",
            "created": 0,
        }))
        .unwrap();

        match descriptor.kind {
            ServiceKind::Remote { connection_type, .. } => {
                assert_eq!(connection_type, ConnectionType::Sse);
            }
            other => panic!("expected remote, got {other:?}"),
        }
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = ServiceDescriptor::from_register(local_params(""), 0).unwrap_err();
        assert_eq!(err, DescriptorError::MissingName);
    }

    #[test]
    fn missing_type_is_rejected() {
        let mut params = local_params("t");
        params.service_type = None;
        let err = ServiceDescriptor::from_register(params, 0).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingType { .. }));
    }

    #[test]
    fn local_without_command_is_rejected() {
        let mut params = local_params("t");
        params.command = None;
        let err = ServiceDescriptor::from_register(params, 0).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingCommand { .. }));
    }

    #[test]
    fn remote_without_endpoint_is_rejected() {
        let err = ServiceDescriptor::from_register(
            RegisterParams {
                name: "r".to_string(),
                service_type: Some("remote".to_string()),
                ..RegisterParams::default()
            },
            0,
        )
        .unwrap_err();
        assert!(matches!(err, DescriptorError::MissingEndpoint { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut params = local_params("t");
        params.service_type = Some("websocket".to_string());
        let err = ServiceDescriptor::from_register(params, 0).unwrap_err();
        assert!(err.to_string().contains("unknown service type"));
    }
}
