use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::ServiceDescriptor;

/// Bridge → helper IPC frame, one JSON object per line on the helper's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum HelperCommand {
    /// Open the MCP connection for the named service. Sent exactly once,
    /// immediately after the helper is spawned.
    Init { params: InitParams },
    /// Invoke a tool; the helper must answer with a `tool_result` carrying
    /// the same id, whatever happens.
    Toolcall { id: String, params: ToolInvocation },
    /// Close the MCP connection and exit 0.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub service_name: String,
    pub service_info: ServiceDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Helper → bridge IPC frame, one JSON object per line on the helper's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HelperEvent {
    /// MCP session is open and the tool list has been fetched.
    Ready { params: ReadyParams },
    /// Outcome of one `toolcall`, success or failure.
    ToolResult { id: String, result: ToolOutcome },
    /// The MCP connection is gone; the helper exits right after.
    Closed { params: ClosedParams },
    /// Non-fatal trouble worth surfacing in the bridge log.
    Error { params: ErrorParams },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyParams {
    pub service_name: String,
    #[serde(default)]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClosedParams {
    pub service_name: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorParams {
    pub service_name: String,
    pub error: String,
}

/// Result payload forwarded verbatim to the TCP client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(code: i64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RegisterParams;
    use serde_json::json;

    #[test]
    fn init_frame_uses_command_tag() {
        let descriptor = ServiceDescriptor::from_register(
            RegisterParams {
                name: "t".to_string(),
                service_type: Some("local".to_string()),
                command: Some("node".to_string()),
                ..RegisterParams::default()
            },
            0,
        )
        .unwrap();
        let frame = HelperCommand::Init {
            params: InitParams {
                service_name: "t".to_string(),
                service_info: descriptor,
            },
        };

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["command"], "init");
        assert_eq!(value["params"]["serviceName"], "t");
        assert_eq!(value["params"]["serviceInfo"]["type"], "local");
    }

    #[test]
    fn toolcall_and_shutdown_frames_round_trip() {
        let frame = HelperCommand::Toolcall {
            id: "d".to_string(),
            params: ToolInvocation {
                name: "echo".to_string(),
                args: json!({"msg": "hi"}),
            },
        };
        let line = serde_json::to_string(&frame).unwrap();
        let back: HelperCommand = serde_json::from_str(&line).unwrap();
        assert_eq!(back, frame);

        let shutdown = serde_json::to_value(HelperCommand::Shutdown).unwrap();
        assert_eq!(shutdown, json!({"command": "shutdown"}));
    }

    #[test]
    fn tool_result_event_uses_snake_case_tag() {
        let event = HelperEvent::ToolResult {
            id: "d".to_string(),
            result: ToolOutcome::ok(json!({"content": []})),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "tool_result");
        assert_eq!(value["result"]["success"], true);
        assert!(value["result"].get("error").is_none());
    }

    #[test]
    fn failed_outcome_omits_result() {
        let value = serde_json::to_value(ToolOutcome::err(-32000, "boom")).unwrap();
        assert_eq!(value, json!({"success": false, "error": {"code": -32000, "message": "boom"}}));
    }

    #[test]
    fn ready_event_parses_with_tools() {
        let event: HelperEvent = serde_json::from_value(json!({
            "event": "ready",
            "params": {"serviceName": "t", "tools": [{"name": "echo"}]},
        }))
        .unwrap();
        match event {
            HelperEvent::Ready { params } => {
                assert_eq!(params.service_name, "t");
                assert_eq!(params.tools.len(), 1);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }
}
