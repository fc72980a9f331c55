use anyhow::{Context, Result, anyhow};
use mcpmux_proto::{ConnectionType, ServiceDescriptor, ServiceKind, ToolOutcome};
use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParams, CallToolResult};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::launch::resolve_launch;

const SHUTDOWN_GRACE_SECS: u64 = 3;
const TOOL_ERROR_CODE: i64 = -32000;
const INTERNAL_ERROR_CODE: i64 = -32603;

/// One open MCP client session, local (child process over stdio) or remote
/// (streamable HTTP).
pub struct McpSession {
    service: RunningService<RoleClient, ()>,
    /// Present for local sessions; cancelling it makes the child monitor
    /// reap the process instead of reporting an unexpected death.
    child_kill: Option<CancellationToken>,
    tools: Vec<Value>,
}

impl McpSession {
    /// Open the MCP connection described by `info` and fetch its tool list.
    ///
    /// For local services, an unexpected child exit is reported through
    /// `death_tx` so the IPC loop can emit `closed` and terminate.
    pub async fn connect(
        info: &ServiceDescriptor,
        death_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let (service, child_kill) = match &info.kind {
            ServiceKind::Local {
                command,
                args,
                cwd,
                env,
            } => {
                let (service, child) =
                    spawn_stdio(&info.name, command, args, cwd.as_deref(), env).await?;
                let kill = monitor_child(info.name.clone(), child, death_tx);
                (service, Some(kill))
            }
            ServiceKind::Remote {
                endpoint,
                connection_type,
                bearer_token,
                headers,
            } => {
                let service =
                    connect_remote(&info.name, endpoint, *connection_type, bearer_token.as_deref(), headers)
                        .await?;
                (service, None)
            }
        };

        let tools = service
            .list_tools(None)
            .await
            .with_context(|| format!("failed to list tools for service '{}'", info.name))?
            .tools
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .context("failed to serialize tool list")?;

        Ok(Self {
            service,
            child_kill,
            tools,
        })
    }

    /// The tool list fetched at connect time.
    pub fn tools(&self) -> &[Value] {
        &self.tools
    }

    /// Invoke a tool. Always produces an outcome; failures become error
    /// payloads rather than propagating, so the caller can answer the
    /// request id no matter what happened.
    pub async fn call_tool(&self, name: &str, args: Value) -> ToolOutcome {
        let arguments = match args {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => {
                return ToolOutcome::err(
                    INTERNAL_ERROR_CODE,
                    format!("tool arguments must be an object, got {other}"),
                );
            }
        };

        let mut request = CallToolRequestParams::new(name.to_string());
        request.arguments = arguments;

        match self.service.call_tool(request).await {
            Ok(result) => outcome_from_result(result),
            Err(error) => ToolOutcome::err(INTERNAL_ERROR_CODE, error.to_string()),
        }
    }

    /// Close the session: cancel the rmcp service, then let the child
    /// monitor reap the process with a short grace period.
    pub async fn close(self) {
        let _ = self.service.cancel().await;
        if let Some(kill) = self.child_kill {
            kill.cancel();
        }
    }
}

/// Watch a local MCP server process. A natural exit is reported as a death;
/// a cancelled token means deliberate shutdown, which waits briefly and then
/// kills.
fn monitor_child(
    service_name: String,
    mut child: tokio::process::Child,
    death_tx: mpsc::UnboundedSender<String>,
) -> CancellationToken {
    let kill = CancellationToken::new();
    let monitor_kill = kill.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|error| error.to_string());
                let _ = death_tx.send(format!(
                    "MCP server process for '{service_name}' exited: {status}"
                ));
            }
            _ = monitor_kill.cancelled() => {
                match tokio::time::timeout(
                    Duration::from_secs(SHUTDOWN_GRACE_SECS),
                    child.wait(),
                )
                .await
                {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
        }
    });
    kill
}

fn outcome_from_result(result: CallToolResult) -> ToolOutcome {
    if result.is_error.unwrap_or(false) {
        let message = first_text(&result).unwrap_or_else(|| "tool reported an error".to_string());
        return ToolOutcome::err(TOOL_ERROR_CODE, message);
    }
    match serde_json::to_value(&result) {
        Ok(value) => ToolOutcome::ok(value),
        Err(error) => ToolOutcome::err(
            INTERNAL_ERROR_CODE,
            format!("failed to serialize tool result: {error}"),
        ),
    }
}

fn first_text(result: &CallToolResult) -> Option<String> {
    result
        .content
        .iter()
        .find_map(|content| content.as_text().map(|text| text.text.clone()))
}

/// Spawn a local MCP server and negotiate the handshake over its stdio.
async fn spawn_stdio(
    service_name: &str,
    command: &str,
    args: &[String],
    cwd: Option<&str>,
    env: &std::collections::HashMap<String, String>,
) -> Result<(RunningService<RoleClient, ()>, tokio::process::Child)> {
    let home = directories::BaseDirs::new()
        .context("failed to resolve home directory")?
        .home_dir()
        .to_path_buf();
    let plan = resolve_launch(service_name, command, args, cwd, env, &home);

    tokio::fs::create_dir_all(&plan.cwd)
        .await
        .with_context(|| format!("failed to create working directory {}", plan.cwd.display()))?;

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);
    cmd.envs(plan.env.iter().map(|(key, value)| (key, value)));
    cmd.current_dir(&plan.cwd);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn MCP server '{service_name}' ({})", plan.program))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdout for MCP server '{service_name}'"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdin for MCP server '{service_name}'"))?;
    if let Some(mut stderr) = child.stderr.take() {
        // Forward the MCP server's stderr so the bridge sees crash output.
        tokio::spawn(async move {
            let mut sink = tokio::io::stderr();
            let _ = tokio::io::copy(&mut stderr, &mut sink).await;
        });
    }

    let service = ()
        .serve((stdout, stdin))
        .await
        .with_context(|| format!("MCP handshake failed for service '{service_name}'"))?;

    Ok((service, child))
}

/// Connect to a remote MCP server via streamable HTTP. The legacy `sse`
/// connection type takes the same path.
async fn connect_remote(
    service_name: &str,
    endpoint: &str,
    connection_type: ConnectionType,
    bearer_token: Option<&str>,
    headers: &std::collections::HashMap<String, String>,
) -> Result<RunningService<RoleClient, ()>> {
    use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

    if connection_type == ConnectionType::Sse {
        tracing::debug!(service = %service_name, "sse connection type routed over streamable HTTP");
    }

    let mut default_headers = HeaderMap::new();
    if let Some(token) = bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("bearer token is not a valid header value")?;
        default_headers.insert(AUTHORIZATION, value);
    }
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name '{key}'"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header '{key}'"))?;
        default_headers.insert(name, value);
    }

    let client = reqwest::Client::builder()
        .default_headers(default_headers)
        .build()
        .context("failed to build HTTP client")?;
    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(endpoint.to_string()),
    );

    ()
        .serve(transport)
        .await
        .with_context(|| format!("failed to connect to MCP server '{service_name}' at {endpoint}"))
}
