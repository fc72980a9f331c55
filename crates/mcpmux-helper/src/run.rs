use anyhow::{Context, Result};
use mcpmux_proto::{ClosedParams, HelperCommand, HelperEvent, ReadyParams, ToolOutcome};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const NOT_INITIALIZED_CODE: i64 = -32603;

/// Drive the IPC loop: commands in on stdin, events out on stdout.
///
/// Returns the helper's exit code. stdin EOF means the bridge is gone and
/// the helper leaves quietly; a failed `init` or a dead MCP server emits a
/// `closed` event and exits nonzero so the supervisor can tell a startup or
/// connection failure from a commanded shutdown.
pub async fn run() -> Result<i32> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let (death_tx, mut death_rx) = mpsc::unbounded_channel::<String>();
    let mut session: Option<crate::McpSession> = None;
    let mut service_name = String::new();

    loop {
        let command: HelperCommand = tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read IPC frame")? else {
                    // stdin closed: the bridge went away.
                    if let Some(open) = session.take() {
                        open.close().await;
                    }
                    return Ok(0);
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(command) => command,
                    Err(error) => {
                        tracing::warn!(error = %error, "dropping unreadable IPC frame");
                        continue;
                    }
                }
            }
            Some(error) = death_rx.recv() => {
                emit(
                    &mut stdout,
                    &HelperEvent::Closed {
                        params: ClosedParams {
                            service_name: service_name.clone(),
                            error: Some(error),
                        },
                    },
                )
                .await?;
                return Ok(1);
            }
        };

        match command {
            HelperCommand::Init { params } => {
                service_name = params.service_name.clone();
                match crate::McpSession::connect(&params.service_info, death_tx.clone()).await {
                    Ok(open) => {
                        emit(
                            &mut stdout,
                            &HelperEvent::Ready {
                                params: ReadyParams {
                                    service_name: service_name.clone(),
                                    tools: open.tools().to_vec(),
                                },
                            },
                        )
                        .await?;
                        session = Some(open);
                    }
                    Err(error) => {
                        emit(
                            &mut stdout,
                            &HelperEvent::Closed {
                                params: ClosedParams {
                                    service_name: service_name.clone(),
                                    error: Some(format!("{error:#}")),
                                },
                            },
                        )
                        .await?;
                        return Ok(1);
                    }
                }
            }
            HelperCommand::Toolcall { id, params } => {
                let outcome = match session.as_ref() {
                    Some(open) => open.call_tool(&params.name, params.args).await,
                    None => ToolOutcome::err(
                        NOT_INITIALIZED_CODE,
                        format!("service '{service_name}' is not initialized"),
                    ),
                };
                emit(&mut stdout, &HelperEvent::ToolResult { id, result: outcome }).await?;
            }
            HelperCommand::Shutdown => {
                if let Some(open) = session.take() {
                    open.close().await;
                }
                return Ok(0);
            }
        }
    }
}

async fn emit<W: AsyncWrite + Unpin>(writer: &mut W, event: &HelperEvent) -> Result<()> {
    let payload = serde_json::to_string(event).context("failed to serialize IPC event")?;
    writer
        .write_all(payload.as_bytes())
        .await
        .context("failed to write IPC event")?;
    writer
        .write_all(b"\n")
        .await
        .context("failed to write IPC frame delimiter")?;
    writer.flush().await.context("failed to flush IPC event")?;
    Ok(())
}
