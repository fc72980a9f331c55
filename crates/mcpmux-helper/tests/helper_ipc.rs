use std::fs;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

fn write_mock_mcp_script(dir: &std::path::Path) -> Result<std::path::PathBuf> {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo back","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*\"die\"*)
      exit 7
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hi"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

struct HelperUnderTest {
    child: Child,
    stdin: tokio::process::ChildStdin,
    events: Lines<BufReader<ChildStdout>>,
}

impl HelperUnderTest {
    fn spawn() -> Result<Self> {
        let mut child = Command::new(env!("CARGO_BIN_EXE_mcpmux-helper"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn helper binary")?;
        let stdin = child.stdin.take().context("helper stdin missing")?;
        let stdout = child.stdout.take().context("helper stdout missing")?;
        Ok(Self {
            child,
            stdin,
            events: BufReader::new(stdout).lines(),
        })
    }

    async fn send(&mut self, frame: Value) -> Result<()> {
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Value> {
        let line = timeout(EVENT_TIMEOUT, self.events.next_line())
            .await
            .context("timed out waiting for helper event")??
            .context("helper closed its stdout")?;
        Ok(serde_json::from_str(&line)?)
    }
}

#[tokio::test]
async fn local_service_init_toolcall_shutdown() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_mcp_script(temp.path())?;
    let mut helper = HelperUnderTest::spawn()?;

    helper
        .send(json!({
            "command": "init",
            "params": {
                "serviceName": "mock",
                "serviceInfo": {
                    "name": "mock",
                    "type": "local",
                    "command": "sh",
                    "args": [script.to_string_lossy()],
                    "cwd": temp.path().to_string_lossy(),
                    "created": 0,
                },
            },
        }))
        .await?;

    let ready = helper.next_event().await?;
    assert_eq!(ready["event"], "ready");
    assert_eq!(ready["params"]["serviceName"], "mock");
    assert_eq!(ready["params"]["tools"][0]["name"], "echo");

    helper
        .send(json!({
            "command": "toolcall",
            "id": "call-1",
            "params": {"name": "echo", "args": {"msg": "hi"}},
        }))
        .await?;

    let result = helper.next_event().await?;
    assert_eq!(result["event"], "tool_result");
    assert_eq!(result["id"], "call-1");
    assert_eq!(result["result"]["success"], true);
    assert_eq!(
        result["result"]["result"]["content"][0]["text"],
        "hi"
    );

    helper.send(json!({"command": "shutdown"})).await?;
    let status = timeout(EVENT_TIMEOUT, helper.child.wait()).await??;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn dead_mcp_server_after_ready_emits_closed_and_exits_nonzero() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_mcp_script(temp.path())?;
    let mut helper = HelperUnderTest::spawn()?;

    helper
        .send(json!({
            "command": "init",
            "params": {
                "serviceName": "mock",
                "serviceInfo": {
                    "name": "mock",
                    "type": "local",
                    "command": "sh",
                    "args": [script.to_string_lossy()],
                    "cwd": temp.path().to_string_lossy(),
                    "created": 0,
                },
            },
        }))
        .await?;
    let ready = helper.next_event().await?;
    assert_eq!(ready["event"], "ready");

    // The "die" tool makes the mock server exit mid-call. The call still
    // gets an answer, then the helper reports the dead connection and leaves.
    helper
        .send(json!({
            "command": "toolcall",
            "id": "boom",
            "params": {"name": "die", "args": {}},
        }))
        .await?;

    let mut saw_closed = false;
    for _ in 0..4 {
        let event = helper.next_event().await?;
        if event["event"] == "closed" {
            assert!(
                event["params"]["error"]
                    .as_str()
                    .unwrap()
                    .contains("exited")
            );
            saw_closed = true;
            break;
        }
        assert_eq!(event["event"], "tool_result");
        assert_eq!(event["id"], "boom");
        assert_eq!(event["result"]["success"], false);
    }
    assert!(saw_closed, "expected a closed event after the server died");

    let status = timeout(EVENT_TIMEOUT, helper.child.wait()).await??;
    assert_eq!(status.code(), Some(1));
    Ok(())
}

#[tokio::test]
async fn failed_init_emits_closed_and_exits_nonzero() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut helper = HelperUnderTest::spawn()?;

    helper
        .send(json!({
            "command": "init",
            "params": {
                "serviceName": "broken",
                "serviceInfo": {
                    "name": "broken",
                    "type": "local",
                    "command": temp.path().join("no-such-binary").to_string_lossy(),
                    "cwd": temp.path().to_string_lossy(),
                    "created": 0,
                },
            },
        }))
        .await?;

    let closed = helper.next_event().await?;
    assert_eq!(closed["event"], "closed");
    assert_eq!(closed["params"]["serviceName"], "broken");
    assert!(closed["params"]["error"].as_str().unwrap().contains("broken"));

    let status = timeout(EVENT_TIMEOUT, helper.child.wait()).await??;
    assert_eq!(status.code(), Some(1));
    Ok(())
}

#[tokio::test]
async fn toolcall_before_init_still_answers_the_id() -> Result<()> {
    let mut helper = HelperUnderTest::spawn()?;

    helper
        .send(json!({
            "command": "toolcall",
            "id": "early",
            "params": {"name": "echo", "args": {}},
        }))
        .await?;

    let result = helper.next_event().await?;
    assert_eq!(result["event"], "tool_result");
    assert_eq!(result["id"], "early");
    assert_eq!(result["result"]["success"], false);
    assert_eq!(result["result"]["error"]["code"], -32603);

    helper.send(json!({"command": "shutdown"})).await?;
    let status = timeout(EVENT_TIMEOUT, helper.child.wait()).await??;
    assert_eq!(status.code(), Some(0));
    Ok(())
}
