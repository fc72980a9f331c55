use anyhow::{Context, Result, anyhow};
use mcpmux_proto::{HelperCommand, InitParams, ServiceDescriptor};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeEvent;

/// One live (or starting) helper subprocess.
///
/// The handle's existence is the liveness signal: it is created by
/// `spawn_helper` and removed either on a fenced exit event or by an
/// explicit kill. `seq` fences events from superseded helpers.
#[derive(Debug)]
pub(crate) struct HelperHandle {
    pub seq: u64,
    pub ready: bool,
    ipc_tx: mpsc::UnboundedSender<HelperCommand>,
    kill: CancellationToken,
}

/// Per-service lifecycle state: helper handles, restart bookkeeping, the
/// tool cache, and last known errors.
#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    helpers: HashMap<String, HelperHandle>,
    attempts: HashMap<String, u32>,
    abort_hints: HashSet<String>,
    tool_cache: HashMap<String, Vec<Value>>,
    last_errors: HashMap<String, String>,
    next_seq: u64,
}

/// Backoff before a restart attempt: abort-like exits restart immediately,
/// everything else waits `base × 2^(attempts−1)`.
pub(crate) fn restart_delay(attempts: u32, abort_like: bool, base: Duration) -> Duration {
    if abort_like {
        return Duration::ZERO;
    }
    base * 2u32.saturating_pow(attempts.saturating_sub(1))
}

/// Whether an observed exit signal is abort-like.
pub(crate) fn is_abort_signal(signal: Option<i32>) -> bool {
    signal == Some(libc::SIGABRT)
}

impl Supervisor {
    /// Spawn (or replace) the helper for `name` and send it the init frame.
    ///
    /// The previous helper, if any, is killed first; its late events are
    /// fenced out by the new sequence number. The tool cache is deliberately
    /// left alone so `listtools` keeps working until the next `ready`.
    pub(crate) fn spawn_helper(
        &mut self,
        name: &str,
        descriptor: ServiceDescriptor,
        helper_exe: &Path,
        events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Result<()> {
        if let Some(old) = self.helpers.remove(name) {
            old.kill.cancel();
        }
        self.last_errors.remove(name);

        self.next_seq += 1;
        let seq = self.next_seq;

        let mut cmd = Command::new(helper_exe);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn helper for service '{name}'"))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture helper stdin for '{name}'"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture helper stdout for '{name}'"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture helper stderr for '{name}'"))?;

        let (ipc_tx, mut ipc_rx) = mpsc::unbounded_channel::<HelperCommand>();

        // IPC writer: closing the channel closes the helper's stdin, which
        // the helper treats as a disconnect.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = ipc_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&frame) else {
                    continue;
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Event reader: every stdout line is one helper event.
        let event_service = name.to_string();
        let event_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(event) => {
                        let _ = event_tx.send(BridgeEvent::FromHelper {
                            service: event_service.clone(),
                            seq,
                            event,
                        });
                    }
                    Err(error) => {
                        tracing::warn!(
                            service = %event_service,
                            error = %error,
                            "dropping unreadable helper event"
                        );
                    }
                }
            }
        });

        // Stderr reader: forwarded to the bridge for logging and for the
        // abort-signal scan.
        let stderr_service = name.to_string();
        let stderr_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_tx.send(BridgeEvent::HelperStderr {
                    service: stderr_service.clone(),
                    seq,
                    line,
                });
            }
        });

        // Exit monitor: owns the child; a cancelled kill token forces the
        // exit rather than racing it.
        let kill = CancellationToken::new();
        let monitor_kill = kill.clone();
        let monitor_service = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = monitor_kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let (code, signal) = match status {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(_) => (None, None),
            };
            let _ = events_tx.send(BridgeEvent::HelperExited {
                service: monitor_service,
                seq,
                code,
                signal,
            });
        });

        let init = HelperCommand::Init {
            params: InitParams {
                service_name: name.to_string(),
                service_info: descriptor,
            },
        };
        let _ = ipc_tx.send(init);

        self.helpers.insert(
            name.to_string(),
            HelperHandle {
                seq,
                ready: false,
                ipc_tx,
                kill,
            },
        );
        tracing::debug!(service = %name, pid, "helper spawned");
        Ok(())
    }

    /// Kill the helper and drop its handle. Returns whether one existed.
    pub(crate) fn kill(&mut self, name: &str) -> bool {
        match self.helpers.remove(name) {
            Some(handle) => {
                handle.kill.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn kill_all(&mut self) {
        for (_, handle) in self.helpers.drain() {
            handle.kill.cancel();
        }
    }

    /// Drop the handle for an observed exit, but only when the sequence
    /// matches — a replacement helper must not be removed by its
    /// predecessor's exit event.
    pub(crate) fn remove_exited(&mut self, name: &str, seq: u64) -> bool {
        if self.helpers.get(name).is_some_and(|handle| handle.seq == seq) {
            self.helpers.remove(name);
            return true;
        }
        false
    }

    pub(crate) fn seq_matches(&self, name: &str, seq: u64) -> bool {
        self.helpers.get(name).is_some_and(|handle| handle.seq == seq)
    }

    /// Mark the helper ready and consume the restart bookkeeping.
    pub(crate) fn mark_ready(&mut self, name: &str, seq: u64) -> bool {
        let Some(handle) = self.helpers.get_mut(name) else {
            return false;
        };
        if handle.seq != seq {
            return false;
        }
        handle.ready = true;
        self.attempts.remove(name);
        self.abort_hints.remove(name);
        true
    }

    pub(crate) fn has_helper(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    pub(crate) fn is_ready(&self, name: &str) -> bool {
        self.helpers.get(name).is_some_and(|handle| handle.ready)
    }

    /// Name of some ready helper, for `toolcall` without a target.
    pub(crate) fn first_ready(&self) -> Option<String> {
        self.helpers
            .iter()
            .find(|(_, handle)| handle.ready)
            .map(|(name, _)| name.clone())
    }

    pub(crate) fn send(&self, name: &str, command: HelperCommand) -> bool {
        self.helpers
            .get(name)
            .is_some_and(|handle| handle.ipc_tx.send(command).is_ok())
    }

    pub(crate) fn note_abort_hint(&mut self, name: &str) {
        self.abort_hints.insert(name.to_string());
    }

    pub(crate) fn take_abort_hint(&mut self, name: &str) -> bool {
        self.abort_hints.remove(name)
    }

    pub(crate) fn record_error(&mut self, name: &str, error: impl Into<String>) {
        self.last_errors.insert(name.to_string(), error.into());
    }

    pub(crate) fn last_error(&self, name: &str) -> Option<&str> {
        self.last_errors.get(name).map(String::as_str)
    }

    /// Increment and return the consecutive-failure count.
    pub(crate) fn bump_attempts(&mut self, name: &str) -> u32 {
        let attempts = self.attempts.entry(name.to_string()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub(crate) fn cache_tools(&mut self, name: &str, tools: Vec<Value>) {
        self.tool_cache.insert(name.to_string(), tools);
    }

    pub(crate) fn tools(&self, name: &str) -> Option<&Vec<Value>> {
        self.tool_cache.get(name)
    }

    pub(crate) fn tool_count(&self, name: &str) -> usize {
        self.tool_cache.get(name).map_or(0, Vec::len)
    }

    pub(crate) fn cached_services(&self) -> Vec<String> {
        self.tool_cache.keys().cloned().collect()
    }

    /// Drop everything remembered about a service that is leaving the
    /// registry for good (`unregister`, `shutdown`).
    pub(crate) fn forget_service(&mut self, name: &str) {
        self.tool_cache.remove(name);
        self.last_errors.remove(name);
        self.attempts.remove(name);
        self.abort_hints.remove(name);
    }

    /// Kill all helpers and clear every map.
    pub(crate) fn reset(&mut self) {
        self.kill_all();
        self.attempts.clear();
        self.abort_hints.clear();
        self.tool_cache.clear();
        self.last_errors.clear();
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_from_five_seconds() {
        let base = Duration::from_secs(5);
        assert_eq!(restart_delay(1, false, base), Duration::from_secs(5));
        assert_eq!(restart_delay(2, false, base), Duration::from_secs(10));
        assert_eq!(restart_delay(3, false, base), Duration::from_secs(20));
        assert_eq!(restart_delay(4, false, base), Duration::from_secs(40));
        assert_eq!(restart_delay(5, false, base), Duration::from_secs(80));
    }

    #[test]
    fn abort_like_exit_restarts_immediately() {
        assert_eq!(
            restart_delay(3, true, Duration::from_secs(5)),
            Duration::ZERO
        );
        assert!(is_abort_signal(Some(libc::SIGABRT)));
        assert!(!is_abort_signal(Some(libc::SIGKILL)));
        assert!(!is_abort_signal(None));
    }

    #[test]
    fn attempts_count_consecutive_failures() {
        let mut supervisor = Supervisor::default();
        assert_eq!(supervisor.bump_attempts("t"), 1);
        assert_eq!(supervisor.bump_attempts("t"), 2);
        assert_eq!(supervisor.bump_attempts("other"), 1);
    }

    #[test]
    fn abort_hint_is_consumed_on_take() {
        let mut supervisor = Supervisor::default();
        supervisor.note_abort_hint("t");
        assert!(supervisor.take_abort_hint("t"));
        assert!(!supervisor.take_abort_hint("t"));
    }

    #[test]
    fn tool_cache_survives_forgetting_other_services() {
        let mut supervisor = Supervisor::default();
        supervisor.cache_tools("a", vec![json!({"name": "echo"})]);
        supervisor.cache_tools("b", vec![]);

        supervisor.forget_service("b");
        assert_eq!(supervisor.tool_count("a"), 1);
        assert!(supervisor.tools("b").is_none());
    }

    #[test]
    fn reset_clears_all_bookkeeping() {
        let mut supervisor = Supervisor::default();
        supervisor.cache_tools("a", vec![json!({"name": "echo"})]);
        supervisor.record_error("a", "boom");
        supervisor.bump_attempts("a");
        supervisor.note_abort_hint("a");

        supervisor.reset();
        assert!(supervisor.tools("a").is_none());
        assert!(supervisor.last_error("a").is_none());
        assert_eq!(supervisor.bump_attempts("a"), 1);
        assert!(supervisor.cached_services().is_empty());
    }
}
