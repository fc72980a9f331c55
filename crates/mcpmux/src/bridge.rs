use mcpmux_proto::{ErrorCode, HelperEvent, ServiceDescriptor};
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::registry::ServiceRegistry;
use crate::router::{PendingEntry, Router};
use crate::supervisor::{Supervisor, is_abort_signal, restart_delay};

/// Advisory abort marker scanned out of helper stderr.
static ABORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSIGABRT\b").expect("hardcoded pattern compiles"));

/// Everything the bridge actor reacts to. All state mutation happens inside
/// `handle_event`, one event at a time; the surrounding tasks only produce
/// events and consume reply lines.
#[derive(Debug)]
pub(crate) enum BridgeEvent {
    Connected {
        client: u64,
        sink: mpsc::UnboundedSender<String>,
    },
    Frame {
        client: u64,
        line: String,
    },
    Disconnected {
        client: u64,
    },
    FromHelper {
        service: String,
        seq: u64,
        event: HelperEvent,
    },
    HelperStderr {
        service: String,
        seq: u64,
        line: String,
    },
    HelperExited {
        service: String,
        seq: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
    RespawnDue {
        service: String,
    },
    RestoreDescriptor {
        descriptor: ServiceDescriptor,
    },
    SweepTick,
    Shutdown,
}

/// The single owner of all bridge state.
pub(crate) struct Bridge {
    pub(crate) cfg: BridgeConfig,
    pub(crate) registry: ServiceRegistry,
    pub(crate) supervisor: Supervisor,
    pub(crate) router: Router,
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    last_idle_sweep: Instant,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Bridge {
    pub(crate) fn new(cfg: BridgeConfig, events_tx: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self {
            cfg,
            registry: ServiceRegistry::default(),
            supervisor: Supervisor::default(),
            router: Router::default(),
            clients: HashMap::new(),
            events_tx,
            last_idle_sweep: Instant::now(),
        }
    }

    /// Consume events until shutdown. The sweep ticker lives here so the
    /// bridge has exactly one time-driven input.
    pub(crate) async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<BridgeEvent>) {
        let ticker_tx = self.events_tx.clone();
        let sweep_interval = self.cfg.sweep_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if ticker_tx.send(BridgeEvent::SweepTick).is_err() {
                    break;
                }
            }
        });

        while let Some(event) = events_rx.recv().await {
            if matches!(event, BridgeEvent::Shutdown) {
                self.handle_shutdown();
                break;
            }
            self.handle_event(event);
        }
        ticker.abort();
    }

    pub(crate) fn handle_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected { client, sink } => {
                self.clients.insert(client, sink);
            }
            BridgeEvent::Frame { client, line } => self.handle_frame(client, &line),
            BridgeEvent::Disconnected { client } => {
                self.clients.remove(&client);
                self.router.drop_client(client);
            }
            BridgeEvent::FromHelper {
                service,
                seq,
                event,
            } => self.handle_helper_event(&service, seq, event),
            BridgeEvent::HelperStderr { service, line, .. } => {
                tracing::debug!(service = %service, line = %line, "helper stderr");
                if ABORT_PATTERN.is_match(&line) {
                    self.supervisor.note_abort_hint(&service);
                }
            }
            BridgeEvent::HelperExited {
                service,
                seq,
                code,
                signal,
            } => self.handle_helper_exited(&service, seq, code, signal),
            BridgeEvent::RespawnDue { service } => self.handle_respawn_due(&service),
            BridgeEvent::RestoreDescriptor { descriptor } => {
                // Unconditional re-insert; a register racing the 100 ms
                // restore window loses.
                self.registry.insert(descriptor);
            }
            BridgeEvent::SweepTick => self.handle_sweep_tick(),
            BridgeEvent::Shutdown => self.handle_shutdown(),
        }
    }

    fn handle_helper_event(&mut self, service: &str, seq: u64, event: HelperEvent) {
        match event {
            HelperEvent::Ready { params } => {
                if !self.supervisor.mark_ready(service, seq) {
                    tracing::warn!(service = %service, "ignoring ready from superseded helper");
                    return;
                }
                let tool_count = params.tools.len();
                self.supervisor.cache_tools(service, params.tools);
                tracing::info!(service = %service, tool_count, "service ready");

                if let Some(entry) = self.router.resolve_spawn(service) {
                    self.send_success(
                        &entry,
                        json!({
                            "status": "started",
                            "name": service,
                            "toolCount": tool_count,
                            "ready": true,
                        }),
                    );
                }
            }
            HelperEvent::ToolResult { id, result } => {
                if !self.supervisor.seq_matches(service, seq) {
                    tracing::warn!(service = %service, id = %id, "ignoring tool result from superseded helper");
                    return;
                }
                let Some(entry) = self.router.resolve_tool_call(&id) else {
                    tracing::warn!(service = %service, id = %id, "dropping tool result with no pending request");
                    return;
                };
                let reply = if result.success {
                    json!({
                        "id": entry.id,
                        "success": true,
                        "result": result.result.unwrap_or(Value::Null),
                    })
                } else {
                    let error = result.error.map_or_else(
                        || json!({"code": ErrorCode::ToolError.code(), "message": "tool call failed"}),
                        |error| json!({"code": error.code, "message": error.message}),
                    );
                    json!({"id": entry.id, "success": false, "error": error})
                };
                self.send_line(entry.client, &reply);
            }
            HelperEvent::Closed { params } => {
                let error = params.error.unwrap_or_else(|| "connection closed".to_string());
                tracing::warn!(service = %service, error = %error, "helper reported connection closed");
                if ABORT_PATTERN.is_match(&error) {
                    self.supervisor.note_abort_hint(service);
                }
                self.supervisor.record_error(service, error);
            }
            HelperEvent::Error { params } => {
                tracing::warn!(service = %service, error = %params.error, "helper reported error");
                self.supervisor.record_error(service, params.error);
            }
        }
    }

    fn handle_helper_exited(
        &mut self,
        service: &str,
        seq: u64,
        code: Option<i32>,
        signal: Option<i32>,
    ) {
        if !self.supervisor.remove_exited(service, seq) {
            tracing::debug!(service = %service, "ignoring exit of superseded helper");
            return;
        }
        tracing::warn!(service = %service, code, signal, "helper exited");

        if is_abort_signal(signal) {
            self.supervisor.note_abort_hint(service);
        }

        if self.registry.contains(service) {
            self.handle_service_closure(service);
        } else {
            tracing::debug!(service = %service, "service no longer registered; not restarting");
        }
    }

    /// Count the failure and either give up or schedule a re-spawn.
    fn handle_service_closure(&mut self, service: &str) {
        let attempts = self.supervisor.bump_attempts(service);
        if attempts > self.cfg.max_restart_attempts {
            let last_error = self
                .supervisor
                .last_error(service)
                .unwrap_or("unknown error")
                .to_string();
            tracing::warn!(
                service = %service,
                attempts,
                "giving up after repeated start failures"
            );
            if let Some(entry) = self.router.resolve_spawn(service) {
                self.send_failure(
                    &entry,
                    ErrorCode::Internal,
                    &format!(
                        "Service '{service}' failed to start after {} attempts: {last_error}",
                        self.cfg.max_restart_attempts
                    ),
                );
            }
            return;
        }

        let abort_like = self.supervisor.take_abort_hint(service);
        let delay = restart_delay(attempts, abort_like, self.cfg.restart_base_delay);
        tracing::info!(
            service = %service,
            attempts,
            abort_like,
            delay_ms = delay.as_millis() as u64,
            "scheduling service restart"
        );

        let events_tx = self.events_tx.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(BridgeEvent::RespawnDue { service });
        });
    }

    fn handle_respawn_due(&mut self, service: &str) {
        if !self.registry.contains(service) {
            tracing::debug!(service = %service, "service unregistered during backoff; not restarting");
            return;
        }
        if self.supervisor.has_helper(service) {
            tracing::debug!(service = %service, "helper already running; skipping scheduled restart");
            return;
        }
        if let Err(error) = self.spawn_service_helper(service) {
            tracing::warn!(service = %service, error = %format!("{error:#}"), "scheduled restart failed");
            self.supervisor.record_error(service, format!("{error:#}"));
            self.handle_service_closure(service);
        }
    }

    /// Fork a helper for a registered service and hand it the descriptor.
    pub(crate) fn spawn_service_helper(&mut self, service: &str) -> anyhow::Result<()> {
        let descriptor = self
            .registry
            .get(service)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("service '{service}' is not registered"))?;
        self.supervisor.spawn_helper(
            service,
            descriptor,
            &self.cfg.helper_executable(),
            self.events_tx.clone(),
        )
    }

    fn handle_sweep_tick(&mut self) {
        let now = Instant::now();

        for entry in self.router.expired_tool_calls(now, self.cfg.request_timeout) {
            tracing::warn!(id = %entry.id, "tool call timed out");
            self.send_failure(&entry, ErrorCode::Internal, "Request timeout");
        }

        let spawn_secs = self.cfg.spawn_timeout.as_secs();
        for (service, entry) in self.router.expired_spawns(now, self.cfg.spawn_timeout) {
            tracing::warn!(service = %service, id = %entry.id, "spawn timed out");
            self.send_failure(
                &entry,
                ErrorCode::Internal,
                &format!("Service '{service}' failed to start within {spawn_secs}s"),
            );
        }

        if self.last_idle_sweep.elapsed() >= self.cfg.idle_sweep_interval {
            self.last_idle_sweep = now;
            self.sweep_idle_services();
        }
    }

    /// Evict helpers whose services have been unused past the idle limit.
    /// The descriptor comes out of the registry while the helper dies so the
    /// exit event cannot schedule a restart, then comes back shortly after.
    fn sweep_idle_services(&mut self) {
        let now = now_ms();
        let idle_ms = self.cfg.idle_timeout.as_millis() as u64;
        let idle: Vec<String> = self
            .registry
            .iter()
            .filter(|descriptor| {
                self.supervisor.has_helper(&descriptor.name)
                    && descriptor
                        .last_used
                        .is_some_and(|used| now.saturating_sub(used) > idle_ms)
            })
            .map(|descriptor| descriptor.name.clone())
            .collect();

        for service in idle {
            let Some(descriptor) = self.registry.remove(&service) else {
                continue;
            };
            tracing::info!(service = %service, "evicting idle service");
            self.supervisor.kill(&service);

            let events_tx = self.events_tx.clone();
            let delay = self.cfg.restore_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events_tx.send(BridgeEvent::RestoreDescriptor { descriptor });
            });
        }
    }

    fn handle_shutdown(&mut self) {
        tracing::info!("shutting down: closing clients and helpers");
        self.clients.clear();
        self.router.clear();
        self.supervisor.kill_all();
    }

    /// Schedule a descriptor re-insert after the restore delay (unspawn).
    pub(crate) fn schedule_restore(&self, descriptor: ServiceDescriptor) {
        let events_tx = self.events_tx.clone();
        let delay = self.cfg.restore_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(BridgeEvent::RestoreDescriptor { descriptor });
        });
    }

    pub(crate) fn send_line(&self, client: u64, value: &Value) {
        let Some(sink) = self.clients.get(&client) else {
            return;
        };
        match serde_json::to_string(value) {
            Ok(line) => {
                let _ = sink.send(line);
            }
            Err(error) => {
                tracing::warn!(client, error = %error, "failed to serialize reply");
            }
        }
    }

    pub(crate) fn send_success(&self, entry: &PendingEntry, result: Value) {
        self.send_line(entry.client, &mcpmux_proto::success(&entry.id, result));
    }

    pub(crate) fn send_failure(&self, entry: &PendingEntry, code: ErrorCode, message: &str) {
        self.send_line(entry.client, &mcpmux_proto::failure(&entry.id, code, message));
    }
}
