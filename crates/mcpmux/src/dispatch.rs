use mcpmux_proto::{
    CachetoolsParams, ErrorCode, HelperCommand, ListParams, NameParams, RegisterParams,
    RequestEnvelope, ServiceDescriptor, ServiceKind, SpawnParams, ToolInvocation, ToolcallParams,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::bridge::{Bridge, now_ms};
use crate::router::{PendingEntry, Router};

/// Best-effort id extraction from a frame that failed to parse.
static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""id"\s*:\s*(?:"([^"]*)"|(-?\d+))"#).expect("hardcoded pattern compiles")
});

pub(crate) fn extract_id(raw: &str) -> Option<Value> {
    let captures = ID_PATTERN.captures(raw)?;
    if let Some(text) = captures.get(1) {
        return Some(Value::String(text.as_str().to_string()));
    }
    captures
        .get(2)
        .and_then(|digits| digits.as_str().parse::<i64>().ok())
        .map(Value::from)
}

/// How a command handler concluded: an immediate reply, or a deferred one
/// owned by the router from here on.
enum Outcome {
    Reply(Value),
    Deferred,
}

struct CmdError {
    code: ErrorCode,
    message: String,
}

type CmdResult = Result<Outcome, CmdError>;

impl CmdError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidParams,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: message.into(),
        }
    }

    fn method_not_found(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::MethodNotFound,
            message: message.into(),
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, CmdError> {
    // A frame without params deserializes like an empty object.
    let params = match params {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    serde_json::from_value(params)
        .map_err(|error| CmdError::invalid_params(format!("Invalid parameters: {error}")))
}

impl Bridge {
    /// Process one framed line from a client: parse, dispatch, reply.
    /// Every frame with a command produces exactly one reply carrying its id
    /// (deferred for `spawn` and `toolcall`).
    pub(crate) fn handle_frame(&mut self, client: u64, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(error) => {
                self.send_line(
                    client,
                    &mcpmux_proto::parse_error(extract_id(line), format!("Parse error: {error}")),
                );
                return;
            }
        };

        let envelope: RequestEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.send_line(
                    client,
                    &mcpmux_proto::invalid_request(&Value::Null, "Invalid request: not an object"),
                );
                return;
            }
        };

        let id = envelope
            .id
            .filter(|id| !id.is_null())
            .unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));

        let Some(command) = envelope.command else {
            self.send_line(
                client,
                &mcpmux_proto::invalid_request(&id, "Invalid request: no service specified"),
            );
            return;
        };

        match self.dispatch_command(client, &id, &command, envelope.params) {
            Ok(Outcome::Reply(result)) => {
                self.send_line(client, &mcpmux_proto::success(&id, result));
            }
            Ok(Outcome::Deferred) => {}
            Err(error) => {
                self.send_line(client, &mcpmux_proto::failure(&id, error.code, &error.message));
            }
        }
    }

    fn dispatch_command(&mut self, client: u64, id: &Value, command: &str, params: Value) -> CmdResult {
        match command {
            "register" => self.cmd_register(params),
            "unregister" => self.cmd_unregister(params),
            "spawn" => self.cmd_spawn(client, id, params),
            "unspawn" => self.cmd_unspawn(params),
            "shutdown" => self.cmd_shutdown(params),
            "list" => self.cmd_list(params),
            "listtools" => self.cmd_listtools(params),
            "toolcall" => self.cmd_toolcall(client, id, params),
            "cachetools" => self.cmd_cachetools(params),
            "reset" => self.cmd_reset(),
            other => Err(CmdError::method_not_found(format!("Unknown command: {other}"))),
        }
    }

    fn cmd_register(&mut self, params: Value) -> CmdResult {
        let params: RegisterParams = parse_params(params)?;
        let descriptor = ServiceDescriptor::from_register(params, now_ms())
            .map_err(|error| CmdError::invalid_params(error.to_string()))?;
        let name = descriptor.name.clone();
        self.registry.insert(descriptor);
        tracing::info!(service = %name, "service registered");
        Ok(Outcome::Reply(json!({"status": "registered", "name": name})))
    }

    fn cmd_unregister(&mut self, params: Value) -> CmdResult {
        let params: NameParams = parse_params(params)?;
        if !self.registry.contains(&params.name) {
            return Err(CmdError::invalid_params(format!(
                "Service '{}' is not registered",
                params.name
            )));
        }
        self.supervisor.kill(&params.name);
        self.registry.remove(&params.name);
        self.supervisor.forget_service(&params.name);
        tracing::info!(service = %params.name, "service unregistered");
        Ok(Outcome::Reply(
            json!({"status": "unregistered", "name": params.name}),
        ))
    }

    fn cmd_spawn(&mut self, client: u64, id: &Value, params: Value) -> CmdResult {
        let params: SpawnParams = parse_params(params)?;
        if params.name.is_empty() {
            return Err(CmdError::invalid_params("Missing service name"));
        }

        if !self.registry.contains(&params.name) {
            let Some(command) = params.command.clone() else {
                return Err(CmdError::invalid_params(format!(
                    "Service '{}' is not registered and no command was provided",
                    params.name
                )));
            };
            self.registry.insert(ServiceDescriptor {
                name: params.name.clone(),
                kind: ServiceKind::Local {
                    command,
                    args: params.args.clone(),
                    cwd: params.cwd.clone(),
                    env: params.env.clone(),
                },
                description: params.description.clone().unwrap_or_default(),
                created: now_ms(),
                last_used: None,
            });
            tracing::info!(service = %params.name, "service auto-registered by spawn");
        }

        if self.supervisor.is_ready(&params.name) {
            return Ok(Outcome::Reply(json!({
                "status": "started",
                "name": params.name,
                "toolCount": self.supervisor.tool_count(&params.name),
                "ready": true,
            })));
        }

        if let Some(displaced) =
            self.router
                .bind_spawn(params.name.clone(), PendingEntry::new(id.clone(), client))
        {
            self.send_failure(
                &displaced,
                ErrorCode::Internal,
                "superseded by a newer spawn request",
            );
        }

        if !self.supervisor.has_helper(&params.name)
            && let Err(error) = self.spawn_service_helper(&params.name)
        {
            self.router.resolve_spawn(&params.name);
            return Err(CmdError::internal(format!(
                "Failed to start service '{}': {error:#}",
                params.name
            )));
        }

        Ok(Outcome::Deferred)
    }

    fn cmd_unspawn(&mut self, params: Value) -> CmdResult {
        let params: NameParams = parse_params(params)?;
        if !self.supervisor.has_helper(&params.name) {
            return Ok(Outcome::Reply(
                json!({"status": "already_unspawned", "name": params.name}),
            ));
        }

        // Pull the descriptor while the helper dies so the exit event cannot
        // schedule a restart, then put it back shortly after.
        self.supervisor.kill(&params.name);
        if let Some(descriptor) = self.registry.remove(&params.name) {
            self.schedule_restore(descriptor);
        }
        tracing::info!(service = %params.name, "service unspawned");
        Ok(Outcome::Reply(
            json!({"status": "unspawned", "name": params.name}),
        ))
    }

    fn cmd_shutdown(&mut self, params: Value) -> CmdResult {
        let params: NameParams = parse_params(params)?;
        if self.registry.remove(&params.name).is_none() {
            return Err(CmdError::invalid_params(format!(
                "Service '{}' is not registered",
                params.name
            )));
        }
        self.supervisor.kill(&params.name);
        self.supervisor.forget_service(&params.name);
        tracing::info!(service = %params.name, "service shut down");
        Ok(Outcome::Reply(
            json!({"status": "shutdown", "name": params.name}),
        ))
    }

    fn cmd_list(&mut self, params: Value) -> CmdResult {
        let params: ListParams = parse_params(params)?;
        let now = now_ms();

        match params.name {
            Some(name) => {
                let Some(descriptor) = self.registry.get_mut(&name) else {
                    return Err(CmdError::invalid_params(format!(
                        "Service '{name}' is not registered"
                    )));
                };
                descriptor.last_used = Some(now);
                let descriptor = descriptor.clone();
                let mut entry = self.service_entry(&descriptor);
                if let Value::Object(map) = &mut entry {
                    map.insert("timestamp".to_string(), json!(now));
                }
                Ok(Outcome::Reply(entry))
            }
            None => {
                let mut names = self.registry.names();
                names.sort();
                let entries: Vec<Value> = names
                    .iter()
                    .filter_map(|name| self.registry.get(name))
                    .map(|descriptor| self.service_entry(descriptor))
                    .collect();
                Ok(Outcome::Reply(Value::Array(entries)))
            }
        }
    }

    fn service_entry(&self, descriptor: &ServiceDescriptor) -> Value {
        let mut entry = serde_json::to_value(descriptor).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut entry {
            let name = &descriptor.name;
            map.insert("active".to_string(), json!(self.supervisor.has_helper(name)));
            map.insert("ready".to_string(), json!(self.supervisor.is_ready(name)));
            map.insert("toolCount".to_string(), json!(self.supervisor.tool_count(name)));
            map.insert(
                "tools".to_string(),
                self.supervisor
                    .tools(name)
                    .map_or_else(|| json!([]), |tools| json!(tools)),
            );
        }
        entry
    }

    fn cmd_listtools(&mut self, params: Value) -> CmdResult {
        let params: ListParams = parse_params(params)?;
        match params.name {
            Some(name) => match self.supervisor.tools(&name) {
                Some(tools) => Ok(Outcome::Reply(json!({
                    "name": name,
                    "tools": tools,
                    "toolCount": tools.len(),
                }))),
                None => Err(CmdError::internal(format!(
                    "Service '{name}' has not been activated"
                ))),
            },
            None => {
                let mut names = self.supervisor.cached_services();
                names.sort();
                let mut map = serde_json::Map::new();
                for name in names {
                    let active = self.supervisor.has_helper(&name);
                    let tools = self
                        .supervisor
                        .tools(&name)
                        .map_or_else(|| json!([]), |tools| json!(tools));
                    map.insert(name, json!({"active": active, "tools": tools}));
                }
                Ok(Outcome::Reply(json!({"serviceTools": map})))
            }
        }
    }

    fn cmd_toolcall(&mut self, client: u64, id: &Value, params: Value) -> CmdResult {
        let params: ToolcallParams = parse_params(params)?;

        let service = match params.name {
            Some(name) => {
                if !self.registry.contains(&name) {
                    return Err(CmdError::invalid_params(format!(
                        "Service '{name}' is not registered"
                    )));
                }
                name
            }
            None => self
                .supervisor
                .first_ready()
                .ok_or_else(|| CmdError::internal("No active service"))?,
        };

        if !self.supervisor.is_ready(&service) {
            return Err(CmdError::internal(format!(
                "Service '{service}' is not active"
            )));
        }

        if let Some(descriptor) = self.registry.get_mut(&service) {
            descriptor.last_used = Some(now_ms());
        }

        let key = Router::id_key(id);
        if !self
            .router
            .bind_tool_call(key.clone(), PendingEntry::new(id.clone(), client))
        {
            return Err(CmdError::invalid_request(format!(
                "Request id '{key}' is already pending"
            )));
        }

        let sent = self.supervisor.send(
            &service,
            HelperCommand::Toolcall {
                id: key.clone(),
                params: ToolInvocation {
                    name: params.method,
                    args: params.params,
                },
            },
        );
        if !sent {
            self.router.resolve_tool_call(&key);
            return Err(CmdError::internal(format!(
                "Service '{service}' is not active"
            )));
        }

        Ok(Outcome::Deferred)
    }

    fn cmd_cachetools(&mut self, params: Value) -> CmdResult {
        let params: CachetoolsParams = parse_params(params)?;
        if !self.registry.contains(&params.name) {
            return Err(CmdError::invalid_params(format!(
                "Service '{}' is not registered",
                params.name
            )));
        }
        let tool_count = params.tools.len();
        self.supervisor.cache_tools(&params.name, params.tools);
        Ok(Outcome::Reply(json!({
            "status": "cached",
            "name": params.name,
            "toolCount": tool_count,
        })))
    }

    fn cmd_reset(&mut self) -> CmdResult {
        self.supervisor.reset();
        self.registry.clear();
        self.router.clear();
        tracing::info!("bridge reset: registry cleared, helpers stopped");
        Ok(Outcome::Reply(json!({
            "status": "reset",
            "message": "registry cleared and all helpers stopped",
        })))
    }
}
