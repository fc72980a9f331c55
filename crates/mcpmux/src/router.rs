use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Shared fields of an in-flight request awaiting a terminal action.
///
/// Every entry ends exactly one way: resolved with a reply, expired by a
/// sweep, or dropped when its client disconnects.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    /// The client-visible request id, echoed in the reply.
    pub id: Value,
    pub client: u64,
    pub since: Instant,
}

impl PendingEntry {
    pub(crate) fn new(id: Value, client: u64) -> Self {
        Self {
            id,
            client,
            since: Instant::now(),
        }
    }
}

/// Correlates client requests with helper responses: tool calls keyed by
/// request id, spawns keyed by service name (at most one per service).
#[derive(Debug, Default)]
pub(crate) struct Router {
    tool_calls: HashMap<String, PendingEntry>,
    spawns: HashMap<String, PendingEntry>,
}

impl Router {
    /// Canonical map key for a request id: strings as-is, everything else in
    /// its JSON rendering.
    pub(crate) fn id_key(id: &Value) -> String {
        match id {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    /// Record an in-flight tool call. Fails when the id is already pending.
    pub(crate) fn bind_tool_call(&mut self, key: String, entry: PendingEntry) -> bool {
        if self.tool_calls.contains_key(&key) {
            return false;
        }
        self.tool_calls.insert(key, entry);
        true
    }

    pub(crate) fn resolve_tool_call(&mut self, key: &str) -> Option<PendingEntry> {
        self.tool_calls.remove(key)
    }

    /// Record a pending spawn, returning the entry it displaced, if any.
    pub(crate) fn bind_spawn(&mut self, service: String, entry: PendingEntry) -> Option<PendingEntry> {
        self.spawns.insert(service, entry)
    }

    pub(crate) fn resolve_spawn(&mut self, service: &str) -> Option<PendingEntry> {
        self.spawns.remove(service)
    }

    /// Remove and return every tool call older than `timeout`.
    pub(crate) fn expired_tool_calls(&mut self, now: Instant, timeout: Duration) -> Vec<PendingEntry> {
        let expired: Vec<String> = self
            .tool_calls
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.since) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.tool_calls.remove(&key))
            .collect()
    }

    /// Remove and return every pending spawn older than `timeout`, with the
    /// service name it belonged to.
    pub(crate) fn expired_spawns(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(String, PendingEntry)> {
        let expired: Vec<String> = self
            .spawns
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.since) >= timeout)
            .map(|(service, _)| service.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|service| {
                self.spawns
                    .remove(&service)
                    .map(|entry| (service, entry))
            })
            .collect()
    }

    /// Drop every entry belonging to a disconnected client. No replies are
    /// written to a dead socket.
    pub(crate) fn drop_client(&mut self, client: u64) {
        self.tool_calls.retain(|_, entry| entry.client != client);
        self.spawns.retain(|_, entry| entry.client != client);
    }

    pub(crate) fn clear(&mut self) {
        self.tool_calls.clear();
        self.spawns.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_counts(&self) -> (usize, usize) {
        (self.tool_calls.len(), self.spawns.len())
    }
}
