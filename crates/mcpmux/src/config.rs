use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8752;
const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_MCP_COMMAND: &str = "node";
const REQUEST_TIMEOUT_SECS: u64 = 180;
const SPAWN_TIMEOUT_SECS: u64 = 180;
const SWEEP_INTERVAL_SECS: u64 = 5;
const IDLE_SWEEP_INTERVAL_SECS: u64 = 60;
const IDLE_TIMEOUT_SECS: u64 = 300;
const SOCKET_TIMEOUT_SECS: u64 = 120;
const RESTART_BASE_DELAY_SECS: u64 = 5;
const MAX_RESTART_ATTEMPTS: u32 = 5;
const RESTORE_DELAY_MS: u64 = 100;
const MAX_CONNECTIONS: usize = 64;

/// Runtime settings for the bridge. Defaults carry the production values;
/// tests shrink the time bounds.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Listen address; loopback only by design.
    pub bind: String,
    pub port: u16,
    /// Default MCP server command from the CLI (informational; `spawn`
    /// auto-registration requires an explicit command).
    pub default_command: String,
    pub default_args: Vec<String>,
    /// Deadline from `toolcall` dispatch to `tool_result`.
    pub request_timeout: Duration,
    /// Deadline from `spawn` dispatch to the helper's `ready`.
    pub spawn_timeout: Duration,
    /// Cadence of the pending-request sweeps.
    pub sweep_interval: Duration,
    /// Cadence of the idle-service scan.
    pub idle_sweep_interval: Duration,
    /// Unused-service eviction threshold.
    pub idle_timeout: Duration,
    /// Per-socket inactivity limit.
    pub socket_timeout: Duration,
    /// Base of the exponential restart backoff.
    pub restart_base_delay: Duration,
    pub max_restart_attempts: u32,
    /// Delay before a temporarily removed descriptor is re-inserted
    /// (unspawn, idle eviction).
    pub restore_delay: Duration,
    pub max_connections: usize,
    /// Explicit helper executable; resolved next to the bridge binary when
    /// unset.
    pub helper_command: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            default_command: DEFAULT_MCP_COMMAND.to_string(),
            default_args: Vec::new(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            spawn_timeout: Duration::from_secs(SPAWN_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            idle_sweep_interval: Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            socket_timeout: Duration::from_secs(SOCKET_TIMEOUT_SECS),
            restart_base_delay: Duration::from_secs(RESTART_BASE_DELAY_SECS),
            max_restart_attempts: MAX_RESTART_ATTEMPTS,
            restore_delay: Duration::from_millis(RESTORE_DELAY_MS),
            max_connections: MAX_CONNECTIONS,
            helper_command: None,
        }
    }
}

impl BridgeConfig {
    /// Locate the helper executable: explicit config, then the `MCPMUX_HELPER`
    /// environment variable, then a sibling of the bridge binary, then PATH.
    pub fn helper_executable(&self) -> PathBuf {
        if let Some(path) = &self.helper_command {
            return path.clone();
        }
        if let Some(path) = std::env::var_os("MCPMUX_HELPER") {
            return PathBuf::from(path);
        }
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            let sibling = dir.join("mcpmux-helper");
            if sibling.exists() {
                return sibling;
            }
        }
        PathBuf::from("mcpmux-helper")
    }
}
