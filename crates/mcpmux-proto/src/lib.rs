//! Wire and IPC types shared by the mcpmux bridge and helper.
//!
//! The bridge speaks two line-delimited JSON protocols: the client-facing
//! command surface over TCP, and the bridge/helper IPC channel over the
//! helper's stdin/stdout. Both live here so the two binaries cannot drift.

mod command;
mod descriptor;
mod ipc;
mod reply;

pub use command::{
    CachetoolsParams, ListParams, NameParams, RegisterParams, RequestEnvelope, SpawnParams,
    ToolcallParams,
};
pub use descriptor::{ConnectionType, DescriptorError, ServiceDescriptor, ServiceKind};
pub use ipc::{
    ClosedParams, ErrorParams, HelperCommand, HelperEvent, InitParams, ReadyParams,
    ToolInvocation, ToolOutcome, WireError,
};
pub use reply::{ErrorCode, failure, invalid_request, parse_error, success};
