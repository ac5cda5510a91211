//! Tunables for the bridge and the objects built on it. No file or
//! environment parsing happens here — CLI/config-file plumbing is an
//! explicit collaborator outside the core's scope; callers construct this
//! programmatically rather than having it read configuration itself.

use std::time::Duration;

/// Default per-RPC timeout: 5 minutes.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default deadline `Container::shutdown`/`Container::terminate` apply on
/// top of the bridge's own timeout. The same deadline covers both calls;
/// there is only one.
pub const DEFAULT_CONTAINER_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Default upper bound on a single inbound message, header included. Caps
/// memory committed to a single read.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long `rpc(...)` waits for a response before killing the bridge.
    pub rpc_timeout: Duration,
    /// Deadline `Container::shutdown`/`Container::terminate` apply locally,
    /// on top of (not instead of) `rpc_timeout`.
    pub container_shutdown_deadline: Duration,
    /// Upper bound on a single inbound message, header included.
    pub max_message_size: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            container_shutdown_deadline: DEFAULT_CONTAINER_SHUTDOWN_DEADLINE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
