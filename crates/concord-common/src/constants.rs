//! Shared protocol defaults for Concord components.

/// Default cluster listen address
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5701";

/// Heartbeat probe period (milliseconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Time to wait for a heartbeat acknowledgement (milliseconds)
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 500;

/// Consecutive failed probes before a member is declared lost
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Per-candidate join round-trip deadline (milliseconds)
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2_000;

/// Pause between discovery rounds while not joined (milliseconds)
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 500;

/// Discovery rounds without a master before a full member self-promotes
pub const DEFAULT_MAX_DISCOVERY_ROUNDS: u32 = 3;

/// Master redirects followed before giving up
pub const DEFAULT_MAX_REDIRECTS: u32 = 4;

/// Full join sequences attempted before `JoinFailure`
pub const DEFAULT_MAX_JOIN_ATTEMPTS: u32 = 3;

/// Background split-brain detection period (milliseconds)
pub const DEFAULT_MERGE_INTERVAL_MS: u64 = 5_000;

/// Deadline for a member to re-join the surviving cluster (milliseconds)
pub const DEFAULT_MERGE_TIMEOUT_MS: u64 = 10_000;

/// Broadcast discovery collection window (milliseconds)
pub const DEFAULT_BROADCAST_WINDOW_MS: u64 = 300;

/// Out-of-order view updates buffered before fast-forwarding
pub const MAX_PENDING_VIEWS: usize = 16;

/// Largest datagram accepted by the UDP transport
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Well-known member attribute keys
pub mod attributes {
    /// Software version of the node
    pub const VERSION: &str = "concord.version";

    /// Human-readable node name
    pub const NODE_NAME: &str = "concord.node-name";
}
