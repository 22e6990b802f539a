//! Cluster membership core.
//!
//! Implements:
//! - Member registry (versioned views, single writer)
//! - Discovery (static seed list or broadcast probe)
//! - Join handshake and master election
//! - Heartbeat failure detection
//! - Split-brain merge

mod calls;
mod context;
mod discovery;
mod heartbeat;
mod join;
mod merge;
mod registry;
mod service;
#[cfg(test)]
mod testing;

pub use calls::{CallSlot, PendingCalls};
pub use context::MembershipEvent;
pub use discovery::{BroadcastDiscovery, DiscoveryProvider, StaticDiscovery};
pub use heartbeat::FailureDetector;
pub use join::JoinTarget;
pub use merge::{ClusterSide, MergeIntent, Survivor};
pub use registry::{MemberRegistry, ViewApply};
pub use service::ClusterService;
