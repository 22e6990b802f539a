//! # Concord Node
//!
//! Cluster membership for a distributed in-memory data grid: discovery,
//! join and master election, heartbeat failure detection, and split-brain
//! merge, over a pluggable message transport.
//!
//! ## Architecture
//! ```text
//! Transport ──► ClusterService ──► JoinCoordinator ──► MemberRegistry
//!                    │        └──► HeartbeatMonitor ──┘
//!                    └──────────► MergeCoordinator
//! ```

pub mod cluster;
pub mod config;
pub mod transport;

pub use cluster::{ClusterService, MembershipEvent};
pub use config::{ClusterConfig, NodeConfig};
pub use concord_common::{
    Address, ClusterError, ClusterResult, ClusterSnapshot, JoinState, Member, MemberId,
    MembershipView,
};
