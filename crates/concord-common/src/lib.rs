//! # Concord Common
//!
//! Shared types, protocol messages, and utilities used across Concord components.
//!
//! ## Modules
//! - `types` - Core data structures (Address, Member, MembershipView, etc.)
//! - `messages` - Membership protocol messages exchanged between nodes
//! - `error` - Common error types
//! - `constants` - Shared protocol defaults

pub mod constants;
pub mod error;
pub mod messages;
pub mod types;

pub use error::{ClusterError, ClusterResult};
pub use messages::*;
pub use types::*;
