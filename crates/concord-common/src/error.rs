//! Common error types for Concord components.

use thiserror::Error;

use crate::types::Address;

/// Result alias used across the membership core
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by the membership protocol
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No candidates answered after the configured discovery rounds
    #[error("Discovery exhausted after {rounds} round(s)")]
    DiscoveryExhausted { rounds: u32 },

    /// The master did not approve a join within the deadline
    #[error("Join approval from {master} timed out after {timeout_ms}ms")]
    JoinTimeout { master: Address, timeout_ms: u64 },

    /// Too many master redirects while joining
    #[error("Redirect loop exceeded after {hops} hop(s)")]
    RedirectLoopExceeded { hops: u32 },

    /// Joining failed for good; the embedding node decides what to do
    #[error("Join failed after {attempts} attempt(s)")]
    JoinFailure {
        attempts: u32,
        #[source]
        cause: Box<ClusterError>,
    },

    /// Split-brain survivor could not be determined
    #[error("Merge ambiguous: {0}")]
    MergeAmbiguous(String),

    /// Heartbeat probes to a member failed
    #[error("Member unreachable: {0}")]
    MemberUnreachable(Address),

    /// Peer answered with a message that does not fit the request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport send/receive error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The node is shutting down
    #[error("Operation cancelled")]
    Cancelled,
}

impl ClusterError {
    /// Wrap a join error into the fatal `JoinFailure`
    pub fn join_failure(attempts: u32, cause: ClusterError) -> Self {
        match cause {
            already @ Self::JoinFailure { .. } => already,
            cause => Self::JoinFailure {
                attempts,
                cause: Box::new(cause),
            },
        }
    }

    /// Returns true if this error must surface to the embedding node
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::JoinFailure { .. } | Self::Config(_))
    }

    /// Returns true if this error is absorbed and retried by the protocol
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryExhausted { .. }
                | Self::JoinTimeout { .. }
                | Self::MergeAmbiguous(_)
                | Self::MemberUnreachable(_)
                | Self::Transport(_)
        )
    }
}
