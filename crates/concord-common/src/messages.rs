//! Membership protocol messages.
//!
//! Every message travels inside an [`Envelope`] that names the sender and,
//! for request/response pairs, a call id echoed by the reply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Address, Member, MemberId, MembershipView, ViewSummary};

/// Correlation id of a request/response pair
pub type CallId = u64;

/// Request sent by a node that wants to enter a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub address: Address,
    pub id: MemberId,
    pub lite: bool,
    /// Master the requester believes in, if any (merge re-joins set this)
    pub believed_master: Option<Address>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl JoinRequest {
    pub fn for_member(member: &Member, believed_master: Option<Address>) -> Self {
        Self {
            address: member.address(),
            id: member.id(),
            lite: member.is_lite(),
            believed_master,
            attributes: member.attributes().clone(),
        }
    }

    /// Member described by this request, not yet admitted
    pub fn member(&self) -> Member {
        Member::new(self.address, self.id, self.lite).with_attributes(self.attributes.clone())
    }
}

/// Answer to a [`JoinRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinResponse {
    /// Responder is master and committed the requester into this view
    Accepted { view: MembershipView },
    /// Responder is a member; the master lives elsewhere
    Redirect { master: Address },
    /// Responder is itself still looking for a cluster
    NotJoined { lite: bool },
    /// Responder refuses the request
    Rejected { reason: String },
}

/// Answer to a [`ClusterMessage::MergeProposal`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeReply {
    /// Responder is master; here is its view
    Accepted { view: MembershipView },
    /// Responder cannot take part in a merge right now
    Refused { reason: String },
}

/// Wire protocol of the membership core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),

    /// Committed view pushed by the master after every change
    ViewUpdate { view: MembershipView },

    /// Full view sent to a member whose heartbeat ack shows it fell behind
    ViewSync { view: MembershipView },

    /// Liveness probe; carries the sender's view version
    Heartbeat { version: u64 },
    HeartbeatAck { version: u64 },

    /// Non-master asking the master to verify a peer it lost
    MemberSuspected { address: Address },

    /// Graceful departure
    Leave { id: MemberId },

    /// Broadcast discovery probe and its answer
    DiscoveryProbe { round: u64 },
    DiscoveryReply { round: u64 },

    /// Split-brain detection
    SplitBrainProbe,
    SplitBrainInfo(ViewSummary),
    MergeProposal { view: MembershipView },
    MergeReply(MergeReply),

    /// Losing master telling its members where to re-join
    MergeInstruction { master: Address },
}

impl ClusterMessage {
    /// Replies resolve pending calls instead of being dispatched
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::JoinResponse(_)
                | Self::HeartbeatAck { .. }
                | Self::SplitBrainInfo(_)
                | Self::MergeReply(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRequest(_) => "join_request",
            Self::JoinResponse(_) => "join_response",
            Self::ViewUpdate { .. } => "view_update",
            Self::ViewSync { .. } => "view_sync",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::MemberSuspected { .. } => "member_suspected",
            Self::Leave { .. } => "leave",
            Self::DiscoveryProbe { .. } => "discovery_probe",
            Self::DiscoveryReply { .. } => "discovery_reply",
            Self::SplitBrainProbe => "split_brain_probe",
            Self::SplitBrainInfo(_) => "split_brain_info",
            Self::MergeProposal { .. } => "merge_proposal",
            Self::MergeReply(_) => "merge_reply",
            Self::MergeInstruction { .. } => "merge_instruction",
        }
    }
}

/// Unit of transmission between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub message: ClusterMessage,
}

impl Envelope {
    /// One-way message
    pub fn new(from: Address, message: ClusterMessage) -> Self {
        Self {
            from,
            call_id: None,
            message,
        }
    }

    /// Request expecting a reply with the same call id
    pub fn request(from: Address, call_id: CallId, message: ClusterMessage) -> Self {
        Self {
            from,
            call_id: Some(call_id),
            message,
        }
    }

    /// Reply to this envelope, echoing its call id
    pub fn reply(&self, from: Address, message: ClusterMessage) -> Self {
        Self {
            from,
            call_id: self.call_id,
            message,
        }
    }
}
