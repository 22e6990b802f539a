//! Core types shared across Concord components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Network address of a cluster node.
///
/// Ordering is total and deterministic (IPv4 before IPv6, then IP, then
/// port), which is what split-brain tie-breaks rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique instance identifier, regenerated on every process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(uuid::Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster member.
///
/// Members are immutable value objects: the lite flag is fixed at creation
/// and the join version is stamped by the registry when the member is
/// committed. "Updating" a member means replacing it in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    address: Address,
    id: MemberId,
    lite: bool,
    join_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
}

impl Member {
    /// Create a member that has not been admitted to any view yet
    pub fn new(address: Address, id: MemberId, lite: bool) -> Self {
        Self {
            address,
            id,
            lite,
            join_version: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Copy of this member stamped with the view version it was admitted under
    pub fn admitted_at(&self, version: u64) -> Self {
        Self {
            join_version: version,
            ..self.clone()
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn is_lite(&self) -> bool {
        self.lite
    }

    pub fn join_version(&self) -> u64 {
        self.join_version
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Same process instance (address and instance id both match)
    pub fn is_same(&self, other: &Member) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member [{}] - {}", self.address, self.id)?;
        if self.lite {
            write!(f, " lite")?;
        }
        Ok(())
    }
}

/// Versioned, ordered snapshot of the known members.
///
/// Members are kept in join order. The master is never stored: it is the
/// earliest-joined non-lite member, recomputed from the list on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    version: u64,
    members: Vec<Member>,
}

impl MembershipView {
    pub fn new(version: u64, members: Vec<Member>) -> Self {
        Self { version, members }
    }

    /// View holding only the given member
    pub fn singleton(member: Member, version: u64) -> Self {
        Self::new(version, vec![member])
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Master by the ordering rule: earliest join version among full members
    pub fn master(&self) -> Option<&Member> {
        self.members
            .iter()
            .filter(|m| !m.is_lite())
            .min_by_key(|m| (m.join_version(), m.address()))
    }

    pub fn master_address(&self) -> Option<Address> {
        self.master().map(Member::address)
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.members.iter().any(|m| m.is_same(member))
    }

    pub fn contains_id(&self, id: MemberId) -> bool {
        self.members.iter().any(|m| m.id() == id)
    }

    pub fn member_at(&self, address: Address) -> Option<&Member> {
        self.members.iter().find(|m| m.address() == address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.members.iter().map(Member::address)
    }

    /// True if any instance appears in both views
    pub fn overlaps(&self, other: &MembershipView) -> bool {
        self.members.iter().any(|m| other.contains_id(m.id()))
    }

    pub fn summary(&self, joined: bool) -> ViewSummary {
        ViewSummary {
            master: self.master_address(),
            version: self.version,
            member_count: self.members.len(),
            joined,
        }
    }
}

impl fmt::Display for MembershipView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let master = self.master().map(Member::id);
        writeln!(f, "Members {{size:{}, ver:{}}} [", self.len(), self.version)?;
        for member in &self.members {
            write!(f, "\t{member}")?;
            if Some(member.id()) == master {
                write!(f, " master")?;
            }
            writeln!(f)?;
        }
        write!(f, "]")
    }
}

/// Condensed view of a cluster, exchanged during split-brain detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSummary {
    pub master: Option<Address>,
    pub version: u64,
    pub member_count: usize,
    pub joined: bool,
}

/// Join progress of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinState {
    /// Looking for candidates
    NotJoined,
    /// Join requests in flight
    Connecting,
    /// A master accepted us; waiting for the committed view
    WaitingApproval,
    /// Member of a multi-node cluster
    Joined,
    /// No peers found; this node is its own single-member cluster
    StandaloneMaster,
}

impl JoinState {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined | Self::StandaloneMaster)
    }
}

impl Default for JoinState {
    fn default() -> Self {
        Self::NotJoined
    }
}

/// Read-only membership snapshot for diagnostics and the data layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub local: Member,
    pub master: Option<Member>,
    pub is_master: bool,
    pub state: JoinState,
    pub view: MembershipView,
    pub taken_at: DateTime<Utc>,
}
