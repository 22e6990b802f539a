//! Node contexts wired to an in-memory network for unit tests.

use std::sync::Arc;

use concord_common::{Address, Member, MemberId};

use super::context::NodeContext;
use super::discovery::{DiscoveryProvider, StaticDiscovery};
use crate::config::ClusterConfig;
use crate::transport::{EventReceiver, MemoryNetwork};

pub(crate) async fn context_with(
    network: &MemoryNetwork,
    address: Address,
    lite: bool,
    customize: impl FnOnce(&mut ClusterConfig),
) -> (Arc<NodeContext>, EventReceiver) {
    let mut config = ClusterConfig::default();
    config.lite_member = lite;
    config.join.timeout_ms = 100;
    config.join.discovery_interval_ms = 20;
    config.heartbeat.timeout_ms = 50;
    customize(&mut config);

    let (transport, inbox) = network.bind(address).await;
    let discovery =
        DiscoveryProvider::Static(StaticDiscovery::new(address, &config.discovery.members));
    let local = Member::new(address, MemberId::new(), lite);

    let ctx = NodeContext::new(config, local, transport, discovery);
    (Arc::new(ctx), inbox)
}

pub(crate) async fn node_context(
    network: &MemoryNetwork,
    address: Address,
) -> (Arc<NodeContext>, EventReceiver) {
    context_with(network, address, false, |_| {}).await
}

pub(crate) async fn lite_context(
    network: &MemoryNetwork,
    address: Address,
) -> (Arc<NodeContext>, EventReceiver) {
    context_with(network, address, true, |_| {}).await
}
