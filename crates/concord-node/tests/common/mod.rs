//! Helpers shared by the multi-node scenarios.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use concord_node::config::DiscoveryMode;
use concord_node::transport::MemoryNetwork;
use concord_node::{Address, ClusterConfig, ClusterService};

/// How long a scenario may take to converge
pub const CONVERGENCE: Duration = Duration::from_secs(10);

pub fn addr(port: u16) -> Address {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Protocol timings scaled down so scenarios settle in well under a second
pub fn fast_config(members: &[Address], lite: bool) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.lite_member = lite;
    config.discovery.members = members.to_vec();
    config.join.timeout_ms = 200;
    config.join.discovery_interval_ms = 50;
    config.join.max_discovery_rounds = 3;
    config.heartbeat.interval_ms = 100;
    config.heartbeat.timeout_ms = 80;
    config.heartbeat.max_missed = 3;
    config.merge.interval_ms = 300;
    config.merge.timeout_ms = 2_000;
    config
}

pub fn broadcast_config() -> ClusterConfig {
    let mut config = fast_config(&[], false);
    config.discovery.mode = DiscoveryMode::Broadcast;
    config.discovery.broadcast.enabled = true;
    config.discovery.broadcast.window_ms = 100;
    config
}

pub async fn node_with(
    network: &MemoryNetwork,
    address: Address,
    config: ClusterConfig,
) -> Arc<ClusterService> {
    let (transport, inbound) = network.bind(address).await;
    ClusterService::new(config, transport, inbound).unwrap()
}

pub async fn node(
    network: &MemoryNetwork,
    address: Address,
    members: &[Address],
    lite: bool,
) -> Arc<ClusterService> {
    node_with(network, address, fast_config(members, lite)).await
}

/// Poll `check` until it holds, failing the test after `CONVERGENCE`
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let converged = tokio::time::timeout(CONVERGENCE, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "timed out waiting for: {what}");
}

/// Every node sees `size` members and agrees on `master`
pub fn agree_on(nodes: &[&Arc<ClusterService>], size: usize, master: Address) -> bool {
    nodes.iter().all(|node| {
        let view = node.current_view();
        view.len() == size && view.master_address() == Some(master) && node.join_state().is_joined()
    })
}
