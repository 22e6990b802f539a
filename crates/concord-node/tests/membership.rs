mod common;

use std::time::Duration;

use concord_common::constants::attributes::VERSION;
use concord_common::{ClusterMessage, Envelope, JoinRequest, JoinResponse};
use concord_node::transport::{MemoryNetwork, Transport, TransportEvent};
use concord_node::{JoinState, Member, MemberId, MembershipEvent, MembershipView};
use tokio_test::assert_ok;

use common::{addr, agree_on, broadcast_config, eventually, node, node_with};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_started_together_elect_one_master() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5701), addr(5702)];
    let a = node(&network, addr(5701), &seeds, false).await;
    let b = node(&network, addr(5702), &seeds, false).await;

    let (state_a, state_b) = tokio::join!(a.start(), b.start());
    assert_ok!(state_a);
    assert_ok!(state_b);

    eventually("both nodes in one cluster", || agree_on(&[&a, &b], 2, addr(5701))).await;
    assert!(a.is_master());
    assert!(!b.is_master());
    assert_eq!(a.current_view().version(), b.current_view().version());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lite_member_waits_for_a_full_master() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5711), addr(5712)];
    let lite = node(&network, addr(5711), &seeds, true).await;

    let lite_start = tokio::spawn({
        let lite = lite.clone();
        async move { lite.start().await }
    });

    // Far more than the rounds a full member needs before promoting itself
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!lite.join_state().is_joined());
    assert!(!lite.is_master());
    assert!(lite.current_view().master().is_none());

    let full = node(&network, addr(5712), &seeds, false).await;
    assert_ok!(full.start().await);

    let state = lite_start.await.unwrap().unwrap();
    assert_eq!(state, JoinState::Joined);
    eventually("lite joined the full master", || {
        agree_on(&[&lite, &full], 2, addr(5712))
    })
    .await;
    assert!(full.is_master());
    assert!(!lite.is_master());
    assert!(lite.local_member().is_lite());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn master_and_lite_reconnect_after_link_loss() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5721), addr(5722)];
    let full = node(&network, addr(5721), &seeds, false).await;
    assert_ok!(full.start().await);
    let lite = node(&network, addr(5722), &seeds, true).await;
    assert_ok!(lite.start().await);
    eventually("initial cluster", || agree_on(&[&full, &lite], 2, addr(5721))).await;

    network.sever(addr(5721), addr(5722)).await;

    eventually("master dropped the lite member", || {
        full.current_view().len() == 1 && full.is_master()
    })
    .await;
    eventually("lite member is looking for a master", || {
        !lite.join_state().is_joined()
    })
    .await;

    network.heal(addr(5721), addr(5722)).await;

    eventually("cluster re-formed", || agree_on(&[&full, &lite], 2, addr(5721))).await;
    assert!(!lite.is_master());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joiner_is_redirected_to_the_master() {
    let network = MemoryNetwork::new();
    let master = node(&network, addr(5731), &[], false).await;
    assert_eq!(master.start().await.unwrap(), JoinState::StandaloneMaster);

    let member = node(&network, addr(5732), &[addr(5731)], false).await;
    assert_eq!(member.start().await.unwrap(), JoinState::Joined);

    // Only knows the non-master member
    let late = node(&network, addr(5733), &[addr(5732)], false).await;
    assert_eq!(late.start().await.unwrap(), JoinState::Joined);

    eventually("three members under the first node", || {
        agree_on(&[&master, &member, &late], 3, addr(5731))
    })
    .await;
    assert_eq!(master.join_state(), JoinState::Joined);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_join_messages_change_nothing() {
    let network = MemoryNetwork::new();
    let master = node(&network, addr(5741), &[], false).await;
    assert_ok!(master.start().await);

    let (joiner, mut inbox) = network.bind(addr(5742)).await;
    let candidate = Member::new(addr(5742), MemberId::new(), false);
    let request = ClusterMessage::JoinRequest(JoinRequest::for_member(&candidate, None));

    joiner
        .send(addr(5741), Envelope::request(addr(5742), 1, request.clone()))
        .await
        .unwrap();
    joiner
        .send(addr(5741), Envelope::request(addr(5742), 2, request))
        .await
        .unwrap();

    let mut views = Vec::new();
    while views.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap();
        if let Some(TransportEvent::Message(Envelope {
            message: ClusterMessage::JoinResponse(JoinResponse::Accepted { view }),
            ..
        })) = event
        {
            views.push(view);
        }
    }

    assert_eq!(views[0], views[1]);
    assert_eq!(master.current_view().len(), 2);
    assert_eq!(master.current_view().version(), views[0].version());

    // A second answer to a join the member already completed is dropped
    let member = node(&network, addr(5743), &[addr(5741)], false).await;
    assert_ok!(member.start().await);
    let settled = member.current_view();

    let (stray, _stray_inbox) = network.bind(addr(5749)).await;
    let bogus = MembershipView::singleton(
        Member::new(addr(5749), MemberId::new(), false),
        settled.version() + 10,
    );
    stray
        .send(
            addr(5743),
            Envelope {
                from: addr(5741),
                call_id: Some(u64::MAX),
                message: ClusterMessage::JoinResponse(JoinResponse::Accepted { view: bogus }),
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let view = member.current_view();
    assert_eq!(member.join_state(), JoinState::Joined);
    assert!(view.member_at(addr(5749)).is_none());
    assert_eq!(view.master_address(), Some(addr(5741)));
    assert!(view.version() < settled.version() + 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_master_failure_promotes_next_member() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5751), addr(5752), addr(5753)];
    let first = node(&network, addr(5751), &seeds, false).await;
    assert_ok!(first.start().await);
    let second = node(&network, addr(5752), &seeds, false).await;
    assert_ok!(second.start().await);
    let third = node(&network, addr(5753), &seeds, false).await;
    assert_ok!(third.start().await);
    eventually("initial cluster", || {
        agree_on(&[&first, &second, &third], 3, addr(5751))
    })
    .await;

    network
        .partition(&[addr(5751)], &[addr(5752), addr(5753)])
        .await;

    eventually("survivors elected the next member", || {
        agree_on(&[&second, &third], 2, addr(5752))
    })
    .await;
    assert!(second.is_master());
    assert!(!third.is_master());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaving_master_hands_over() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5761), addr(5762), addr(5763)];
    let first = node(&network, addr(5761), &seeds, false).await;
    assert_ok!(first.start().await);
    let second = node(&network, addr(5762), &seeds, false).await;
    assert_ok!(second.start().await);
    let third = node(&network, addr(5763), &seeds, false).await;
    assert_ok!(third.start().await);
    eventually("initial cluster", || {
        agree_on(&[&first, &second, &third], 3, addr(5761))
    })
    .await;

    let mut events = third.subscribe();
    first.shutdown().await;

    eventually("second node took over", || {
        agree_on(&[&second, &third], 2, addr(5762))
    })
    .await;

    let mut saw_master_change = false;
    while let Ok(event) = events.try_recv() {
        if let MembershipEvent::MasterChanged { current, .. } = event {
            saw_master_change |= current == Some(addr(5762));
        }
    }
    assert!(saw_master_change);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_discovery_forms_a_cluster() {
    let network = MemoryNetwork::new();
    let a = node_with(&network, addr(5771), broadcast_config()).await;
    let b = node_with(&network, addr(5772), broadcast_config()).await;

    let (state_a, state_b) = tokio::join!(a.start(), b.start());
    assert_ok!(state_a);
    assert_ok!(state_b);

    eventually("one cluster through broadcast discovery", || {
        agree_on(&[&a, &b], 2, addr(5771))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_events_follow_the_view() {
    let network = MemoryNetwork::new();
    let master = node(&network, addr(5781), &[], false).await;
    assert_ok!(master.start().await);
    let mut events = master.subscribe();

    let member = node(&network, addr(5782), &[addr(5781)], false).await;
    assert_ok!(member.start().await);

    let added = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(MembershipEvent::MemberAdded(m)) => return m,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(added.address(), addr(5782));
    assert!(added.attribute(VERSION).is_some());

    let snapshot = master.snapshot();
    assert!(snapshot.is_master);
    assert_eq!(snapshot.state, JoinState::Joined);
    assert_eq!(snapshot.view.len(), 2);
    assert!(serde_json::to_string(&snapshot).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_that_missed_an_update_catches_up() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5791), addr(5792), addr(5793)];
    let master = node(&network, addr(5791), &seeds, false).await;
    assert_ok!(master.start().await);
    let member = node(&network, addr(5792), &seeds, false).await;
    assert_ok!(member.start().await);
    eventually("initial cluster", || agree_on(&[&master, &member], 2, addr(5791))).await;

    // The member misses the view that admits the third node
    network.blackhole(addr(5791), addr(5792)).await;
    let late = node(&network, addr(5793), &[addr(5791)], false).await;
    assert_ok!(late.start().await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    network.heal(addr(5791), addr(5792)).await;

    eventually("all three agree on the view", || {
        agree_on(&[&master, &member, &late], 3, addr(5791))
    })
    .await;
    assert_eq!(
        member.current_view().version(),
        master.current_view().version()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lite_member_joins_through_broadcast_discovery() {
    let network = MemoryNetwork::new();
    let mut lite_config = broadcast_config();
    lite_config.lite_member = true;
    let full = node_with(&network, addr(5821), broadcast_config()).await;
    let lite = node_with(&network, addr(5822), lite_config).await;

    let (state_full, state_lite) = tokio::join!(full.start(), lite.start());
    assert_ok!(state_full);
    assert_eq!(state_lite.unwrap(), JoinState::Joined);

    eventually("lite member under the full master", || {
        agree_on(&[&full, &lite], 2, addr(5821))
    })
    .await;
    assert!(!lite.is_master());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn master_and_lite_reconnect_under_broadcast_discovery() {
    let network = MemoryNetwork::new();
    let mut lite_config = broadcast_config();
    lite_config.lite_member = true;
    let full = node_with(&network, addr(5831), broadcast_config()).await;
    assert_ok!(full.start().await);
    let lite = node_with(&network, addr(5832), lite_config).await;
    assert_ok!(lite.start().await);
    eventually("initial cluster", || agree_on(&[&full, &lite], 2, addr(5831))).await;

    network.sever(addr(5831), addr(5832)).await;
    eventually("master dropped the lite member", || {
        full.current_view().len() == 1 && full.is_master()
    })
    .await;
    eventually("lite member is looking for a master", || {
        !lite.join_state().is_joined()
    })
    .await;

    network.heal(addr(5831), addr(5832)).await;
    eventually("cluster re-formed", || agree_on(&[&full, &lite], 2, addr(5831))).await;
    assert!(!lite.is_master());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn later_members_see_the_lite_member() {
    let network = MemoryNetwork::new();
    let seeds = [addr(5841), addr(5842), addr(5843)];
    let first = node(&network, addr(5841), &seeds, false).await;
    assert_ok!(first.start().await);
    let lite = node(&network, addr(5842), &seeds, true).await;
    assert_ok!(lite.start().await);
    let third = node(&network, addr(5843), &seeds, false).await;
    assert_ok!(third.start().await);

    eventually("three members under the first node", || {
        agree_on(&[&first, &lite, &third], 3, addr(5841))
    })
    .await;

    let seen = third.current_view();
    let lite_entry = seen.member_at(addr(5842)).cloned();
    assert!(lite_entry.is_some_and(|m| m.is_lite()));
    assert!(!lite.is_master());
    assert!(!third.is_master());
}
