use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use kestrel::cluster::RingDescriber;
use kestrel::frame::ColumnType;
use kestrel::{DiscoveryConfig, HostInfo, SessionBuilder};
use uuid::Uuid;

use crate::utils::{setup_tracing, MockNode, Table};

const LOCAL: &str = "SELECT data_center, rack, host_id, tokens FROM system.local";
const PEERS: &str = "SELECT peer, data_center, rack, host_id, tokens FROM system.peers";

fn tokens() -> ColumnType {
    ColumnType::Set(Box::new(ColumnType::Text))
}

fn describe_ring(node: &MockNode, local_id: Uuid, peers: &[(Ipv4Addr, &str, Uuid)]) {
    node.add_table(
        LOCAL,
        Table::new(&[
            ("data_center", ColumnType::Text),
            ("rack", ColumnType::Text),
            ("host_id", ColumnType::Uuid),
            ("tokens", tokens()),
        ])
        .row(&[&"dc1", &"r1", &local_id, &vec!["-100", "100"]]),
    );
    let peers_table = Table::new(&[
        ("peer", ColumnType::Inet),
        ("data_center", ColumnType::Text),
        ("rack", ColumnType::Text),
        ("host_id", ColumnType::Uuid),
        ("tokens", tokens()),
    ]);
    let peers_table = peers.iter().fold(peers_table, |table, (peer, dc, host_id)| {
        table.row(&[&IpAddr::V4(*peer), dc, &"r1", host_id, &vec!["0"]])
    });
    node.add_table(PEERS, peers_table);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn ring_is_read_from_system_tables() {
    setup_tracing();
    let node = MockNode::start().await;
    let (local_id, peer_id) = (Uuid::new_v4(), Uuid::new_v4());
    describe_ring(&node, local_id, &[(Ipv4Addr::new(10, 0, 0, 2), "dc1", peer_id)]);
    let session = node.session().await;

    let describer = RingDescriber::new(session.pool().clone(), session.config());
    let hosts = describer.get_hosts().await.unwrap();
    assert_eq!(
        hosts,
        vec![
            HostInfo {
                peer: "127.0.0.1".to_owned(),
                data_center: "dc1".to_owned(),
                rack: "r1".to_owned(),
                host_id: local_id,
                tokens: vec!["-100".to_owned(), "100".to_owned()],
            },
            HostInfo {
                peer: "10.0.0.2".to_owned(),
                data_center: "dc1".to_owned(),
                rack: "r1".to_owned(),
                host_id: peer_id,
                tokens: vec!["0".to_owned()],
            },
        ]
    );
    assert!(node
        .executes()
        .iter()
        .all(|params| params.consistency == session.config().consistency));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn peers_outside_the_data_center_are_skipped() {
    setup_tracing();
    let node = MockNode::start().await;
    describe_ring(
        &node,
        Uuid::new_v4(),
        &[
            (Ipv4Addr::new(10, 0, 0, 2), "dc2", Uuid::new_v4()),
            (Ipv4Addr::new(10, 0, 0, 3), "dc1", Uuid::new_v4()),
        ],
    );
    let mut builder = node.session_builder();
    builder.config.discovery.dc_filter = Some("dc1".to_owned());
    let session = builder.build().await.unwrap();

    let describer = RingDescriber::new(session.pool().clone(), session.config());
    let peers = describer
        .get_hosts()
        .await
        .unwrap()
        .into_iter()
        .map(|host| host.peer)
        .collect::<Vec<_>>();
    assert_eq!(peers, vec!["127.0.0.1".to_owned(), "10.0.0.3".to_owned()]);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn discovered_nodes_join_the_pool() {
    setup_tracing();
    let first = MockNode::start().await;
    let second = MockNode::bind(&format!("127.0.0.2:{}", first.port())).await;
    describe_ring(
        &first,
        Uuid::new_v4(),
        &[(Ipv4Addr::new(127, 0, 0, 2), "dc1", Uuid::new_v4())],
    );

    // Peers are dialed on the session port, so the seed is given without one.
    let session = SessionBuilder::new()
        .known_node("127.0.0.1")
        .port(first.port())
        .connections_per_host(1)
        .discover_hosts(DiscoveryConfig {
            sleep: Duration::from_millis(50),
            ..Default::default()
        })
        .build()
        .await
        .unwrap();

    while second.accepted() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    while session.pool().size() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    second.clear_received();
    for _ in 0..10 {
        session
            .query("CREATE TABLE t (a int PRIMARY KEY)", ())
            .exec()
            .await
            .unwrap();
    }
    assert!(!second.queries().is_empty());
}
