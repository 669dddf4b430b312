use std::time::Duration;

use assert_matches::assert_matches;
use kestrel::errors::{NewSessionError, QueryError};
use kestrel::{HostInfo, Session, SessionBuilder};

use crate::utils::{setup_tracing, MockNode};

const STATEMENT: &str = "CREATE TABLE t (a int PRIMARY KEY)";

async fn wait_for(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_size(session: &Session, size: usize) {
    wait_for(|| session.pool().size() == size).await;
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn pool_opens_connections_per_host() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node
        .session_builder()
        .connections_per_host(3)
        .build()
        .await
        .unwrap();

    wait_for_size(&session, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.accepted(), 3);
    assert_eq!(session.pool().size(), 3);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn broken_connections_are_replaced() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session().await;
    wait_for_size(&session, 2).await;

    node.kill_connections();
    wait_for(|| node.accepted() >= 4).await;
    wait_for_size(&session, 2).await;
    session.query(STATEMENT, ()).exec().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unreachable_seeds_are_skipped() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = SessionBuilder::new()
        .known_node("127.0.0.1:1")
        .known_node(node.addr())
        .build()
        .await
        .unwrap();

    session.query(STATEMENT, ()).exec().await.unwrap();
    assert_eq!(node.queries().len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn session_needs_a_reachable_node() {
    setup_tracing();
    assert_matches!(
        SessionBuilder::new().build().await,
        Err(NewSessionError::NoHosts)
    );
    assert_matches!(
        SessionBuilder::new().known_node("127.0.0.1:1").build().await,
        Err(NewSessionError::NoConnectionsStarted)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn closed_session_rejects_requests() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session().await;
    let clone = session.clone();

    session.close();
    session.close();
    assert!(clone.is_closed());
    assert_eq!(session.pool().size(), 0);
    assert_matches!(
        clone.query(STATEMENT, ()).exec().await,
        Err(QueryError::SessionClosed)
    );
    let mut batch = clone.batch(kestrel::BatchType::Logged);
    batch.query(STATEMENT, ());
    assert_matches!(
        clone.execute_batch(&mut batch).await,
        Err(QueryError::SessionClosed)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn set_hosts_adds_and_removes_nodes() {
    setup_tracing();
    let first = MockNode::start().await;
    let second = MockNode::start().await;
    let session = first.session().await;
    wait_for_size(&session, 2).await;

    session
        .pool()
        .set_hosts(vec![HostInfo::new(first.addr()), HostInfo::new(second.addr())])
        .await;
    wait_for_size(&session, 4).await;
    assert_eq!(second.accepted(), 2);

    for _ in 0..10 {
        session.query(STATEMENT, ()).exec().await.unwrap();
    }
    assert!(!first.queries().is_empty());
    assert!(!second.queries().is_empty());
    assert_eq!(first.queries().len() + second.queries().len(), 10);

    session
        .pool()
        .set_hosts(vec![HostInfo::new(first.addr())])
        .await;
    assert_eq!(session.pool().size(), 2);
    second.clear_received();
    for _ in 0..5 {
        session.query(STATEMENT, ()).exec().await.unwrap();
    }
    assert!(second.queries().is_empty());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn empty_pool_is_refilled_on_demand() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session_builder().connections_per_host(1).build().await.unwrap();
    wait_for_size(&session, 1).await;

    node.kill_connections();
    wait_for(|| session.pool().size() == 0 || node.accepted() >= 2).await;
    session.query(STATEMENT, ()).exec().await.unwrap();
    assert!(node.accepted() >= 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn concurrent_fills_respect_connections_per_host() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node
        .session_builder()
        .connections_per_host(3)
        .build()
        .await
        .unwrap();

    let pool = session.pool();
    futures::future::join_all(
        (0..5).map(|_| pool.set_hosts(vec![HostInfo::new(node.addr())])),
    )
    .await;
    wait_for_size(&session, 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.pool().size(), 3);
    assert_eq!(node.accepted(), 3);
}
