use std::sync::Arc;

use futures::future::BoxFuture;
use kestrel::frame::ColumnType;
use kestrel::network::{simple_pool_factory, ConnectionPool, StatementCache};
use kestrel::value::Unmarshal;
use kestrel::{Consistency, SessionConfig};

use crate::utils::{setup_tracing, MockNode, Table};

#[tokio::test]
#[ntest::timeout(20000)]
async fn session_defaults_reach_the_wire() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node
        .session_builder()
        .consistency(Consistency::LocalOne)
        .build()
        .await
        .unwrap();

    session.query("SELECT a FROM t", ()).exec().await.unwrap();
    session.set_consistency(Consistency::Three);
    session.query("SELECT a FROM t", ()).exec().await.unwrap();
    session
        .query("SELECT a FROM t", ())
        .consistency(Consistency::One)
        .exec()
        .await
        .unwrap();

    let consistencies = node
        .executes()
        .into_iter()
        .map(|params| params.consistency)
        .collect::<Vec<_>>();
    assert_eq!(
        consistencies,
        vec![Consistency::LocalOne, Consistency::Three, Consistency::One]
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn clones_share_the_pool() {
    setup_tracing();
    let node = MockNode::start().await;
    node.add_table(
        "SELECT a FROM t",
        Table::new(&[("a", ColumnType::Int)]).row(&[&3_i32]),
    );
    let session = node.session().await;
    let clone = session.clone();
    drop(session);

    let mut a = 0_i32;
    clone
        .query("SELECT a FROM t", ())
        .scan(&mut [&mut a as &mut dyn Unmarshal])
        .await
        .unwrap();
    assert_eq!(a, 3);
    assert!(!clone.is_closed());
    assert!(format!("{:?}", clone).contains("closed: false"));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn keyspace_is_used_by_every_connection() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node
        .session_builder()
        .keyspace("ks")
        .connections_per_host(2)
        .build()
        .await
        .unwrap();
    while session.pool().size() < 2 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let uses = node
        .queries()
        .into_iter()
        .filter(|(text, _)| text == "USE \"ks\"")
        .count();
    assert_eq!(uses, 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn custom_pool_factory_is_used() {
    setup_tracing();
    let node = MockNode::start().await;
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let factory = {
        let calls = calls.clone();
        let inner = simple_pool_factory();
        Arc::new(
            move |config: SessionConfig,
                  cache: Arc<StatementCache>|
                  -> BoxFuture<'static, Arc<dyn ConnectionPool>> {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                inner(config, cache)
            },
        )
    };

    let session = node
        .session_builder()
        .pool_factory(factory)
        .max_prepared_statements(1)
        .build()
        .await
        .unwrap();
    session.query("SELECT a FROM t", ()).exec().await.unwrap();
    session.query("SELECT b FROM t", ()).exec().await.unwrap();

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(session.statement_cache().len(), 1);
}
