use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::future::join_all;
use kestrel::errors::QueryError;
use kestrel::frame::ColumnType;
use kestrel::network::{Connection, ConnectionConfig, StatementCache};
use kestrel::value::Unmarshal;
use kestrel::{Consistency, Query};

use crate::utils::{setup_tracing, MockNode, Received, Table};

async fn open(node: &MockNode, config: ConnectionConfig) -> Arc<Connection> {
    let (connection, _errors) =
        Connection::open(&node.addr(), config, Arc::new(StatementCache::default()))
            .await
            .unwrap();
    Arc::new(connection)
}

async fn first_int(connection: &Arc<Connection>, statement: &str) -> Result<i32, QueryError> {
    let mut iter = connection.execute_query(&Query::new(statement)).await?;
    let mut value = 0_i32;
    iter.scan(&mut [&mut value as &mut dyn Unmarshal]).await;
    iter.close()?;
    Ok(value)
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn startup_announces_cql_version() {
    setup_tracing();
    let node = MockNode::start().await;
    let connection = open(&node, ConnectionConfig::default()).await;

    let options = node
        .received()
        .into_iter()
        .find_map(|received| match received {
            Received::Startup(options) => Some(options),
            _ => None,
        })
        .unwrap();
    assert_eq!(options.get("CQL_VERSION").map(String::as_str), Some("3.0.0"));
    assert!(!options.contains_key("COMPRESSION"));

    connection.ping().await.unwrap();
    assert!(node.received().contains(&Received::Options));
    assert_eq!(connection.address(), node.addr());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn select_is_prepared_then_executed() {
    setup_tracing();
    let node = MockNode::start().await;
    node.add_table(
        "SELECT a FROM t",
        Table::new(&[("a", ColumnType::Int)]).row(&[&7_i32]),
    );
    let connection = open(&node, ConnectionConfig::default()).await;

    let query = Query::new("SELECT a FROM t").consistency(Consistency::One);
    let mut iter = connection.execute_query(&query).await.unwrap();
    let mut a = 0_i32;
    assert!(iter.scan(&mut [&mut a as &mut dyn Unmarshal]).await);
    assert_eq!(a, 7);
    assert!(!iter.scan(&mut [&mut a as &mut dyn Unmarshal]).await);
    iter.close().unwrap();

    assert_eq!(node.prepares(), vec!["SELECT a FROM t".to_owned()]);
    let executes = node.executes();
    assert_eq!(executes.len(), 1);
    assert_eq!(executes[0].consistency, Consistency::One);
    assert!(node.queries().is_empty());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn use_keyspace_switches_the_connection() {
    setup_tracing();
    let node = MockNode::start().await;
    let connection = open(&node, ConnectionConfig::default()).await;

    connection.use_keyspace("ks").await.unwrap();
    assert_eq!(connection.keyspace(), "ks");
    let (text, params) = node.queries().pop().unwrap();
    assert_eq!(text, "USE \"ks\"");
    assert_eq!(params.consistency, Consistency::Any);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn requests_wait_for_a_free_stream() {
    setup_tracing();
    let node = MockNode::start().await;
    node.add_table(
        "SELECT a FROM t",
        Table::new(&[("a", ColumnType::Int)])
            .row(&[&1_i32])
            .delay(Duration::from_millis(10)),
    );
    let config = ConnectionConfig {
        num_streams: 2,
        ..Default::default()
    };
    let connection = open(&node, config).await;

    let results = join_all((0..50).map(|_| first_int(&connection, "SELECT a FROM t"))).await;
    assert!(results.into_iter().all(|result| result.unwrap() == 1));
    assert_eq!(connection.available_streams(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn responses_are_routed_by_stream_id() {
    setup_tracing();
    let node = MockNode::start().await;
    node.add_table(
        "SELECT slow FROM t",
        Table::new(&[("slow", ColumnType::Int)])
            .row(&[&1_i32])
            .delay(Duration::from_millis(300)),
    );
    node.add_table(
        "SELECT fast FROM t",
        Table::new(&[("fast", ColumnType::Int)]).row(&[&2_i32]),
    );
    let connection = open(&node, ConnectionConfig::default()).await;

    let slow = tokio::spawn({
        let connection = connection.clone();
        async move { first_int(&connection, "SELECT slow FROM t").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first_int(&connection, "SELECT fast FROM t").await.unwrap(), 2);
    assert!(!slow.is_finished());
    assert_eq!(slow.await.unwrap().unwrap(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn silent_node_times_out_after_a_ping() {
    setup_tracing();
    let node = MockNode::start().await;
    let config = ConnectionConfig {
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let connection = open(&node, config).await;

    // Silence without requests in flight is fine.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!connection.is_closed());

    node.stall();
    node.clear_received();
    let result = connection
        .execute_query(&Query::new("CREATE TABLE t (a int)"))
        .await;
    assert_matches!(result, Err(QueryError::TimeoutError));
    assert!(node.received().contains(&Received::Options));
    assert!(connection.is_closed());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn dropped_socket_fails_requests_in_flight() {
    setup_tracing();
    let node = MockNode::start().await;
    let (connection, errors) = Connection::open(
        &node.addr(),
        ConnectionConfig::default(),
        Arc::new(StatementCache::default()),
    )
    .await
    .unwrap();
    let connection = Arc::new(connection);

    node.stall();
    let pending = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .execute_query(&Query::new("CREATE TABLE t (a int)"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    node.kill_connections();

    assert_matches!(
        pending.await.unwrap(),
        Err(QueryError::BrokenConnection(_) | QueryError::IoError(_))
    );
    assert!(errors.await.is_ok());
    assert!(connection.is_closed());
    assert_matches!(
        connection.ping().await,
        Err(QueryError::BrokenConnection(_))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn close_is_idempotent() {
    setup_tracing();
    let node = MockNode::start().await;
    let connection = open(&node, ConnectionConfig::default()).await;

    connection.close();
    connection.close();
    assert!(connection.is_closed());
    assert_matches!(
        connection.ping().await,
        Err(QueryError::BrokenConnection(_))
    );
}
