use std::sync::Arc;

use assert_matches::assert_matches;
use kestrel::authentication::PlainTextAuthenticator;
use kestrel::errors::{DbError, NewSessionError, QueryError};
use kestrel::network::{Connection, ConnectionConfig, StatementCache};

use crate::utils::{setup_tracing, MockNode, Received};

#[tokio::test]
#[ntest::timeout(20000)]
async fn password_is_sent_when_asked_for() {
    setup_tracing();
    let node = MockNode::start().await;
    node.require_password("cassandra", "secret");

    let session = node
        .session_builder()
        .user("cassandra", "secret")
        .build()
        .await
        .unwrap();
    session
        .query("CREATE TABLE t (a int PRIMARY KEY)", ())
        .exec()
        .await
        .unwrap();

    assert!(node
        .received()
        .contains(&Received::AuthResponse(Some(b"\0cassandra\0secret".to_vec()))));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn wrong_password_fails_the_session() {
    setup_tracing();
    let node = MockNode::start().await;
    node.require_password("cassandra", "secret");

    assert_matches!(
        node.session_builder()
            .user("cassandra", "guess")
            .build()
            .await,
        Err(NewSessionError::NoConnectionsStarted)
    );
    assert_matches!(
        node.session_builder().build().await,
        Err(NewSessionError::NoConnectionsStarted)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn connection_reports_why_authentication_failed() {
    setup_tracing();
    let node = MockNode::start().await;
    node.require_password("cassandra", "secret");
    let cache = Arc::new(StatementCache::default());

    let result = Connection::open(&node.addr(), ConnectionConfig::default(), cache.clone()).await;
    assert_matches!(result, Err(QueryError::AuthenticationError(_)));

    let config = ConnectionConfig {
        authenticator: Some(Arc::new(PlainTextAuthenticator::new("cassandra", "guess"))),
        ..Default::default()
    };
    let result = Connection::open(&node.addr(), config, cache.clone()).await;
    assert_matches!(
        result,
        Err(QueryError::DbError(DbError::AuthenticationError, _))
    );

    let config = ConnectionConfig {
        authenticator: Some(Arc::new(PlainTextAuthenticator::new("cassandra", "secret"))),
        ..Default::default()
    };
    let (connection, _errors) = Connection::open(&node.addr(), config, cache).await.unwrap();
    connection.ping().await.unwrap();
}
