use std::sync::Arc;
use std::sync::Mutex;

use assert_matches::assert_matches;
use kestrel::errors::{DbError, QueryError};
use kestrel::retry::{FallthroughRetryPolicy, RequestInfo, RetryPolicy, SimpleRetryPolicy};
use kestrel::Consistency;

use crate::utils::{setup_tracing, MockNode};

const STATEMENT: &str = "INSERT INTO t (a) VALUES (?)";

fn unavailable() -> DbError {
    DbError::Unavailable {
        consistency: Consistency::Quorum,
        required: 2,
        alive: 1,
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn errors_are_returned_without_a_policy() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session().await;
    node.fail_next(1, DbError::Overloaded);

    let mut query = session.query(STATEMENT, (1_i32,));
    assert_matches!(
        query.exec().await,
        Err(QueryError::DbError(DbError::Overloaded, message)) if message == "forced failure"
    );
    assert_eq!(query.attempts(), 1);
    assert!(query.latency() > std::time::Duration::ZERO);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn failed_attempts_are_retried() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node
        .session_builder()
        .retry_policy(Arc::new(SimpleRetryPolicy::new(3)))
        .build()
        .await
        .unwrap();
    node.fail_next(2, unavailable());

    let mut query = session.query(STATEMENT, (1_i32,));
    query.exec().await.unwrap();
    assert_eq!(query.attempts(), 3);
    assert_eq!(node.executes().len(), 3);

    // Counters start over on every execution.
    query.exec().await.unwrap();
    assert_eq!(query.attempts(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn retries_stop_when_the_policy_gives_up() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session().await;
    node.fail_next(5, unavailable());

    let mut query = session
        .query(STATEMENT, (1_i32,))
        .retry_policy(Some(Arc::new(SimpleRetryPolicy::new(2))));
    assert_matches!(
        query.exec().await,
        Err(QueryError::DbError(DbError::Unavailable { required: 2, alive: 1, .. }, _))
    );
    assert_eq!(query.attempts(), 3);

    let mut query = session
        .query(STATEMENT, (1_i32,))
        .retry_policy(Some(Arc::new(FallthroughRetryPolicy::new())));
    assert!(query.exec().await.is_err());
    assert_eq!(query.attempts(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn five_retries_make_six_attempts() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session().await;
    node.fail_next(100, DbError::Overloaded);

    let mut query = session
        .query(STATEMENT, (1_i32,))
        .retry_policy(Some(Arc::new(SimpleRetryPolicy::new(5))));
    assert!(query.exec().await.is_err());
    assert_eq!(query.attempts(), 6);
    assert_eq!(node.executes().len(), 6);
}

#[derive(Debug, Default)]
struct Recording {
    seen: Mutex<Vec<(u32, Consistency)>>,
}

impl RetryPolicy for Recording {
    fn attempt(&self, request_info: RequestInfo<'_>) -> bool {
        self.seen
            .lock()
            .unwrap()
            .push((request_info.attempts, request_info.consistency));
        matches!(request_info.error, QueryError::DbError(DbError::Overloaded, _))
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn policy_sees_every_failed_attempt() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = node.session().await;
    let policy = Arc::new(Recording::default());
    node.fail_next(2, DbError::Overloaded);
    node.fail_next(1, DbError::Invalid);

    let mut query = session
        .query(STATEMENT, (1_i32,))
        .consistency(Consistency::Two)
        .retry_policy(Some(policy.clone()));
    assert_matches!(
        query.exec().await,
        Err(QueryError::DbError(DbError::Invalid, _))
    );
    assert_eq!(
        *policy.seen.lock().unwrap(),
        vec![
            (1, Consistency::Two),
            (2, Consistency::Two),
            (3, Consistency::Two)
        ]
    );
}
