//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to execute CQL requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use futures::future::RemoteHandle;
use futures::FutureExt;
use tracing::{debug, trace};

use super::pager::Iter;
use super::session_builder::SessionConfig;
use crate::cluster::RingDescriber;
use crate::errors::{BadQuery, NewSessionError, QueryError};
use crate::network::{simple_pool_factory, ConnectionPool, PreparedInfo, StatementCache};
use crate::observability::tracing::Tracer;
use crate::policies::retry::RequestInfo;
use crate::statement::batch::{Batch, BATCH_SIZE_MAXIMUM};
use crate::statement::query::Query;
use crate::statement::{BatchType, BoundValue, Consistency, IntoValues};

/// `Session` manages connections to the cluster and allows to execute CQL requests.
///
/// Cloning a session is cheap; clones share the connection pool. The
/// session is closed by [`Session::close`] or when its last clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pool: Arc<dyn ConnectionPool>,
    cache: Arc<StatementCache>,
    config: SessionConfig,
    defaults: StdMutex<QueryDefaults>,
    closed: AtomicBool,
    discovery: StdMutex<Option<RemoteHandle<()>>>,
}

// Options copied into every query created by the session.
#[derive(Clone)]
struct QueryDefaults {
    consistency: Consistency,
    page_size: i32,
    prefetch: f64,
    tracer: Option<Arc<dyn Tracer>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.pool.close();
        }
    }
}

impl Session {
    /// Estabilishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](crate::client::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly, because it's more convenient.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::NoHosts);
        }

        let cache = config.statement_cache.clone().unwrap_or_default();
        cache.resize(config.max_prepared_statements);

        let pool_factory = config
            .pool_factory
            .clone()
            .unwrap_or_else(simple_pool_factory);
        let pool = pool_factory(config.clone(), cache.clone()).await;
        if pool.size() == 0 {
            pool.close();
            return Err(NewSessionError::NoConnectionsStarted);
        }

        let discovery = config.discover_hosts.then(|| {
            let describer = RingDescriber::new(pool.clone(), &config);
            let (task, handle) = describer.run(config.discovery.sleep).remote_handle();
            tokio::spawn(task);
            handle
        });

        debug!("Session connected to {:?}", config.known_nodes);
        let defaults = QueryDefaults {
            consistency: config.consistency,
            page_size: config.page_size,
            prefetch: config.prefetch,
            tracer: config.tracer.clone(),
        };
        Ok(Session {
            inner: Arc::new(SessionInner {
                pool,
                cache,
                config,
                defaults: StdMutex::new(defaults),
                closed: AtomicBool::new(false),
                discovery: StdMutex::new(discovery),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<SessionInner>) -> Option<Session> {
        inner.upgrade().map(|inner| Session { inner })
    }

    fn defaults(&self) -> QueryDefaults {
        self.inner.defaults.lock().unwrap().clone()
    }

    /// Creates a query bound to `values`, using the session defaults.
    ///
    /// # Example
    /// ```rust
    /// # use kestrel::Session;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    /// session
    ///     .query("INSERT INTO ks.tab (a, b) VALUES(?, ?)", (2_i32, "some text"))
    ///     .exec()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn query(&self, stmt: impl Into<String>, values: impl IntoValues) -> Query {
        let defaults = self.defaults();
        let mut query = Query::new(stmt)
            .values(values)
            .consistency(defaults.consistency)
            .page_size(defaults.page_size)
            .prefetch(defaults.prefetch)
            .trace(defaults.tracer)
            .retry_policy(self.inner.config.retry_policy.clone());
        query.session = Some(self.clone());
        query
    }

    /// Creates a query whose values are computed by `binder` once the
    /// statement is prepared.
    pub fn bind<F>(&self, stmt: impl Into<String>, binder: F) -> Query
    where
        F: Fn(&PreparedInfo) -> Result<Vec<BoundValue>, QueryError> + Send + Sync + 'static,
    {
        self.query(stmt, ()).bind(binder)
    }

    /// Creates an empty batch using the session defaults.
    pub fn batch(&self, batch_type: BatchType) -> Batch {
        let mut batch = Batch::new(batch_type);
        batch.set_consistency(self.defaults().consistency);
        batch.set_retry_policy(self.inner.config.retry_policy.clone());
        batch
    }

    /// Sets the consistency of queries and batches created from now on.
    pub fn set_consistency(&self, consistency: Consistency) {
        self.inner.defaults.lock().unwrap().consistency = consistency;
    }

    /// Sets the page size of queries created from now on.
    pub fn set_page_size(&self, page_size: i32) {
        self.inner.defaults.lock().unwrap().page_size = page_size;
    }

    /// Sets the prefetch fraction of queries created from now on.
    pub fn set_prefetch(&self, prefetch: f64) {
        self.inner.defaults.lock().unwrap().prefetch = prefetch;
    }

    /// Sets the tracer of queries created from now on. `None` disables tracing.
    pub fn set_trace(&self, tracer: Option<Arc<dyn Tracer>>) {
        self.inner.defaults.lock().unwrap().tracer = tracer;
    }

    /// Runs `query`, retrying failed attempts as its retry policy allows.
    pub(crate) async fn execute_query(&self, query: &mut Query) -> Iter {
        if self.is_closed() {
            return Iter::with_error(QueryError::SessionClosed);
        }
        query.attempts = 0;
        query.total_latency = Duration::ZERO;

        loop {
            let Some(connection) = self.inner.pool.pick(Some(&*query)).await else {
                return Iter::with_error(QueryError::NoConnections);
            };

            let start = Instant::now();
            let result = connection.execute_query(query).await;
            query.total_latency += start.elapsed();
            query.attempts += 1;

            let error = match result {
                Ok(iter) => return iter,
                Err(error) => error,
            };
            let retry = query.retry_policy.as_ref().is_some_and(|policy| {
                policy.attempt(RequestInfo {
                    error: &error,
                    attempts: query.attempts,
                    consistency: query.consistency,
                })
            });
            if !retry {
                return Iter::with_error(error);
            }
            trace!(
                "[{}] Retrying {:?} after: {}",
                connection.address(),
                query.contents(),
                error
            );
        }
    }

    /// Executes `batch`, retrying failed attempts as its retry policy allows.
    pub async fn execute_batch(&self, batch: &mut Batch) -> Result<(), QueryError> {
        if self.is_closed() {
            return Err(QueryError::SessionClosed);
        }
        if batch.size() > BATCH_SIZE_MAXIMUM {
            return Err(BadQuery::TooManyStatements(batch.size()).into());
        }
        batch.attempts = 0;
        batch.total_latency = Duration::ZERO;

        loop {
            let Some(connection) = self.inner.pool.pick(None).await else {
                return Err(QueryError::NoConnections);
            };

            let start = Instant::now();
            let result = connection.execute_batch(batch).await;
            batch.total_latency += start.elapsed();
            batch.attempts += 1;

            let error = match result {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            let retry = batch.get_retry_policy().is_some_and(|policy| {
                policy.attempt(RequestInfo {
                    error: &error,
                    attempts: batch.attempts,
                    consistency: batch.consistency,
                })
            });
            if !retry {
                return Err(error);
            }
            trace!("[{}] Retrying batch after: {}", connection.address(), error);
        }
    }

    /// Closes every connection. Requests made afterwards fail with
    /// [`QueryError::SessionClosed`]. Calling it again has no effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        debug!("Closing session");
        self.inner.discovery.lock().unwrap().take();
        self.inner.pool.close();
    }

    /// Whether [`Session::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Connection pool of the session.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.inner.pool
    }

    /// Prepared statement cache of the session.
    pub fn statement_cache(&self) -> &Arc<StatementCache> {
        &self.inner.cache
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .field("pool_size", &self.inner.pool.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}
