use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kestrel_cql::value::{CqlValue, Unmarshal};

use super::{should_prepare, Binder, BoundValue, Consistency, IntoValues};
use crate::client::pager::Iter;
use crate::client::session::Session;
use crate::errors::{BadQuery, QueryError};
use crate::network::PreparedInfo;
use crate::observability::tracing::Tracer;
use crate::policies::retry::RetryPolicy;

/// Fraction of a page left unread when the next page starts being fetched.
pub const DEFAULT_PREFETCH: f64 = 0.25;

/// A single CQL statement together with its bound values and execution
/// options.
///
/// Queries created through [`Session::query`] inherit the defaults of the
/// session and can be executed directly.
#[derive(Clone)]
pub struct Query {
    pub(crate) session: Option<Session>,
    pub(crate) stmt: String,
    pub(crate) values: Vec<BoundValue>,
    pub(crate) binding: Option<Binder>,
    pub(crate) consistency: Consistency,
    pub(crate) page_size: i32,
    pub(crate) paging_state: Option<Bytes>,
    pub(crate) prefetch: f64,
    pub(crate) tracer: Option<Arc<dyn Tracer>>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) attempts: u32,
    pub(crate) total_latency: Duration,
}

impl Query {
    /// Creates a query that is not attached to any session. Such a query
    /// can still be run through [`Connection::execute_query`](crate::network::Connection::execute_query).
    pub fn new(stmt: impl Into<String>) -> Self {
        Query {
            session: None,
            stmt: stmt.into(),
            values: Vec::new(),
            binding: None,
            consistency: Consistency::default(),
            page_size: 0,
            paging_state: None,
            prefetch: DEFAULT_PREFETCH,
            tracer: None,
            retry_policy: None,
            attempts: 0,
            total_latency: Duration::ZERO,
        }
    }

    /// Replaces the bound values.
    pub fn values(mut self, values: impl IntoValues) -> Self {
        self.values = values.into_values();
        self
    }

    /// Computes the bound values from the prepared statement's bind markers,
    /// instead of using fixed values.
    pub fn bind<F>(mut self, binder: F) -> Self
    where
        F: Fn(&PreparedInfo) -> Result<Vec<BoundValue>, QueryError> + Send + Sync + 'static,
    {
        self.binding = Some(Arc::new(binder));
        self
    }

    /// Sets the consistency level.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Sets the number of rows per page. Zero or less disables paging.
    pub fn page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Continues paging from a state returned by [`Iter::page_state`].
    pub fn page_state(mut self, paging_state: Bytes) -> Self {
        self.paging_state = Some(paging_state);
        self
    }

    /// Sets when the next page is requested: once only `prefetch` of the
    /// current page remains unread.
    pub fn prefetch(mut self, prefetch: f64) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Requests tracing and reports the trace to `tracer`.
    pub fn trace(mut self, tracer: Option<Arc<dyn Tracer>>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets the policy deciding whether a failed attempt is retried.
    pub fn retry_policy(mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Statement text.
    pub fn contents(&self) -> &str {
        &self.stmt
    }

    /// Gets the consistency to be used when executing this query.
    pub fn get_consistency(&self) -> Consistency {
        self.consistency
    }

    /// Gets the page size.
    pub fn get_page_size(&self) -> i32 {
        self.page_size
    }

    /// Number of attempts made by the last execution.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mean duration of the attempts of the last execution.
    pub fn latency(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.attempts
    }

    pub(crate) fn should_prepare(&self) -> bool {
        should_prepare(&self.stmt)
    }

    pub(crate) fn bound_values(&self, info: &PreparedInfo) -> Result<Vec<BoundValue>, QueryError> {
        match &self.binding {
            Some(binder) => binder(info),
            None => Ok(self.values.clone()),
        }
    }

    /// Executes the query and returns an iterator over its rows.
    ///
    /// Errors are reported through [`Iter::close`].
    pub async fn iter(&mut self) -> Iter {
        if self.stmt.to_lowercase().starts_with("use") {
            return Iter::with_error(BadQuery::UseStatement.into());
        }
        match self.session.clone() {
            Some(session) => session.execute_query(self).await,
            None => Iter::with_error(QueryError::NoConnections),
        }
    }

    /// Executes the query, discarding any rows.
    pub async fn exec(&mut self) -> Result<(), QueryError> {
        self.iter().await.close()
    }

    /// Executes the query and decodes the first row into `dest`.
    /// Fails with [`QueryError::NotFound`] when there is no row.
    pub async fn scan(&mut self, dest: &mut [&mut dyn Unmarshal]) -> Result<(), QueryError> {
        let mut iter = self.iter().await;
        iter.check_err_and_not_found()?;
        iter.scan(dest).await;
        iter.close()
    }

    /// Executes the query and stores the first row in `dest`, by column name.
    pub async fn map_scan(&mut self, dest: &mut HashMap<String, CqlValue>) -> Result<(), QueryError> {
        let mut iter = self.iter().await;
        iter.check_err_and_not_found()?;
        iter.map_scan(dest).await;
        iter.close()
    }

    /// Executes a lightweight transaction and returns whether it was applied.
    ///
    /// When it was not, the current values of the row are decoded into `dest`.
    pub async fn scan_cas(&mut self, dest: &mut [&mut dyn Unmarshal]) -> Result<bool, QueryError> {
        let mut iter = self.iter().await;
        iter.check_err_and_not_found()?;
        let mut applied = false;
        // A single column is only `[applied]`; the row values come along otherwise.
        let dest: &mut [&mut dyn Unmarshal] = if iter.columns().len() > 1 {
            dest
        } else {
            &mut []
        };
        iter.scan_applied(&mut applied, dest).await;
        iter.close()?;
        Ok(applied)
    }

    /// Like [`Query::scan_cas`], storing the row in `dest` by column name.
    pub async fn map_scan_cas(
        &mut self,
        dest: &mut HashMap<String, CqlValue>,
    ) -> Result<bool, QueryError> {
        let mut iter = self.iter().await;
        iter.check_err_and_not_found()?;
        iter.map_scan(dest).await;
        let applied = dest
            .remove("[applied]")
            .and_then(|applied| applied.as_boolean())
            .unwrap_or(false);
        iter.close()?;
        Ok(applied)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("stmt", &self.stmt)
            .field("values", &self.values.len())
            .field("consistency", &self.consistency)
            .field("page_size", &self.page_size)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

impl From<String> for Query {
    fn from(s: String) -> Query {
        Query::new(s)
    }
}

impl<'a> From<&'a str> for Query {
    fn from(s: &'a str) -> Query {
        Query::new(s.to_owned())
    }
}
