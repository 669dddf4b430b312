//! Row iteration over paged results.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use kestrel_cql::frame::response::result::{ColumnSpec, Row, Rows};
use kestrel_cql::value::{CqlValue, Unmarshal};
use tracing::trace;

use crate::errors::{BadQuery, QueryError};
use crate::network::Connection;
use crate::statement::query::Query;

/// Iterator over the rows returned by a query.
///
/// Holds one page at a time. When the node reports more pages, the next one
/// is requested in the background once the unread part of the current page
/// drops to the query's prefetch fraction, and awaited when the current page
/// runs out.
///
/// Errors stop the iteration and are returned by [`Iter::close`].
pub struct Iter {
    error: Option<QueryError>,
    pos: usize,
    rows: Vec<Row>,
    columns: Vec<ColumnSpec>,
    paging_state: Option<Bytes>,
    next: Option<Box<NextPage>>,
}

struct NextPage {
    query: Query,
    // Pages of queries that do not belong to a session are fetched on the
    // connection that served the first page.
    connection: Option<Arc<Connection>>,
    // Row position at which the prefetch starts.
    pos: usize,
    prefetch: Option<RemoteHandle<Iter>>,
}

impl NextPage {
    fn start_prefetch(&mut self) {
        if self.prefetch.is_some() {
            return;
        }
        trace!("Prefetching next page of {:?}", self.query.contents());
        let (task, handle) =
            fetch_page(self.query.clone(), self.connection.clone()).remote_handle();
        tokio::spawn(task);
        self.prefetch = Some(handle);
    }

    async fn fetch(self) -> Iter {
        match self.prefetch {
            Some(handle) => handle.await,
            None => fetch_page(self.query, self.connection).await,
        }
    }
}

async fn fetch_page(mut query: Query, connection: Option<Arc<Connection>>) -> Iter {
    match (connection, query.session.clone()) {
        (Some(connection), _) => connection
            .execute_query(&query)
            .await
            .unwrap_or_else(Iter::with_error),
        (None, Some(session)) => session.execute_query(&mut query).await,
        (None, None) => Iter::with_error(QueryError::NoConnections),
    }
}

impl Iter {
    pub(crate) fn new(rows: Rows, query: &Query, connection: Arc<Connection>) -> Self {
        let Rows { metadata, rows } = rows;
        let next = metadata.paging_state.clone().map(|paging_state| {
            let mut query = query.clone();
            query.paging_state = Some(paging_state);
            let pos = ((1.0 - query.prefetch) * rows.len() as f64) as usize;
            Box::new(NextPage {
                connection: query.session.is_none().then_some(connection),
                query,
                pos: pos.max(1),
                prefetch: None,
            })
        });
        Iter {
            error: None,
            pos: 0,
            rows,
            columns: metadata.col_specs,
            paging_state: metadata.paging_state,
            next,
        }
    }

    pub(crate) fn empty() -> Self {
        Iter {
            error: None,
            pos: 0,
            rows: Vec::new(),
            columns: Vec::new(),
            paging_state: None,
            next: None,
        }
    }

    pub(crate) fn with_error(error: QueryError) -> Self {
        Iter {
            error: Some(error),
            ..Iter::empty()
        }
    }

    /// Columns of the returned rows.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Paging state of the current page, to resume paging later through
    /// [`Query::page_state`].
    pub fn page_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    /// Number of rows in the current page.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Error the iteration stopped on, if any.
    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub(crate) fn check_err_and_not_found(&mut self) -> Result<(), QueryError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if self.rows.is_empty() {
            return Err(QueryError::NotFound);
        }
        Ok(())
    }

    // Makes `self.pos` point at a readable row, fetching following pages as
    // needed. Returns false when the rows are exhausted or an error occurred.
    async fn advance(&mut self) -> bool {
        loop {
            if self.error.is_some() {
                return false;
            }
            if self.pos < self.rows.len() {
                break;
            }
            match self.next.take() {
                Some(next) => *self = next.fetch().await,
                None => return false,
            }
        }
        if let Some(next) = self.next.as_mut() {
            if self.pos == next.pos {
                next.start_prefetch();
            }
        }
        true
    }

    /// Decodes the next row into `dest`, one destination per column.
    /// Returns false once the rows are exhausted or on error.
    pub async fn scan(&mut self, dest: &mut [&mut dyn Unmarshal]) -> bool {
        self.advance().await && self.decode_row(None, dest)
    }

    // Like `scan`, with the first column of the row going to `applied`.
    pub(crate) async fn scan_applied(
        &mut self,
        applied: &mut bool,
        dest: &mut [&mut dyn Unmarshal],
    ) -> bool {
        self.advance().await && self.decode_row(Some(applied), dest)
    }

    fn decode_row(
        &mut self,
        leading: Option<&mut dyn Unmarshal>,
        dest: &mut [&mut dyn Unmarshal],
    ) -> bool {
        let got = dest.len() + usize::from(leading.is_some());
        if got != self.columns.len() {
            self.error = Some(
                BadQuery::ScanCountMismatch {
                    expected: self.columns.len(),
                    got,
                }
                .into(),
            );
            return false;
        }
        let mut cells = self.columns.iter().zip(&self.rows[self.pos]);
        if let Some(leading) = leading {
            if let Some((column, cell)) = cells.next() {
                if let Err(err) = leading.unmarshal(&column.typ, cell.as_deref()) {
                    self.error = Some(err.into());
                    return false;
                }
            }
        }
        for ((column, cell), dest) in cells.zip(dest.iter_mut()) {
            if let Err(err) = dest.unmarshal(&column.typ, cell.as_deref()) {
                self.error = Some(err.into());
                return false;
            }
        }
        self.pos += 1;
        true
    }

    /// Decodes the next row into `dest`, keyed by column name.
    pub async fn map_scan(&mut self, dest: &mut HashMap<String, CqlValue>) -> bool {
        if !self.advance().await {
            return false;
        }
        let row = &self.rows[self.pos];
        for (column, cell) in self.columns.iter().zip(row) {
            let mut value = CqlValue::default();
            if let Err(err) = value.unmarshal(&column.typ, cell.as_deref()) {
                self.error = Some(err.into());
                return false;
            }
            dest.insert(column.name.clone(), value);
        }
        self.pos += 1;
        true
    }

    /// Ends the iteration, returning the error it stopped on.
    pub fn close(self) -> Result<(), QueryError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Iter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("error", &self.error)
            .field("pos", &self.pos)
            .field("rows", &self.rows.len())
            .field("columns", &self.columns)
            .field("has_next", &self.next.is_some())
            .finish()
    }
}
