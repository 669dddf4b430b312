//! Errors returned by the driver.

use std::sync::Arc;

use kestrel_cql::frame::frame_errors::{FrameError, ParseError, RequestSerializationError};
use kestrel_cql::frame::response;
use kestrel_cql::value::{MarshalError, UnmarshalError};
use thiserror::Error;

pub use kestrel_cql::frame::response::error::{DbError, WriteType};

/// Error that occurred during query execution
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Caller passed an invalid query
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// Unexpected message received
    #[error("Protocol Error: {0}")]
    ProtocolError(&'static str),

    /// Invalid message received
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Timeout error has occurred, function didn't complete in time.
    #[error("Timeout Error")]
    TimeoutError,

    /// A single-row read returned no rows.
    #[error("not found")]
    NotFound,

    /// The pool had no connection to hand out, even after trying to refill.
    #[error("no connections available")]
    NoConnections,

    /// The session was closed before or while the request was made.
    #[error("session has been closed")]
    SessionClosed,

    /// The request can not be expressed in the protocol version of the connection.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Authentication was requested by the server and failed or could not be performed.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The connection the request was sent on has been closed.
    #[error("Connection broken: {0}")]
    BrokenConnection(String),

    /// Failed to serialize the request into a frame.
    #[error("Failed to serialize request: {0}")]
    RequestSerialization(#[from] RequestSerializationError),

    /// A bound value could not be encoded for its bind marker.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// A cell could not be decoded into the scan destination.
    #[error(transparent)]
    Unmarshal(#[from] UnmarshalError),
}

impl QueryError {
    /// Server errors with this code mean the prepared statement id is unknown
    /// to the node that received it.
    pub(crate) fn unprepared_id(&self) -> Option<&bytes::Bytes> {
        match self {
            QueryError::DbError(DbError::Unprepared { statement_id }, _) => Some(statement_id),
            _ => None,
        }
    }
}

impl From<std::io::Error> for QueryError {
    fn from(io_error: std::io::Error) -> QueryError {
        QueryError::IoError(Arc::new(io_error))
    }
}

impl From<ParseError> for QueryError {
    fn from(parse_error: ParseError) -> QueryError {
        QueryError::InvalidMessage(format!("Error parsing message: {}", parse_error))
    }
}

impl From<FrameError> for QueryError {
    fn from(frame_error: FrameError) -> QueryError {
        match frame_error {
            FrameError::StdIoError(io_error) => QueryError::IoError(Arc::new(io_error)),
            other => QueryError::InvalidMessage(format!("Frame error: {}", other)),
        }
    }
}

impl From<response::Error> for QueryError {
    fn from(error: response::Error) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}

/// Error caused by the caller, detected before anything is sent to the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadQuery {
    /// The number of bound values differs from the number of bind markers.
    #[error("query argument length mismatch: expected {expected} values, got {got}")]
    ArgLength { expected: usize, got: usize },

    /// A batch holds more statements than a BATCH frame can carry.
    #[error("too many statements in batch: {0} > 65535")]
    TooManyStatements(usize),

    /// Keyspaces are switched through the session configuration, never by a statement.
    #[error("use statements will have no effect, please set the keyspace in the session configuration")]
    UseStatement,

    /// The number of scan destinations differs from the number of columns.
    #[error("count mismatch: {expected} columns, {got} destinations")]
    ScanCountMismatch { expected: usize, got: usize },
}

/// Error that occurred during session creation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// The configuration did not name any node.
    #[error("no hosts provided")]
    NoHosts,

    /// None of the known nodes accepted a connection.
    #[error("no connections were made when creating the session")]
    NoConnectionsStarted,
}
