//! Request retries configurations\
//! To decide when to retry a request the `Session` can use any object which implements
//! the `RetryPolicy` trait

use kestrel_cql::Consistency;

use crate::errors::QueryError;

/// Information about a failed request attempt
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// The error with which the last attempt failed
    pub error: &'a QueryError,
    /// Number of attempts made so far, the failed one included
    pub attempts: u32,
    /// Consistency the request was sent with
    pub consistency: Consistency,
}

/// Specifies a policy used to decide when to retry a request
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called after every failed attempt. Returning `true` makes the session
    /// pick a connection and try again.
    fn attempt(&self, request_info: RequestInfo<'_>) -> bool;
}
