//! Retry policies decide whether a failed request is attempted again.

mod fallthrough;
mod retry_policy;
mod simple;

pub use fallthrough::FallthroughRetryPolicy;
pub use retry_policy::{RequestInfo, RetryPolicy};
pub use simple::SimpleRetryPolicy;
