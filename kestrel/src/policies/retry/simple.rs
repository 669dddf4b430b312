use super::{RequestInfo, RetryPolicy};

/// Retries a failed request up to `num_retries` times, whatever the error.
///
/// A request executed with `SimpleRetryPolicy { num_retries: 5 }` is sent at
/// most six times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleRetryPolicy {
    /// How many times a request may be retried after its first attempt
    pub num_retries: u32,
}

impl SimpleRetryPolicy {
    /// Creates a policy allowing `num_retries` retries.
    pub fn new(num_retries: u32) -> SimpleRetryPolicy {
        SimpleRetryPolicy { num_retries }
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn attempt(&self, request_info: RequestInfo<'_>) -> bool {
        request_info.attempts <= self.num_retries
    }
}
