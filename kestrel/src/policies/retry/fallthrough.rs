use super::{RequestInfo, RetryPolicy};

/// Forwards all errors directly to the user, never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    /// Creates a new instance of [FallthroughRetryPolicy].
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn attempt(&self, _request_info: RequestInfo<'_>) -> bool {
        false
    }
}
