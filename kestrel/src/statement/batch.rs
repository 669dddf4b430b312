use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{Binder, BoundValue, BatchType, Consistency, IntoValues};
use crate::errors::QueryError;
use crate::network::PreparedInfo;
use crate::policies::retry::RetryPolicy;

/// Largest number of statements a BATCH frame can carry.
pub const BATCH_SIZE_MAXIMUM: usize = 65535;

/// One statement of a [`Batch`].
#[derive(Clone)]
pub struct BatchEntry {
    /// Statement text.
    pub stmt: String,
    /// Bound values, used unless `binding` is set.
    pub args: Vec<BoundValue>,
    /// Computes the bound values from the prepared statement.
    pub binding: Option<Binder>,
}

impl BatchEntry {
    // Entries without values are sent as text, everything else is prepared.
    pub(crate) fn is_prepared(&self) -> bool {
        !self.args.is_empty() || self.binding.is_some()
    }

    pub(crate) fn bound_values(&self, info: &PreparedInfo) -> Result<Vec<BoundValue>, QueryError> {
        match &self.binding {
            Some(binder) => binder(info),
            None => Ok(self.args.clone()),
        }
    }
}

impl fmt::Debug for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEntry")
            .field("stmt", &self.stmt)
            .field("args", &self.args.len())
            .field("binding", &self.binding.is_some())
            .finish()
    }
}

/// Statements applied together through a single BATCH request.
#[derive(Clone)]
pub struct Batch {
    /// Logged, unlogged or counter batch.
    pub batch_type: BatchType,
    /// Statements, in execution order.
    pub entries: Vec<BatchEntry>,
    /// Consistency level of the whole batch.
    pub consistency: Consistency,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) attempts: u32,
    pub(crate) total_latency: Duration,
}

impl Batch {
    /// Creates an empty batch of the given type.
    pub fn new(batch_type: BatchType) -> Self {
        Batch {
            batch_type,
            entries: Vec::new(),
            consistency: Consistency::default(),
            retry_policy: None,
            attempts: 0,
            total_latency: Duration::ZERO,
        }
    }

    /// Appends a statement with its bound values.
    pub fn query(&mut self, stmt: impl Into<String>, values: impl IntoValues) {
        self.entries.push(BatchEntry {
            stmt: stmt.into(),
            args: values.into_values(),
            binding: None,
        });
    }

    /// Appends a statement whose values are computed once it is prepared.
    pub fn bind<F>(&mut self, stmt: impl Into<String>, binder: F)
    where
        F: Fn(&PreparedInfo) -> Result<Vec<BoundValue>, QueryError> + Send + Sync + 'static,
    {
        self.entries.push(BatchEntry {
            stmt: stmt.into(),
            args: Vec::new(),
            binding: Some(Arc::new(binder)),
        });
    }

    /// Sets the consistency to be used when executing this batch.
    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.consistency = consistency;
    }

    /// Gets the consistency to be used when executing this batch.
    pub fn get_consistency(&self) -> Consistency {
        self.consistency
    }

    /// Sets the policy deciding whether a failed attempt is retried.
    pub fn set_retry_policy(&mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) {
        self.retry_policy = retry_policy;
    }

    /// Gets the retry policy of this batch.
    pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry_policy.as_ref()
    }

    /// Number of statements.
    pub fn size(&self) -> usize {
        self.entries.len()
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
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new(BatchType::Logged)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("batch_type", &self.batch_type)
            .field("entries", &self.entries)
            .field("consistency", &self.consistency)
            .finish_non_exhaustive()
    }
}
