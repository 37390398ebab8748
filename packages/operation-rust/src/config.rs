//! Operation engine configuration.

use std::time::Duration;

/// Per-operation tuning shared by every operation an `End` creates.
///
/// Controls deadline defaults, flow-control windows and reorder tolerance.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    /// Timeout applied when a call does not carry one. `None` means unlimited.
    pub default_timeout: Option<Duration>,
    /// Upper bound for any requested timeout. When set, an unlimited request
    /// is clamped to this value as well.
    pub maximum_timeout: Option<Duration>,
    /// Allowance advertised to the peer, refilled as customer code consumes.
    pub ingestion_window: u64,
    /// Outbound payloads queued while waiting for allowance before
    /// `Operator::consume` suspends the producer.
    pub emission_queue_capacity: usize,
    /// Inbound tickets held while a sequence gap is open.
    pub reorder_limit: usize,
}

impl OperationConfig {
    /// Resolves the timeout an operation actually runs with.
    #[must_use]
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match (requested.or(self.default_timeout), self.maximum_timeout) {
            (Some(timeout), Some(maximum)) => Some(timeout.min(maximum)),
            (Some(timeout), None) => Some(timeout),
            (None, maximum) => maximum,
        }
    }
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            maximum_timeout: None,
            ingestion_window: 16,
            emission_queue_capacity: 16,
            reorder_limit: 64,
        }
    }
}
