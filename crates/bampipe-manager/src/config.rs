use std::time::Duration;

/// Deadline of every producer/consumer grant or release wait.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What a negotiation wait does when its deadline passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Log and carry on as if the wait completed.
    #[default]
    BestEffort,
    /// Return [`BamError::Timeout`](crate::BamError::Timeout).
    FailFast,
}

/// Runtime options of a [`BamManager`](crate::BamManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub negotiation_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// Capacity of the collaborator event queue.
    pub event_queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            timeout_policy: TimeoutPolicy::default(),
            event_queue_depth: 64,
        }
    }
}
