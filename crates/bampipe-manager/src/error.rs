use std::time::Duration;

use bampipe_backend::BackendError;
use bampipe_config::ConfigError;

/// Errors returned by manager operations.
#[derive(Debug, thiserror::Error)]
pub enum BamError {
    /// A caller-supplied argument is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pipe index beyond the configured table.
    #[error("pipe index {index} out of range ({count} pipes configured)")]
    OutOfRange { index: usize, count: usize },

    /// No connection matches the selector.
    #[error("no matching connection: {0}")]
    NotFound(String),

    /// Endpoint or memory allocation failed.
    #[error("allocation failed: {0}")]
    AllocationFailure(#[source] BackendError),

    /// Transport-level connect, mapping or service error.
    #[error("backend failure: {0}")]
    BackendFailure(#[source] BackendError),

    /// A negotiation wait exceeded its deadline under the fail-fast policy.
    #[error("timed out waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },

    /// A bus instance name did not resolve.
    #[error("unknown bus instance '{0}'")]
    UnknownInstance(String),

    /// The pipe table was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The manager's background tasks are gone.
    #[error("manager is shut down")]
    Shutdown,
}

impl From<BackendError> for BamError {
    fn from(err: BackendError) -> Self {
        if err.is_allocation() {
            BamError::AllocationFailure(err)
        } else {
            BamError::BackendFailure(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, BamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_split_by_kind() {
        assert!(matches!(
            BamError::from(BackendError::EndpointExhausted),
            BamError::AllocationFailure(_)
        ));
        assert!(matches!(
            BamError::from(BackendError::AllocationFailed { size: 64 }),
            BamError::AllocationFailure(_)
        ));
        assert!(matches!(
            BamError::from(BackendError::InvalidAddress(0)),
            BamError::BackendFailure(_)
        ));
    }
}
