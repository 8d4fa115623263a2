/// Errors reported by the hardware collaborators behind the pipe manager.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No free endpoint is left on the bus instance.
    #[error("no free pipe endpoint available")]
    EndpointExhausted,

    /// A physical address could not be resolved to a device handle.
    #[error("no device registered at physical address {0:#x}")]
    InvalidAddress(u32),

    /// Backend-managed FIFO setup failed.
    #[error("fifo setup failed at offset {offset:#x} ({size} bytes)")]
    FifoSetup { offset: u32, size: u32 },

    /// The endpoint connect call was rejected by the backend.
    #[error("endpoint connect failed: {reason}")]
    ConnectFailed { reason: String },

    /// A clock required for private memory is not available.
    #[error("clock unavailable: {0}")]
    ClockUnavailable(&'static str),

    /// A fixed physical window could not be mapped.
    #[error("failed to map {size} bytes at {phys:#x}")]
    Mapping { phys: u64, size: u32 },

    /// Coherent memory allocation failed.
    #[error("failed to allocate {size} bytes of coherent memory")]
    AllocationFailed { size: u32 },

    /// An external service refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The operation is not supported by this collaborator.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The event queue towards the manager is full; the event was dropped.
    #[error("event queue full")]
    EventQueueFull,

    /// The manager stopped consuming events.
    #[error("event queue closed")]
    EventQueueClosed,
}

impl BackendError {
    /// Whether the failure is a resource allocation failure rather than a
    /// transport-level error.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            BackendError::EndpointExhausted | BackendError::AllocationFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
