use std::sync::Arc;

use crate::error::Result;
use crate::event::EventSink;
use crate::types::{
    AcceleratorConnection, AcceleratorRequest, ClientHandle, ConnectParams, DeviceHandle,
    DeviceProps, GrantEvent, MemBuffer, PipeHandle, PipeOptions, RequestStatus, ResourceName,
    StateDomain, TimerMode,
};

/// Wake interrupt routing for one endpoint.
///
/// When the interrupt fires the backend delivers
/// [`BackendEvent::Wake`](crate::BackendEvent::Wake) carrying `token`.
#[derive(Debug, Clone)]
pub struct WakeRegistration {
    pub token: usize,
    pub sink: EventSink,
}

/// Bus-transport primitives: endpoints, FIFOs, connects and timers.
pub trait PipeBackend: Send + Sync {
    /// Register a bus instance. Timer interrupts for the instance are
    /// delivered through `sink`.
    fn register_device(&self, props: &DeviceProps, sink: EventSink) -> Result<DeviceHandle>;

    fn reset_device(&self, device: DeviceHandle) -> Result<()>;

    fn allocate_endpoint(&self) -> Result<PipeHandle>;

    fn free_endpoint(&self, pipe: PipeHandle);

    /// Resolve a physical bus address to a device handle.
    fn map_physical(&self, phys_addr: u32) -> Result<DeviceHandle>;

    /// Carve a FIFO out of backend-managed pipe memory.
    fn setup_pipe_fifo(&self, offset: u32, size: u32) -> Result<MemBuffer>;

    fn connect(&self, pipe: PipeHandle, params: &ConnectParams) -> Result<()>;

    fn disconnect(&self, pipe: PipeHandle) -> Result<()>;

    /// Replace the option flags of a connected endpoint.
    fn set_options(&self, pipe: PipeHandle, options: PipeOptions) -> Result<()>;

    /// Route (or, with `None`, stop routing) wake interrupts of `pipe`.
    fn register_wake_event(&self, pipe: PipeHandle, wake: Option<WakeRegistration>)
        -> Result<()>;

    /// Configure the instance-wide inactivity timer through one of its pipes.
    fn configure_timer(&self, pipe: PipeHandle, mode: TimerMode, timeout_ms: u32) -> Result<()>;

    /// Restart the instance-wide inactivity timer.
    fn reset_timer(&self, pipe: PipeHandle) -> Result<()>;
}

/// Platform memory and the private-RAM clock domain.
pub trait PlatformMemory: Send + Sync {
    /// Whether the two private-RAM clocks were found at probe time.
    fn has_private_clocks(&self) -> bool;

    fn enable_private_clocks(&self) -> Result<()>;

    fn disable_private_clocks(&self);

    /// Write the private RAM bank selection register.
    fn write_private_ram_select(&self, value: u32);

    /// Map a fixed physical window; returns the virtual base.
    fn map_io(&self, phys: u64, size: u32) -> Result<usize>;

    fn unmap_io(&self, base: usize);

    fn zero_fill(&self, base: usize, size: u32);

    fn alloc_coherent(&self, size: u32) -> Result<MemBuffer>;

    fn free_coherent(&self, buffer: &MemBuffer);
}

/// Packet-routing accelerator.
pub trait Accelerator: Send + Sync {
    fn connect(&self, request: &AcceleratorRequest) -> Result<AcceleratorConnection>;

    fn disconnect(&self, client: ClientHandle) -> Result<()>;
}

/// Callbacks the resource service invokes on a consumer resource.
pub trait ConsumerHooks: Send + Sync {
    fn request(&self) -> RequestStatus;

    fn release(&self) -> RequestStatus;
}

/// Producer/consumer grant negotiation service.
pub trait ResourceService: Send + Sync {
    /// Create a producer resource; grant changes are delivered as
    /// [`BackendEvent::Producer`](crate::BackendEvent::Producer).
    fn create_producer(&self, name: ResourceName, sink: EventSink) -> Result<()>;

    fn create_consumer(&self, name: ResourceName, hooks: Arc<dyn ConsumerHooks>) -> Result<()>;

    fn request(&self, name: ResourceName) -> Result<RequestStatus>;

    fn release(&self, name: ResourceName) -> Result<RequestStatus>;

    fn notify_completion(&self, event: GrantEvent, name: ResourceName) -> Result<()>;
}

/// Cross-processor shared state bits.
pub trait SharedState: Send + Sync {
    fn change_state(&self, domain: StateDomain, clear: u32, set: u32) -> Result<()>;

    fn get_state(&self, domain: StateDomain) -> u32;

    /// Deliver [`BackendEvent::SharedStateChanged`](crate::BackendEvent::SharedStateChanged)
    /// whenever a bit in `mask` of `domain` changes.
    fn register_callback(&self, domain: StateDomain, mask: u32, sink: EventSink) -> Result<()>;

    fn unregister_callback(&self, domain: StateDomain, mask: u32) -> Result<()>;
}

/// Transceiver power control used for deferred low-power entry.
pub trait PowerControl: Send + Sync {
    fn suspend(&self) -> Result<()>;
}

/// The full set of collaborators a manager is built on.
#[derive(Clone)]
pub struct Platform {
    pub backend: Arc<dyn PipeBackend>,
    pub memory: Arc<dyn PlatformMemory>,
    pub accelerator: Arc<dyn Accelerator>,
    pub resources: Arc<dyn ResourceService>,
    pub shared_state: Arc<dyn SharedState>,
    pub power: Arc<dyn PowerControl>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
