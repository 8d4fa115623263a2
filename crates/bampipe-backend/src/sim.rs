use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{BackendError, Result};
use crate::event::{BackendEvent, EventSink};
use crate::traits::{
    Accelerator, ConsumerHooks, PipeBackend, Platform, PlatformMemory, PowerControl,
    ResourceService, SharedState, WakeRegistration,
};
use crate::types::{
    AcceleratorConnection, AcceleratorRequest, BamType, ClientHandle, ConnectMode, ConnectParams,
    DeviceHandle, DeviceProps, GrantEvent, MemBuffer, PipeHandle, PipeOptions, RequestStatus,
    ResourceKind, ResourceName, StateDomain, TimerMode, PLUG_UNPLUG_BIT,
};

/// Fill pattern of freshly mapped or allocated memory.
pub const POISON_BYTE: u8 = 0xA5;

const DEFAULT_MAX_ENDPOINTS: usize = 32;
const COHERENT_BASE: u64 = 0x8000_0000;
const ACCEL_FIFO_BASE: u64 = 0x9000_0000;
const ACCEL_DEVICE: DeviceHandle = DeviceHandle(0xACC0);
const ACCEL_FIRST_EP: u32 = 10;

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    RegisterDevice { bam: BamType, handle: DeviceHandle },
    ResetDevice(DeviceHandle),
    AllocateEndpoint(PipeHandle),
    FreeEndpoint(PipeHandle),
    MapPhysical(u32),
    SetupPipeFifo { offset: u32, size: u32 },
    Connect { pipe: PipeHandle, mode: ConnectMode, options: PipeOptions },
    Disconnect(PipeHandle),
    SetOptions { pipe: PipeHandle, options: PipeOptions },
    RegisterWake { pipe: PipeHandle, token: Option<usize> },
    ConfigureTimer { pipe: PipeHandle, timeout_ms: u32 },
    ResetTimer(PipeHandle),
    EnablePrivateClocks,
    DisablePrivateClocks,
    PrivateRamSelect(u32),
    MapIo { phys: u64, size: u32 },
    UnmapIo(usize),
    ZeroFill { base: usize, size: u32 },
    AllocCoherent(u32),
    FreeCoherent(u64),
    AcceleratorConnect { client: u32 },
    AcceleratorDisconnect(ClientHandle),
    ResourceRequest(ResourceName),
    ResourceRelease(ResourceName),
    NotifyCompletion { event: GrantEvent, name: ResourceName },
    ChangeState { domain: StateDomain, clear: u32, set: u32 },
    Suspend,
}

/// How the simulated resource service answers producer requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProducerMode {
    /// Grant and release synchronously.
    #[default]
    Immediate,
    /// Answer "in progress"; completion is raised with
    /// [`SimPlatform::grant_producer`] / [`SimPlatform::release_producer`].
    Deferred,
    /// Refuse the request.
    Rejected,
}

/// Failure injection switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimFailures {
    pub connect: bool,
    pub setup_pipe_fifo: bool,
    pub map_io: bool,
    pub alloc_coherent: bool,
    pub accelerator_connect: bool,
    pub map_physical: bool,
}

struct Device {
    bam: BamType,
    sink: EventSink,
}

struct SimState {
    ops: Vec<SimOp>,
    failures: SimFailures,
    max_endpoints: usize,
    next_pipe: u32,
    next_device: u32,
    live_pipes: HashMap<PipeHandle, Option<ConnectParams>>,
    devices: HashMap<DeviceHandle, Device>,
    wakes: HashMap<PipeHandle, WakeRegistration>,
    timers: HashMap<PipeHandle, u32>,
    private_clocks_present: bool,
    private_clock_refs: u32,
    private_ram_select: u32,
    regions: HashMap<usize, BytesMut>,
    next_region: usize,
    next_coherent: u64,
    next_client: u32,
    next_accel_ep: u32,
    producer_mode: ProducerMode,
    producers: HashMap<BamType, EventSink>,
    consumers: HashMap<BamType, Arc<dyn ConsumerHooks>>,
    local_state: u32,
    remote_state: u32,
    auto_ack: bool,
    subscriptions: Vec<(StateDomain, u32, EventSink)>,
    suspends: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            failures: SimFailures::default(),
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            next_pipe: 1,
            next_device: 1,
            live_pipes: HashMap::new(),
            devices: HashMap::new(),
            wakes: HashMap::new(),
            timers: HashMap::new(),
            private_clocks_present: true,
            private_clock_refs: 0,
            private_ram_select: 0,
            regions: HashMap::new(),
            next_region: 0x1000,
            next_coherent: COHERENT_BASE,
            next_client: 1,
            next_accel_ep: ACCEL_FIRST_EP,
            producer_mode: ProducerMode::default(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            local_state: 0,
            remote_state: 0,
            auto_ack: false,
            subscriptions: Vec::new(),
            suspends: 0,
        }
    }

    fn new_region(&mut self, size: u32) -> usize {
        let base = self.next_region;
        self.next_region += (size as usize).max(1).next_multiple_of(0x1000);
        let mut bytes = BytesMut::with_capacity(size as usize);
        bytes.resize(size as usize, POISON_BYTE);
        self.regions.insert(base, bytes);
        base
    }

    fn set_bits(&mut self, domain: StateDomain, clear: u32, set: u32) -> (u32, u32) {
        let bits = match domain {
            StateDomain::Local => &mut self.local_state,
            StateDomain::Remote => &mut self.remote_state,
        };
        let old = *bits;
        *bits = (old & !clear) | set;
        (old, *bits)
    }

    fn subscribers(&self, domain: StateDomain, old: u32, new: u32) -> Vec<EventSink> {
        self.subscriptions
            .iter()
            .filter(|(d, mask, _)| *d == domain && (old ^ new) & mask != 0)
            .map(|(_, _, sink)| sink.clone())
            .collect()
    }
}

/// Simulated platform implementing every collaborator trait. Records each
/// call as a [`SimOp`] and exposes knobs to inject failures and raise
/// interrupts.
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimPlatform")
            .field("ops", &state.ops.len())
            .field("live_pipes", &state.live_pipes.len())
            .finish_non_exhaustive()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self {
            state: Mutex::new(SimState::new()),
        }
    }
}

impl SimPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bundle this simulator as the full collaborator set.
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            backend: self.clone(),
            memory: self.clone(),
            accelerator: self.clone(),
            resources: self.clone(),
            shared_state: self.clone(),
            power: self.clone(),
        }
    }

    // --- inspection -------------------------------------------------------

    /// Snapshot of every recorded call.
    pub fn ops(&self) -> Vec<SimOp> {
        self.state.lock().ops.clone()
    }

    pub fn op_count(&self) -> usize {
        self.state.lock().ops.len()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    pub fn live_endpoints(&self) -> usize {
        self.state.lock().live_pipes.len()
    }

    /// Options the endpoint was last connected or configured with.
    pub fn pipe_options(&self, pipe: PipeHandle) -> Option<PipeOptions> {
        self.state
            .lock()
            .live_pipes
            .get(&pipe)
            .and_then(|params| params.map(|p| p.options))
    }

    pub fn wake_registered(&self, pipe: PipeHandle) -> bool {
        self.state.lock().wakes.contains_key(&pipe)
    }

    /// Timeout the instance timer was last configured with through `pipe`.
    pub fn timer_timeout(&self, pipe: PipeHandle) -> Option<u32> {
        self.state.lock().timers.get(&pipe).copied()
    }

    pub fn private_clock_refs(&self) -> u32 {
        self.state.lock().private_clock_refs
    }

    pub fn private_ram_select(&self) -> u32 {
        self.state.lock().private_ram_select
    }

    /// Whether the mapped or allocated region at `base` is all zero.
    pub fn region_zeroed(&self, base: usize) -> Option<bool> {
        self.state
            .lock()
            .regions
            .get(&base)
            .map(|bytes| bytes.iter().all(|b| *b == 0))
    }

    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn shared_state(&self, domain: StateDomain) -> u32 {
        let state = self.state.lock();
        match domain {
            StateDomain::Local => state.local_state,
            StateDomain::Remote => state.remote_state,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().suspends
    }

    // --- knobs ------------------------------------------------------------

    pub fn set_failures(&self, failures: SimFailures) {
        self.state.lock().failures = failures;
    }

    pub fn set_max_endpoints(&self, max: usize) {
        self.state.lock().max_endpoints = max;
    }

    pub fn set_private_clocks_present(&self, present: bool) {
        self.state.lock().private_clocks_present = present;
    }

    pub fn set_producer_mode(&self, mode: ProducerMode) {
        self.state.lock().producer_mode = mode;
    }

    /// Make the remote processor mirror the plug bit of every local change.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    // --- interrupt sources ------------------------------------------------

    /// Raise the inactivity timer interrupt of `bam`.
    pub fn fire_timer(&self, bam: BamType) -> Result<()> {
        let sink = {
            let state = self.state.lock();
            state
                .devices
                .values()
                .find(|device| device.bam == bam)
                .map(|device| device.sink.clone())
        };
        let sink = sink.ok_or(BackendError::Unsupported("instance not registered"))?;
        sink.deliver(BackendEvent::TimerExpired { bam })
    }

    /// Raise the wake interrupt registered with `token`.
    pub fn fire_wake(&self, token: usize) -> Result<()> {
        let sink = {
            let state = self.state.lock();
            state
                .wakes
                .values()
                .find(|wake| wake.token == token)
                .map(|wake| wake.sink.clone())
        };
        let sink = sink.ok_or(BackendError::Unsupported("no wake registered"))?;
        sink.deliver(BackendEvent::Wake { token })
    }

    pub fn grant_producer(&self, bam: BamType) -> Result<()> {
        self.producer_event(bam, GrantEvent::Granted)
    }

    pub fn release_producer(&self, bam: BamType) -> Result<()> {
        self.producer_event(bam, GrantEvent::Released)
    }

    fn producer_event(&self, bam: BamType, event: GrantEvent) -> Result<()> {
        let sink = self.state.lock().producers.get(&bam).cloned();
        let sink = sink.ok_or(BackendError::Unsupported("producer not created"))?;
        sink.deliver(BackendEvent::Producer { bam, event })
    }

    /// Ask the consumer resource of `bam` for a grant, as the service would.
    pub fn request_consumer(&self, bam: BamType) -> Option<RequestStatus> {
        let hooks = self.state.lock().consumers.get(&bam).cloned();
        hooks.map(|hooks| hooks.request())
    }

    pub fn release_consumer(&self, bam: BamType) -> Option<RequestStatus> {
        let hooks = self.state.lock().consumers.get(&bam).cloned();
        hooks.map(|hooks| hooks.release())
    }

    /// Write remote shared-state bits as the remote processor would.
    pub fn set_remote_state(&self, clear: u32, set: u32) {
        let (sinks, old, new) = {
            let mut state = self.state.lock();
            let (old, new) = state.set_bits(StateDomain::Remote, clear, set);
            (state.subscribers(StateDomain::Remote, old, new), old, new)
        };
        notify(sinks, StateDomain::Remote, old, new);
    }

    /// Flip the remote plug/unplug bit.
    pub fn toggle_remote_ack(&self) {
        let current = self.shared_state(StateDomain::Remote) & PLUG_UNPLUG_BIT;
        if current == 0 {
            self.set_remote_state(0, PLUG_UNPLUG_BIT);
        } else {
            self.set_remote_state(PLUG_UNPLUG_BIT, 0);
        }
    }
}

fn notify(sinks: Vec<EventSink>, domain: StateDomain, old: u32, new: u32) {
    for sink in sinks {
        if let Err(err) = sink.deliver(BackendEvent::SharedStateChanged { domain, old, new }) {
            debug!(error = %err, "shared state notification dropped");
        }
    }
}

impl PipeBackend for SimPlatform {
    fn register_device(&self, props: &DeviceProps, sink: EventSink) -> Result<DeviceHandle> {
        let mut state = self.state.lock();
        let handle = DeviceHandle(state.next_device);
        state.next_device += 1;
        state.devices.insert(
            handle,
            Device {
                bam: props.bam,
                sink,
            },
        );
        state.ops.push(SimOp::RegisterDevice {
            bam: props.bam,
            handle,
        });
        Ok(handle)
    }

    fn reset_device(&self, device: DeviceHandle) -> Result<()> {
        self.state.lock().ops.push(SimOp::ResetDevice(device));
        Ok(())
    }

    fn allocate_endpoint(&self) -> Result<PipeHandle> {
        let mut state = self.state.lock();
        if state.live_pipes.len() >= state.max_endpoints {
            return Err(BackendError::EndpointExhausted);
        }
        let pipe = PipeHandle(state.next_pipe);
        state.next_pipe += 1;
        state.live_pipes.insert(pipe, None);
        state.ops.push(SimOp::AllocateEndpoint(pipe));
        Ok(pipe)
    }

    fn free_endpoint(&self, pipe: PipeHandle) {
        let mut state = self.state.lock();
        state.live_pipes.remove(&pipe);
        state.wakes.remove(&pipe);
        state.timers.remove(&pipe);
        state.ops.push(SimOp::FreeEndpoint(pipe));
    }

    fn map_physical(&self, phys_addr: u32) -> Result<DeviceHandle> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::MapPhysical(phys_addr));
        if phys_addr == 0 || state.failures.map_physical {
            return Err(BackendError::InvalidAddress(phys_addr));
        }
        Ok(DeviceHandle(phys_addr))
    }

    fn setup_pipe_fifo(&self, offset: u32, size: u32) -> Result<MemBuffer> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::SetupPipeFifo { offset, size });
        if state.failures.setup_pipe_fifo {
            return Err(BackendError::FifoSetup { offset, size });
        }
        Ok(MemBuffer {
            phys_base: u64::from(offset),
            size,
            base: 0,
        })
    }

    fn connect(&self, pipe: PipeHandle, params: &ConnectParams) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::Connect {
            pipe,
            mode: params.mode,
            options: params.options,
        });
        if state.failures.connect {
            return Err(BackendError::ConnectFailed {
                reason: "injected connect failure".to_string(),
            });
        }
        match state.live_pipes.get_mut(&pipe) {
            Some(slot) => {
                *slot = Some(*params);
                trace!(?pipe, "sim endpoint connected");
                Ok(())
            }
            None => Err(BackendError::ConnectFailed {
                reason: format!("endpoint {} not allocated", pipe.0),
            }),
        }
    }

    fn disconnect(&self, pipe: PipeHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::Disconnect(pipe));
        if let Some(slot) = state.live_pipes.get_mut(&pipe) {
            *slot = None;
        }
        Ok(())
    }

    fn set_options(&self, pipe: PipeHandle, options: PipeOptions) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::SetOptions { pipe, options });
        match state.live_pipes.get_mut(&pipe) {
            Some(Some(params)) => {
                params.options = options;
                Ok(())
            }
            _ => Err(BackendError::Rejected(format!(
                "endpoint {} not connected",
                pipe.0
            ))),
        }
    }

    fn register_wake_event(
        &self,
        pipe: PipeHandle,
        wake: Option<WakeRegistration>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::RegisterWake {
            pipe,
            token: wake.as_ref().map(|w| w.token),
        });
        match wake {
            Some(wake) => {
                state.wakes.insert(pipe, wake);
            }
            None => {
                state.wakes.remove(&pipe);
            }
        }
        Ok(())
    }

    fn configure_timer(&self, pipe: PipeHandle, mode: TimerMode, timeout_ms: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::ConfigureTimer { pipe, timeout_ms });
        match mode {
            TimerMode::OneShot => {
                state.timers.insert(pipe, timeout_ms);
            }
        }
        Ok(())
    }

    fn reset_timer(&self, pipe: PipeHandle) -> Result<()> {
        self.state.lock().ops.push(SimOp::ResetTimer(pipe));
        Ok(())
    }
}

impl PlatformMemory for SimPlatform {
    fn has_private_clocks(&self) -> bool {
        self.state.lock().private_clocks_present
    }

    fn enable_private_clocks(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.private_clocks_present {
            return Err(BackendError::ClockUnavailable("mem_clk"));
        }
        state.private_clock_refs += 1;
        state.ops.push(SimOp::EnablePrivateClocks);
        Ok(())
    }

    fn disable_private_clocks(&self) {
        let mut state = self.state.lock();
        state.private_clock_refs = state.private_clock_refs.saturating_sub(1);
        state.ops.push(SimOp::DisablePrivateClocks);
    }

    fn write_private_ram_select(&self, value: u32) {
        let mut state = self.state.lock();
        state.private_ram_select = value;
        state.ops.push(SimOp::PrivateRamSelect(value));
    }

    fn map_io(&self, phys: u64, size: u32) -> Result<usize> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::MapIo { phys, size });
        if state.failures.map_io {
            return Err(BackendError::Mapping { phys, size });
        }
        Ok(state.new_region(size))
    }

    fn unmap_io(&self, base: usize) {
        let mut state = self.state.lock();
        state.regions.remove(&base);
        state.ops.push(SimOp::UnmapIo(base));
    }

    fn zero_fill(&self, base: usize, size: u32) {
        let mut state = self.state.lock();
        if let Some(bytes) = state.regions.get_mut(&base) {
            let end = (size as usize).min(bytes.len());
            bytes[..end].fill(0);
        }
        state.ops.push(SimOp::ZeroFill { base, size });
    }

    fn alloc_coherent(&self, size: u32) -> Result<MemBuffer> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::AllocCoherent(size));
        if state.failures.alloc_coherent {
            return Err(BackendError::AllocationFailed { size });
        }
        let phys_base = state.next_coherent;
        state.next_coherent += u64::from(size).max(1).next_multiple_of(0x1000);
        let base = state.new_region(size);
        Ok(MemBuffer {
            phys_base,
            size,
            base,
        })
    }

    fn free_coherent(&self, buffer: &MemBuffer) {
        let mut state = self.state.lock();
        state.regions.remove(&buffer.base);
        state.ops.push(SimOp::FreeCoherent(buffer.phys_base));
    }
}

impl Accelerator for SimPlatform {
    fn connect(&self, request: &AcceleratorRequest) -> Result<AcceleratorConnection> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::AcceleratorConnect {
            client: request.client,
        });
        if state.failures.accelerator_connect {
            return Err(BackendError::Rejected("accelerator connect refused".into()));
        }
        let pipe_index = state.next_accel_ep;
        state.next_accel_ep += 1;
        let client = ClientHandle(state.next_client);
        state.next_client += 1;
        let offset = u64::from(pipe_index) << 16;
        let data = request.data.unwrap_or(MemBuffer {
            phys_base: ACCEL_FIFO_BASE + offset,
            size: request.data_fifo_size,
            base: 0,
        });
        let desc = request.desc.unwrap_or(MemBuffer {
            phys_base: ACCEL_FIFO_BASE + offset + 0x8000,
            size: request.desc_fifo_size,
            base: 0,
        });
        Ok(AcceleratorConnection {
            bam: ACCEL_DEVICE,
            pipe_index,
            data,
            desc,
            client,
        })
    }

    fn disconnect(&self, client: ClientHandle) -> Result<()> {
        self.state
            .lock()
            .ops
            .push(SimOp::AcceleratorDisconnect(client));
        Ok(())
    }
}

impl ResourceService for SimPlatform {
    fn create_producer(&self, name: ResourceName, sink: EventSink) -> Result<()> {
        self.state.lock().producers.insert(name.bam, sink);
        Ok(())
    }

    fn create_consumer(&self, name: ResourceName, hooks: Arc<dyn ConsumerHooks>) -> Result<()> {
        self.state.lock().consumers.insert(name.bam, hooks);
        Ok(())
    }

    fn request(&self, name: ResourceName) -> Result<RequestStatus> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::ResourceRequest(name));
        producer_answer(&state, name)
    }

    fn release(&self, name: ResourceName) -> Result<RequestStatus> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::ResourceRelease(name));
        producer_answer(&state, name)
    }

    fn notify_completion(&self, event: GrantEvent, name: ResourceName) -> Result<()> {
        self.state
            .lock()
            .ops
            .push(SimOp::NotifyCompletion { event, name });
        Ok(())
    }
}

fn producer_answer(state: &SimState, name: ResourceName) -> Result<RequestStatus> {
    if name.kind != ResourceKind::Producer || !state.producers.contains_key(&name.bam) {
        return Err(BackendError::Rejected(format!("unknown resource {name}")));
    }
    match state.producer_mode {
        ProducerMode::Immediate => Ok(RequestStatus::Immediate),
        ProducerMode::Deferred => Ok(RequestStatus::InProgress),
        ProducerMode::Rejected => Err(BackendError::Rejected(format!("{name} refused"))),
    }
}

impl SharedState for SimPlatform {
    fn change_state(&self, domain: StateDomain, clear: u32, set: u32) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut state = self.state.lock();
            state.ops.push(SimOp::ChangeState { domain, clear, set });
            let (old, new) = state.set_bits(domain, clear, set);
            pending.push((state.subscribers(domain, old, new), domain, old, new));

            if state.auto_ack && domain == StateDomain::Local {
                let plug = new & PLUG_UNPLUG_BIT;
                let (old, new) =
                    state.set_bits(StateDomain::Remote, PLUG_UNPLUG_BIT, plug);
                pending.push((
                    state.subscribers(StateDomain::Remote, old, new),
                    StateDomain::Remote,
                    old,
                    new,
                ));
            }
        }
        for (sinks, domain, old, new) in pending {
            notify(sinks, domain, old, new);
        }
        Ok(())
    }

    fn get_state(&self, domain: StateDomain) -> u32 {
        self.shared_state(domain)
    }

    fn register_callback(&self, domain: StateDomain, mask: u32, sink: EventSink) -> Result<()> {
        self.state.lock().subscriptions.push((domain, mask, sink));
        Ok(())
    }

    fn unregister_callback(&self, domain: StateDomain, mask: u32) -> Result<()> {
        self.state
            .lock()
            .subscriptions
            .retain(|(d, m, _)| !(*d == domain && *m == mask));
        Ok(())
    }
}

impl PowerControl for SimPlatform {
    fn suspend(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.suspends += 1;
        state.ops.push(SimOp::Suspend);
        Ok(())
    }
}
