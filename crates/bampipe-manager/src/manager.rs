use std::sync::Arc;

use bampipe_backend::{
    BackendEvent, BamType, DeviceProps, Direction, EventSink, GrantEvent, PeerRole, Platform,
    ResourceName, StateDomain, DEVICE_THRESHOLD,
};
use bampipe_config::{LoadLimits, PipeTable};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{
    connect_accelerator_locked, connect_locked, disconnect_accelerator_locked, disconnect_locked,
    AcceleratorConnect, AcceleratorLink, AcceleratorTeardown,
};
use crate::config::ManagerConfig;
use crate::control::{format_timers, parse_timer_command, TimerCommand, TimerUpdate, TIMER_USAGE};
use crate::error::{BamError, Result};
use crate::handshake::{Handshake, HandshakeState, HandshakeTransition};
use crate::resource::{ConsumerHandle, GrantState, ResourceClient, WaitOutcome};
use crate::table::{Callback, ConnectionInfo, InstanceStatus, PipeStatus, TableState};

/// Deferred work consumed by the dispatcher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Work {
    /// Run the event queued on a pipe.
    PipeEvent { index: usize },
    /// Enter low power after a refused request.
    EnterLowPower,
}

/// State shared between the public handle and the background tasks.
pub(crate) struct Shared {
    pub platform: Platform,
    pub table: Mutex<TableState>,
    pub resources: ResourceClient,
    pub handshake: Arc<Handshake>,
    pub sink: EventSink,
    pub work_tx: mpsc::UnboundedSender<Work>,
}

impl Shared {
    fn handle_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Wake { token } => self.on_wake(token),
            BackendEvent::TimerExpired { bam } => self.on_timer_expired(bam),
            BackendEvent::Producer { bam, event } => self.resources.on_producer_event(bam, event),
            BackendEvent::SharedStateChanged {
                domain: StateDomain::Remote,
                new,
                ..
            } => self.handshake.on_remote_state(new),
            BackendEvent::SharedStateChanged { domain, .. } => {
                debug!(?domain, "ignoring shared state change");
            }
        }
    }

    fn run_work(&self, work: Work) {
        match work {
            Work::PipeEvent { index } => self.dispatch_pipe_event(index),
            Work::EnterLowPower => {
                info!("entering deferred low power");
                if let Err(err) = self.platform.power.suspend() {
                    error!(error = %err, "deferred low-power entry failed");
                }
            }
        }
    }

    /// Finish a handshake-initiated sequence and enter low power if it was
    /// refused meanwhile. Never blocks the caller.
    fn start_low_power(&self) {
        let owed = self.table.lock().lpm.finish_sequence();
        if owed {
            debug!("low power was deferred, scheduling entry");
            if self.work_tx.send(Work::EnterLowPower).is_err() {
                warn!("dispatcher gone, low-power entry dropped");
            }
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<BackendEvent>,
    mut work: mpsc::UnboundedReceiver<Work>,
    cancel: CancellationToken,
) {
    debug!("dispatcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = events.recv() => shared.handle_event(event),
            Some(item) = work.recv() => shared.run_work(item),
            else => break,
        }
    }
    debug!("dispatcher stopped");
}

/// Connection manager for the controller's data pipes.
///
/// Created with [`BamManager::start`] inside a tokio runtime. Dropping the
/// manager stops its background tasks; [`BamManager::shutdown`] also waits
/// for them and drops the shared-state subscription.
pub struct BamManager {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (pipes, gate_closed) = {
            let state = self.shared.table.lock();
            (state.pipes.len(), state.lpm.waiting())
        };
        f.debug_struct("BamManager")
            .field("pipes", &pipes)
            .field("low_power_gate_closed", &gate_closed)
            .field("handshake", &self.shared.handshake.state())
            .finish_non_exhaustive()
    }
}

impl BamManager {
    /// Validate `table`, register every bus instance that carries pipes,
    /// create the negotiated resources and spawn the dispatcher and the
    /// handshake worker on the current runtime.
    pub fn start(table: PipeTable, platform: Platform, config: ManagerConfig) -> Result<Self> {
        table.validate(&LoadLimits::default())?;
        let runtime = Handle::try_current().map_err(|err| {
            BamError::InvalidArgument(format!("no tokio runtime to run the manager on: {err}"))
        })?;

        let (sink, events) = EventSink::channel(config.event_queue_depth);
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let private_clocks = platform.memory.has_private_clocks();
        if !private_clocks {
            warn!("private ram clocks not found, private-memory pipes will not connect");
        }
        let mut state = TableState::new(&table, private_clocks);
        for bam in table.instances() {
            let props = DeviceProps {
                bam,
                num_pipes: table.num_pipes,
                summing_threshold: DEVICE_THRESHOLD,
                event_threshold: DEVICE_THRESHOLD,
                no_ext_pipe_reset: table.ignore_core_reset_ack && bam != BamType::Ssusb,
                no_local_clk_gating: table.disable_clk_gating,
            };
            let device = platform.backend.register_device(&props, sink.clone())?;
            state.bam_mut(bam).device = Some(device);
            debug!(bam = %bam, device = device.0, "bus instance registered");
        }

        let shared = Arc::new(Shared {
            resources: ResourceClient::new(platform.resources.clone(), &config),
            handshake: Arc::new(Handshake::new(platform.shared_state.clone(), sink.clone())),
            platform,
            table: Mutex::new(state),
            sink,
            work_tx,
        });
        create_resources(&shared);

        let cancel = CancellationToken::new();
        let tasks = vec![
            runtime.spawn(dispatch_loop(
                shared.clone(),
                events,
                work_rx,
                cancel.clone(),
            )),
            runtime.spawn(shared.handshake.clone().run(cancel.clone())),
        ];
        info!(
            pipes = table.pipes.len(),
            instances = ?table.instances(),
            "pipe manager started"
        );
        Ok(Self {
            shared,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    // --- connection table -------------------------------------------------

    /// Number of configured pipes.
    pub fn len(&self) -> usize {
        self.shared.table.lock().pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, index: usize) -> Result<PipeStatus> {
        self.shared.table.lock().status(index)
    }

    /// Index of the pipe matching `(core_name, peer, dir, pipe_num)`.
    pub fn find(
        &self,
        core_name: &str,
        peer: PeerRole,
        dir: Direction,
        pipe_num: u8,
    ) -> Result<usize> {
        let bam = BamType::from_core_name(core_name)
            .ok_or_else(|| BamError::UnknownInstance(core_name.to_string()))?;
        self.shared.table.lock().find(bam, peer, dir, pipe_num)
    }

    pub fn pipes(&self) -> Vec<PipeStatus> {
        let state = self.shared.table.lock();
        (0..state.pipes.len())
            .filter_map(|index| state.status(index).ok())
            .collect()
    }

    pub fn instances(&self) -> Vec<InstanceStatus> {
        let state = self.shared.table.lock();
        BamType::ALL
            .into_iter()
            .map(|bam| state.instance_status(bam))
            .collect()
    }

    pub fn enabled_count(&self, bam: BamType) -> usize {
        self.shared.table.lock().bam(bam).enabled_count
    }

    /// Whether every instance counter matches its enabled pipes.
    pub fn counters_consistent(&self) -> bool {
        self.shared.table.lock().counters_consistent()
    }

    pub fn connection_info(&self, index: usize) -> Result<ConnectionInfo> {
        let state = self.shared.table.lock();
        let conn = state.lookup(index)?;
        if !conn.enabled {
            return Err(BamError::InvalidArgument(format!(
                "pipe {index} is not connected"
            )));
        }
        Ok(ConnectionInfo::from_connection(conn))
    }

    /// Select the bus instance carrying trace data by core name.
    pub fn set_qdss_core(&self, core_name: &str) -> Result<()> {
        let bam = BamType::from_core_name(core_name)
            .ok_or_else(|| BamError::UnknownInstance(core_name.to_string()))?;
        self.shared.table.lock().qdss_core = Some(bam);
        debug!(bam = %bam, "trace core selected");
        Ok(())
    }

    /// Index of the inbound trace pipe `pipe_num` on the trace core.
    pub fn qdss_index(&self, pipe_num: u8) -> Result<usize> {
        let state = self.shared.table.lock();
        let bam = state
            .qdss_core
            .ok_or_else(|| BamError::NotFound("no trace core configured".to_string()))?;
        state.find(bam, PeerRole::Qdss, Direction::PeerToLocal, pipe_num)
    }

    // --- plain connects ---------------------------------------------------

    /// Connect pipe `index`; returns its local pipe index. Idempotent.
    pub fn connect(&self, index: usize) -> Result<u32> {
        let mut state = self.shared.table.lock();
        connect_locked(&self.shared.platform, &mut state, index)
    }

    /// Disconnect pipe `index`. Disconnecting an idle pipe is a no-op.
    pub fn disconnect(&self, index: usize) -> Result<()> {
        let mut state = self.shared.table.lock();
        disconnect_locked(&self.shared.platform, &mut state, index)
    }

    /// Disconnect every enabled pipe whose label mentions the modem peer,
    /// reset the affected instances and reconnect the pipes. Keeps going on
    /// failure and returns the last error.
    pub fn reset_peer_domain(&self) -> Result<()> {
        let platform = &self.shared.platform;
        let mut state = self.shared.table.lock();
        let targets: Vec<usize> = state
            .pipes
            .iter()
            .enumerate()
            .filter(|(_, conn)| conn.enabled && conn.desc.label.contains("a2"))
            .map(|(index, _)| index)
            .collect();

        let mut last_err = None;
        let mut reconnect = Vec::new();
        let mut instances = Vec::new();
        for index in targets {
            match disconnect_locked(platform, &mut state, index) {
                Ok(()) => {
                    reconnect.push(index);
                    let bam = state.pipes[index].desc.bam;
                    if !instances.contains(&bam) {
                        instances.push(bam);
                    }
                }
                Err(err) => {
                    error!(index, error = %err, "failed to disconnect peer pipe");
                    last_err = Some(err);
                }
            }
        }

        for bam in instances {
            if let Some(device) = state.bam(bam).device {
                if let Err(err) = platform.backend.reset_device(device) {
                    error!(bam = %bam, error = %err, "instance reset failed");
                }
            }
        }

        for index in reconnect {
            if let Err(err) = connect_locked(platform, &mut state, index) {
                error!(index, error = %err, "failed to reconnect peer pipe");
                last_err = Some(err);
            }
        }
        info!("peer domain reset complete");
        last_err.map_or(Ok(()), Err)
    }

    // --- accelerator ------------------------------------------------------

    /// Connect a pipe to the accelerator, negotiating grants as needed.
    pub async fn connect_accelerator(&self, request: AcceleratorConnect) -> Result<AcceleratorLink> {
        let (bam, dir, enabled) = {
            let mut state = self.shared.table.lock();
            let conn = state.lookup(request.index)?;
            let (bam, dir, enabled) = (conn.desc.bam, conn.desc.dir, conn.enabled);
            if bam == BamType::Hsusb {
                state.lpm.begin_sequence();
            }
            (bam, dir, enabled)
        };
        let result = self.activate_accelerator(&request, bam, dir, enabled).await;
        if result.is_err() && bam == BamType::Hsusb {
            debug!(bam = %bam, "connect sequence failed, reopening low-power gate");
            self.shared.start_low_power();
        }
        result
    }

    async fn activate_accelerator(
        &self,
        request: &AcceleratorConnect,
        bam: BamType,
        dir: Direction,
        enabled: bool,
    ) -> Result<AcceleratorLink> {
        if enabled {
            let mut state = self.shared.table.lock();
            return connect_accelerator_locked(&self.shared.platform, &mut state, request)
                .map(|(link, _)| link);
        }

        if dir == Direction::LocalToPeer {
            debug!(bam = %bam, "starting connect sequence");
            self.shared.resources.request_producer(bam).await?;
        }

        let (link, first) = {
            let mut state = self.shared.table.lock();
            connect_accelerator_locked(&self.shared.platform, &mut state, request)?
        };

        if first && request.inactivity.is_some() && self.inactivity_timer(bam) != 0 {
            self.shared.arm_timer(bam);
        }
        if dir == Direction::PeerToLocal
            && self.shared.resources.consumer_state(bam) == GrantState::Granted
        {
            debug!(bam = %bam, "notifying consumer granted");
            self.shared
                .resources
                .notify_completion(GrantEvent::Granted, ResourceName::consumer(bam));
        }
        Ok(link)
    }

    /// Tear down accelerator links. At least one link is required.
    pub async fn disconnect_accelerator(&self, teardown: AcceleratorTeardown) -> Result<()> {
        if teardown.producer.is_none() && teardown.consumer.is_none() {
            return Err(BamError::InvalidArgument(
                "both accelerator links are missing".to_string(),
            ));
        }
        debug!("starting accelerator disconnect sequence");

        if let Some(link) = teardown.producer {
            let bam = self.shared.table.lock().lookup(link.index)?.desc.bam;
            self.shared.resources.release_producer(bam).await?;
            let mut state = self.shared.table.lock();
            disconnect_accelerator_locked(&self.shared.platform, &mut state, &link)?;
        }

        if let Some(link) = teardown.consumer {
            let bam = self.shared.table.lock().lookup(link.index)?.desc.bam;
            self.shared.resources.wait_consumer_released(bam).await?;
            {
                let mut state = self.shared.table.lock();
                disconnect_accelerator_locked(&self.shared.platform, &mut state, &link)?;
            }
            if self.shared.resources.consumer_state(bam) == GrantState::Released {
                debug!(bam = %bam, "notifying consumer released");
                self.shared
                    .resources
                    .notify_completion(GrantEvent::Released, ResourceName::consumer(bam));
            }
            debug!("accelerator disconnect sequence ended");
            self.shared.start_low_power();
        }
        Ok(())
    }

    // --- resource negotiation ---------------------------------------------

    pub async fn request_producer(&self, bam: BamType) -> Result<WaitOutcome> {
        self.shared.resources.request_producer(bam).await
    }

    pub async fn release_producer(&self, bam: BamType) -> Result<WaitOutcome> {
        self.shared.resources.release_producer(bam).await
    }

    pub async fn wait_consumer_granted(&self, bam: BamType) -> Result<WaitOutcome> {
        self.shared.resources.wait_consumer_granted(bam).await
    }

    pub async fn wait_consumer_released(&self, bam: BamType) -> Result<WaitOutcome> {
        self.shared.resources.wait_consumer_released(bam).await
    }

    pub fn producer_state(&self, bam: BamType) -> GrantState {
        self.shared.resources.producer_state(bam)
    }

    pub fn consumer_state(&self, bam: BamType) -> GrantState {
        self.shared.resources.consumer_state(bam)
    }

    // --- handshake --------------------------------------------------------

    /// Declare local readiness for the remote processor.
    pub fn client_ready(&self, ready: bool) {
        self.shared.handshake.set_client_ready(ready);
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.shared.handshake.state()
    }

    /// Stream of committed handshake transitions.
    pub fn subscribe_handshake(&self) -> broadcast::Receiver<HandshakeTransition> {
        self.shared.handshake.subscribe()
    }

    /// Bind the callback run when the remote acknowledges an unplug.
    pub fn register_peer_reset(&self, callback: Callback) -> Result<()> {
        self.shared.handshake.register(callback)
    }

    pub fn unregister_peer_reset(&self) -> Result<()> {
        self.shared.handshake.unregister()
    }

    // --- low power --------------------------------------------------------

    /// Whether low power may be entered now. While a connect sequence is
    /// outstanding the request is refused and entered once it completes.
    pub fn is_low_power_ok(&self) -> bool {
        let ok = self.shared.table.lock().lpm.is_low_power_ok();
        if ok {
            debug!("low power allowed");
        } else {
            info!("connect sequence outstanding, deferring low power");
        }
        ok
    }

    // --- inactivity and wake ----------------------------------------------

    /// Register (or with `None`, remove) a per-pipe wake callback.
    pub fn register_wake(&self, index: usize, callback: Option<Callback>) -> Result<()> {
        let mut state = self.shared.table.lock();
        self.shared
            .register_wake_locked(&mut state, index, callback, true)
    }

    /// Set the inactivity timeout of `bam` in milliseconds; 0 disables it.
    /// An instance with enabled pipes is re-armed immediately.
    pub fn set_inactivity_timer(&self, bam: BamType, timeout_ms: u32) {
        let rearm = {
            let mut state = self.shared.table.lock();
            let ctx = state.bam_mut(bam);
            ctx.timer_ms = timeout_ms;
            ctx.enabled_count > 0
        };
        info!(bam = %bam, timeout_ms, "inactivity timer set");
        if rearm {
            self.shared.arm_timer(bam);
        }
    }

    pub fn inactivity_timer(&self, bam: BamType) -> u32 {
        self.shared.table.lock().bam(bam).timer_ms
    }

    pub fn is_inactive(&self, bam: BamType) -> bool {
        self.shared.table.lock().bam(bam).inactive
    }

    /// Render every instance's timer as `<name>: <ms>ms` lines.
    pub fn show_inactivity_timers(&self) -> String {
        let timers: Vec<(BamType, u32)> = {
            let state = self.shared.table.lock();
            BamType::ALL
                .into_iter()
                .map(|bam| (bam, state.bam(bam).timer_ms))
                .collect()
        };
        format_timers(&timers)
    }

    /// Apply a timer control string. The whole input is validated before
    /// any timer changes.
    pub fn store_inactivity_timers(&self, input: &str) -> Result<TimerUpdate> {
        match parse_timer_command(input)? {
            TimerCommand::Help => Ok(TimerUpdate::Usage(TIMER_USAGE)),
            TimerCommand::Set(settings) => {
                for (bam, ms) in &settings {
                    self.set_inactivity_timer(*bam, *ms);
                }
                Ok(TimerUpdate::Applied(settings))
            }
        }
    }

    // --- lifecycle --------------------------------------------------------

    /// Stop the background tasks, drop the remote-state subscription and
    /// wait for the tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        let unregistered = self.shared.handshake.unregister();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "manager task ended abnormally");
            }
        }
        info!("pipe manager stopped");
        unregistered
    }
}

impl Drop for BamManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn create_resources(shared: &Arc<Shared>) {
    let service = &shared.platform.resources;
    for bam in BamType::ALL.into_iter().filter(|bam| bam.is_negotiated()) {
        let producer = ResourceName::producer(bam);
        if let Err(err) = service.create_producer(producer, shared.sink.clone()) {
            error!(resource = %producer, error = %err, "failed to create producer resource");
            return;
        }
        let consumer = ResourceName::consumer(bam);
        let hooks = Arc::new(ConsumerHandle {
            bam,
            shared: Arc::downgrade(shared),
        });
        if let Err(err) = service.create_consumer(consumer, hooks) {
            error!(resource = %consumer, error = %err, "failed to create consumer resource");
            return;
        }
        debug!(bam = %bam, "negotiated resources created");
    }
}
