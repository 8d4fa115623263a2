use std::fmt;

use bampipe_backend::{
    AcceleratorRequest, BackendError, BamType, ClientHandle, ConnectMode, ConnectParams,
    Direction, MemBuffer, MemoryType, PipeHandle, PipeOptions, Platform, EVENT_THRESHOLD,
};
use bampipe_config::PipeDescriptor;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{BamError, Result};
use crate::table::{Callback, EventInfo, FifoOwner, TableState};

const PRIVATE_RAM_SELECT_HSUSB: u32 = 0x4;
const PRIVATE_RAM_SELECT_OTHER: u32 = 0x7;

/// Request to connect a pipe to the packet-routing accelerator.
#[derive(Clone)]
pub struct AcceleratorConnect {
    pub index: usize,
    /// Accelerator client type.
    pub client: u32,
    /// Invoked when traffic resumes after an inactivity period.
    pub activity: Option<Callback>,
    /// Invoked when the instance's inactivity timer fires.
    pub inactivity: Option<Callback>,
}

impl fmt::Debug for AcceleratorConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorConnect")
            .field("index", &self.index)
            .field("client", &self.client)
            .field("activity", &self.activity.is_some())
            .field("inactivity", &self.inactivity.is_some())
            .finish()
    }
}

/// A pipe wired to the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcceleratorLink {
    pub index: usize,
    pub dir: Direction,
    pub client: ClientHandle,
    pub local_pipe_index: u32,
    /// The accelerator's endpoint index.
    pub peer_pipe_index: u32,
}

/// Links to tear down. The producer link is the peer-to-local pipe, the
/// consumer link the local-to-peer pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceleratorTeardown {
    pub producer: Option<AcceleratorLink>,
    pub consumer: Option<AcceleratorLink>,
}

/// Reset the instance before its first pipe connects, when configured to.
fn reset_if_first(platform: &Platform, state: &TableState, bam: BamType) -> Result<()> {
    let ctx = state.bam(bam);
    if ctx.reset_on_connect && ctx.enabled_count == 0 {
        if let Some(device) = ctx.device {
            debug!(bam = %bam, "resetting instance before first connect");
            platform.backend.reset_device(device)?;
        }
    }
    Ok(())
}

/// Connect pipe `index`; returns the local pipe index. Connecting an
/// enabled pipe is a no-op.
pub(crate) fn connect_locked(
    platform: &Platform,
    state: &mut TableState,
    index: usize,
) -> Result<u32> {
    let conn = state.lookup(index)?;
    if conn.enabled {
        debug!(index, "connection already established");
        return Ok(conn.local_pipe_index());
    }
    let bam = conn.desc.bam;
    reset_if_first(platform, state, bam)?;

    let pipe = platform.backend.allocate_endpoint()?;
    if let Err(err) = connect_endpoint(platform, state, index, pipe) {
        platform.backend.free_endpoint(pipe);
        return Err(err);
    }
    state.mark_enabled(index);

    let conn = &state.pipes[index];
    debug!(
        index,
        bam = %bam,
        label = %conn.desc.label,
        pipe = pipe.0,
        "pipe connected"
    );
    Ok(conn.local_pipe_index())
}

fn connect_endpoint(
    platform: &Platform,
    state: &mut TableState,
    index: usize,
    pipe: PipeHandle,
) -> Result<()> {
    let desc = state.pipes[index].desc.clone();
    let source = platform.backend.map_physical(desc.src_phys_addr)?;
    let destination = platform.backend.map_physical(desc.dst_phys_addr)?;
    let mode = match desc.dir {
        Direction::LocalToPeer => ConnectMode::Source,
        Direction::PeerToLocal => ConnectMode::Destination,
    };

    let (data, desc_fifo) =
        provision_fifos(platform, &desc, state.fifo_base_addr, state.private_clocks)?;

    let conn = &mut state.pipes[index];
    let params = ConnectParams {
        mode,
        source,
        src_pipe_index: conn.src_pipe_index,
        destination,
        dest_pipe_index: conn.dst_pipe_index,
        data,
        desc: desc_fifo,
        event_thresh: EVENT_THRESHOLD,
        options: PipeOptions::auto_enable(),
    };
    if let Err(err) = platform.backend.connect(pipe, &params) {
        error!(index, label = %desc.label, error = %err, "endpoint connect failed");
        if let Err(err) = platform.backend.disconnect(pipe) {
            warn!(index, error = %err, "rollback disconnect failed");
        }
        release_fifos(platform, desc.mem_type, &data, &desc_fifo);
        return Err(err.into());
    }

    conn.handle = Some(pipe);
    conn.params = params;
    conn.data_buf = data;
    conn.desc_buf = desc_fifo;
    conn.fifo_owner = FifoOwner::Local;
    Ok(())
}

/// Provision data and descriptor FIFOs for `desc` per its memory strategy.
fn provision_fifos(
    platform: &Platform,
    desc: &PipeDescriptor,
    fifo_base_addr: u32,
    private_clocks: bool,
) -> Result<(MemBuffer, MemBuffer)> {
    match desc.mem_type {
        MemoryType::PipeMem => {
            let data = platform
                .backend
                .setup_pipe_fifo(desc.data_fifo_offset, desc.data_fifo_size)?;
            let desc_fifo = platform
                .backend
                .setup_pipe_fifo(desc.desc_fifo_offset, desc.desc_fifo_size)?;
            Ok((data, desc_fifo))
        }
        MemoryType::Private => {
            claim_private_ram(platform, desc.bam, private_clocks)?;
            map_fixed_window(platform, desc, fifo_base_addr).inspect_err(|_| {
                release_private_ram(platform);
            })
        }
        MemoryType::OffChip => map_fixed_window(platform, desc, fifo_base_addr),
        MemoryType::System => {
            let data = platform.memory.alloc_coherent(desc.data_fifo_size)?;
            let desc_fifo = match platform.memory.alloc_coherent(desc.desc_fifo_size) {
                Ok(buf) => buf,
                Err(err) => {
                    platform.memory.free_coherent(&data);
                    return Err(err.into());
                }
            };
            platform.memory.zero_fill(data.base, data.size);
            platform.memory.zero_fill(desc_fifo.base, desc_fifo.size);
            Ok((data, desc_fifo))
        }
    }
}

fn claim_private_ram(platform: &Platform, bam: BamType, private_clocks: bool) -> Result<()> {
    if !private_clocks {
        return Err(BamError::BackendFailure(BackendError::ClockUnavailable(
            "private ram clocks",
        )));
    }
    platform.memory.enable_private_clocks()?;
    let select = if bam == BamType::Hsusb {
        PRIVATE_RAM_SELECT_HSUSB
    } else {
        PRIVATE_RAM_SELECT_OTHER
    };
    platform.memory.write_private_ram_select(select);
    debug!(bam = %bam, select, "private ram claimed");
    Ok(())
}

fn release_private_ram(platform: &Platform) {
    platform.memory.write_private_ram_select(0);
    platform.memory.disable_private_clocks();
}

/// Map and zero the fixed window at `fifo_base_addr` plus the configured
/// offsets. Shared by the private and off-chip strategies.
fn map_fixed_window(
    platform: &Platform,
    desc: &PipeDescriptor,
    fifo_base_addr: u32,
) -> Result<(MemBuffer, MemBuffer)> {
    let data_phys = u64::from(fifo_base_addr) + u64::from(desc.data_fifo_offset);
    let desc_phys = u64::from(fifo_base_addr) + u64::from(desc.desc_fifo_offset);

    let data_base = platform.memory.map_io(data_phys, desc.data_fifo_size)?;
    let desc_base = match platform.memory.map_io(desc_phys, desc.desc_fifo_size) {
        Ok(base) => base,
        Err(err) => {
            platform.memory.unmap_io(data_base);
            return Err(err.into());
        }
    };
    platform.memory.zero_fill(data_base, desc.data_fifo_size);
    platform.memory.zero_fill(desc_base, desc.desc_fifo_size);

    Ok((
        MemBuffer {
            phys_base: data_phys,
            size: desc.data_fifo_size,
            base: data_base,
        },
        MemBuffer {
            phys_base: desc_phys,
            size: desc.desc_fifo_size,
            base: desc_base,
        },
    ))
}

fn release_fifos(platform: &Platform, mem_type: MemoryType, data: &MemBuffer, desc: &MemBuffer) {
    match mem_type {
        MemoryType::PipeMem => {}
        MemoryType::System => {
            for buf in [data, desc] {
                if buf.phys_base != 0 {
                    platform.memory.free_coherent(buf);
                }
            }
        }
        MemoryType::Private | MemoryType::OffChip => {
            if mem_type == MemoryType::Private {
                release_private_ram(platform);
            }
            for buf in [data, desc] {
                if buf.base != 0 {
                    platform.memory.unmap_io(buf.base);
                }
            }
        }
    }
}

/// Tear down pipe `index`. Disconnecting a pipe that is not enabled is a
/// no-op.
pub(crate) fn disconnect_locked(
    platform: &Platform,
    state: &mut TableState,
    index: usize,
) -> Result<()> {
    let conn = state.lookup_mut(index)?;
    if !conn.enabled {
        debug!(index, "connection not established, nothing to disconnect");
        return Ok(());
    }
    let Some(pipe) = conn.handle.take() else {
        return Err(BamError::InvalidArgument(format!(
            "pipe {index} is enabled without a backend endpoint"
        )));
    };

    if let Err(err) = platform.backend.disconnect(pipe) {
        error!(index, pipe = pipe.0, error = %err, "endpoint disconnect failed");
    }
    platform.backend.free_endpoint(pipe);

    if conn.fifo_owner == FifoOwner::Local {
        release_fifos(platform, conn.desc.mem_type, &conn.data_buf, &conn.desc_buf);
    }
    conn.data_buf = MemBuffer::default();
    conn.desc_buf = MemBuffer::default();
    conn.fifo_owner = FifoOwner::Local;
    conn.accel_client = None;
    conn.params.options.auto_enable = false;
    conn.event = EventInfo::default();
    debug!(index, label = %conn.desc.label, "pipe disconnected");

    state.mark_disabled(index);
    Ok(())
}

fn link(state: &TableState, index: usize, client: ClientHandle) -> AcceleratorLink {
    let conn = &state.pipes[index];
    AcceleratorLink {
        index,
        dir: conn.desc.dir,
        client,
        local_pipe_index: conn.local_pipe_index(),
        peer_pipe_index: conn.peer_pipe_index(),
    }
}

/// Connect pipe `index` to the accelerator. The returned flag is set when
/// this was the instance's first enabled pipe.
pub(crate) fn connect_accelerator_locked(
    platform: &Platform,
    state: &mut TableState,
    request: &AcceleratorConnect,
) -> Result<(AcceleratorLink, bool)> {
    let index = request.index;
    let conn = state.lookup(index)?;
    if conn.enabled {
        return match conn.accel_client {
            Some(client) => {
                debug!(index, "accelerator connection already established");
                Ok((link(state, index, client), false))
            }
            None => Err(BamError::InvalidArgument(format!(
                "pipe {index} is connected without the accelerator"
            ))),
        };
    }
    let desc = conn.desc.clone();
    let bam = desc.bam;
    reset_if_first(platform, state, bam)?;

    let local = platform.backend.map_physical(desc.local_phys_addr())?;
    {
        let conn = &mut state.pipes[index];
        conn.activity = request.activity.clone();
        conn.inactivity = request.inactivity.clone();
    }

    let (data, desc_fifo) = match desc.mem_type {
        MemoryType::PipeMem => {
            let (data, desc_fifo) =
                provision_fifos(platform, &desc, state.fifo_base_addr, state.private_clocks)?;
            (Some(data), Some(desc_fifo))
        }
        _ => (None, None),
    };
    let accel = platform.accelerator.connect(&AcceleratorRequest {
        client: request.client,
        client_bam: local,
        client_ep_index: desc.local_pipe_index(),
        data_fifo_size: desc.data_fifo_size,
        desc_fifo_size: desc.desc_fifo_size,
        data,
        desc: desc_fifo,
    })?;

    let pipe = match platform.backend.allocate_endpoint() {
        Ok(pipe) => pipe,
        Err(err) => {
            disconnect_accelerator_client(platform, accel.client);
            return Err(err.into());
        }
    };

    let conn = &mut state.pipes[index];
    let mut params = ConnectParams {
        data: accel.data,
        desc: accel.desc,
        event_thresh: EVENT_THRESHOLD,
        options: PipeOptions::auto_enable(),
        ..ConnectParams::default()
    };
    match desc.dir {
        Direction::LocalToPeer => {
            params.mode = ConnectMode::Source;
            params.source = local;
            params.src_pipe_index = conn.src_pipe_index;
            params.destination = accel.bam;
            params.dest_pipe_index = accel.pipe_index;
            params.options.no_disable = true;
            conn.dst_pipe_index = accel.pipe_index;
        }
        Direction::PeerToLocal => {
            params.mode = ConnectMode::Destination;
            params.source = accel.bam;
            params.src_pipe_index = accel.pipe_index;
            params.destination = local;
            params.dest_pipe_index = conn.dst_pipe_index;
            conn.src_pipe_index = accel.pipe_index;
        }
    }

    if let Err(err) = platform.backend.connect(pipe, &params) {
        error!(index, label = %desc.label, error = %err, "accelerator pipe connect failed");
        if let Err(err) = platform.backend.disconnect(pipe) {
            warn!(index, error = %err, "rollback disconnect failed");
        }
        platform.backend.free_endpoint(pipe);
        disconnect_accelerator_client(platform, accel.client);
        return Err(err.into());
    }

    conn.handle = Some(pipe);
    conn.params = params;
    conn.data_buf = accel.data;
    conn.desc_buf = accel.desc;
    conn.fifo_owner = FifoOwner::Accelerator;
    conn.accel_client = Some(accel.client);

    let first = state.bam(bam).enabled_count == 0;
    state.mark_enabled(index);
    debug!(
        index,
        bam = %bam,
        client = accel.client.0,
        accel_ep = accel.pipe_index,
        "pipe connected to accelerator"
    );
    Ok((link(state, index, accel.client), first))
}

fn disconnect_accelerator_client(platform: &Platform, client: ClientHandle) {
    if let Err(err) = platform.accelerator.disconnect(client) {
        warn!(client = client.0, error = %err, "accelerator rollback disconnect failed");
    }
}

/// Detach one accelerator link and disconnect its pipe.
pub(crate) fn disconnect_accelerator_locked(
    platform: &Platform,
    state: &mut TableState,
    link: &AcceleratorLink,
) -> Result<()> {
    let conn = state.lookup_mut(link.index)?;
    if !conn.enabled {
        debug!(index = link.index, "accelerator link already torn down");
        return Ok(());
    }
    platform.accelerator.disconnect(link.client)?;
    conn.data_buf.phys_base = 0;
    conn.desc_buf.phys_base = 0;
    disconnect_locked(platform, state, link.index)
}
