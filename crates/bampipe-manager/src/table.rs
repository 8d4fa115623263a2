use std::sync::Arc;

use bampipe_backend::{
    BamType, ClientHandle, ConnectParams, DeviceHandle, Direction, MemBuffer, MemoryType,
    PeerRole, PipeHandle, MAX_BAMS,
};
use bampipe_config::{PipeDescriptor, PipeTable};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{BamError, Result};
use crate::power::LowPowerGate;

/// User notification hook (activity, inactivity, wake, peer reset).
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Kind of deferred callback currently attached to a pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    None,
    /// Instance-wide wake: only the first pipe to signal is dispatched.
    WakeupGlobal,
    /// Per-pipe wake: always dispatched.
    WakeupPipe,
    Inactivity,
}

#[derive(Clone, Default)]
pub(crate) struct EventInfo {
    pub kind: EventKind,
    pub callback: Option<Callback>,
    pub queued: bool,
}

/// Who provisioned a pipe's FIFOs and therefore releases them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum FifoOwner {
    #[default]
    Local,
    Accelerator,
}

pub(crate) struct PipeConnection {
    pub desc: PipeDescriptor,
    pub src_pipe_index: u32,
    pub dst_pipe_index: u32,
    pub enabled: bool,
    pub handle: Option<PipeHandle>,
    pub params: ConnectParams,
    pub data_buf: MemBuffer,
    pub desc_buf: MemBuffer,
    pub fifo_owner: FifoOwner,
    pub accel_client: Option<ClientHandle>,
    pub activity: Option<Callback>,
    pub inactivity: Option<Callback>,
    pub event: EventInfo,
}

impl PipeConnection {
    fn new(desc: PipeDescriptor) -> Self {
        Self {
            src_pipe_index: desc.src_pipe_index,
            dst_pipe_index: desc.dst_pipe_index,
            desc,
            enabled: false,
            handle: None,
            params: ConnectParams::default(),
            data_buf: MemBuffer::default(),
            desc_buf: MemBuffer::default(),
            fifo_owner: FifoOwner::Local,
            accel_client: None,
            activity: None,
            inactivity: None,
            event: EventInfo::default(),
        }
    }

    pub fn local_pipe_index(&self) -> u32 {
        match self.desc.dir {
            Direction::LocalToPeer => self.src_pipe_index,
            Direction::PeerToLocal => self.dst_pipe_index,
        }
    }

    pub fn peer_pipe_index(&self) -> u32 {
        match self.desc.dir {
            Direction::LocalToPeer => self.dst_pipe_index,
            Direction::PeerToLocal => self.src_pipe_index,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct BamContext {
    pub device: Option<DeviceHandle>,
    pub enabled_count: usize,
    pub timer_ms: u32,
    pub inactive: bool,
    pub reset_on_connect: bool,
}

/// Guarded by the manager's table lock.
pub(crate) struct TableState {
    pub pipes: Vec<PipeConnection>,
    pub bams: [BamContext; MAX_BAMS],
    pub fifo_base_addr: u32,
    pub private_clocks: bool,
    pub qdss_core: Option<BamType>,
    pub lpm: LowPowerGate,
}

impl TableState {
    pub fn new(table: &PipeTable, private_clocks: bool) -> Self {
        let mut bams: [BamContext; MAX_BAMS] = Default::default();
        for bam in BamType::ALL {
            bams[bam.index()].reset_on_connect = table.reset_on_connect(bam);
        }
        Self {
            pipes: table.pipes.iter().cloned().map(PipeConnection::new).collect(),
            bams,
            fifo_base_addr: table.fifo_base_addr,
            private_clocks,
            qdss_core: table.qdss_core,
            lpm: LowPowerGate::default(),
        }
    }

    pub fn lookup(&self, index: usize) -> Result<&PipeConnection> {
        let count = self.pipes.len();
        self.pipes
            .get(index)
            .ok_or(BamError::OutOfRange { index, count })
    }

    pub fn lookup_mut(&mut self, index: usize) -> Result<&mut PipeConnection> {
        let count = self.pipes.len();
        self.pipes
            .get_mut(index)
            .ok_or(BamError::OutOfRange { index, count })
    }

    pub fn find(&self, bam: BamType, peer: PeerRole, dir: Direction, pipe_num: u8) -> Result<usize> {
        match self
            .pipes
            .iter()
            .position(|conn| conn.desc.matches(bam, peer, dir, pipe_num))
        {
            Some(index) => {
                debug!(index, "connection found");
                Ok(index)
            }
            None => Err(BamError::NotFound(format!(
                "{bam} {peer:?} {dir:?} pipe {pipe_num}"
            ))),
        }
    }

    pub fn bam(&self, bam: BamType) -> &BamContext {
        &self.bams[bam.index()]
    }

    pub fn bam_mut(&mut self, bam: BamType) -> &mut BamContext {
        &mut self.bams[bam.index()]
    }

    pub fn mark_enabled(&mut self, index: usize) {
        let bam = self.pipes[index].desc.bam;
        self.pipes[index].enabled = true;
        self.bam_mut(bam).enabled_count += 1;
    }

    /// Clear `enabled` and decrement the instance counter. An underflow is
    /// logged and otherwise ignored.
    pub fn mark_disabled(&mut self, index: usize) {
        let bam = self.pipes[index].desc.bam;
        self.pipes[index].enabled = false;
        let ctx = self.bam_mut(bam);
        if ctx.enabled_count == 0 {
            error!(bam = %bam, index, "enabled pipe counter already zero");
        } else {
            ctx.enabled_count -= 1;
        }
    }

    /// Whether every instance counter equals its number of enabled pipes.
    pub fn counters_consistent(&self) -> bool {
        BamType::ALL.into_iter().all(|bam| {
            let enabled = self
                .pipes
                .iter()
                .filter(|conn| conn.desc.bam == bam && conn.enabled)
                .count();
            self.bam(bam).enabled_count == enabled
        })
    }

    /// Endpoint used to drive the instance-wide timer: the first pipe of the
    /// instance that currently owns a backend endpoint.
    pub fn timer_pipe(&self, bam: BamType) -> Option<PipeHandle> {
        self.pipes
            .iter()
            .filter(|conn| conn.desc.bam == bam)
            .find_map(|conn| conn.handle)
    }

    pub fn status(&self, index: usize) -> Result<PipeStatus> {
        let conn = self.lookup(index)?;
        Ok(PipeStatus {
            index,
            label: conn.desc.label.clone(),
            bam: conn.desc.bam,
            peer: conn.desc.peer,
            dir: conn.desc.dir,
            mem_type: conn.desc.mem_type,
            enabled: conn.enabled,
            local_pipe_index: conn.local_pipe_index(),
            peer_pipe_index: conn.peer_pipe_index(),
            handle: conn.handle,
            wake: conn.event.kind,
        })
    }

    pub fn instance_status(&self, bam: BamType) -> InstanceStatus {
        let ctx = self.bam(bam);
        InstanceStatus {
            bam,
            registered: ctx.device.is_some(),
            enabled_pipes: ctx.enabled_count,
            inactivity_timer_ms: ctx.timer_ms,
            inactive: ctx.inactive,
        }
    }
}

/// Snapshot of one pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipeStatus {
    pub index: usize,
    pub label: String,
    pub bam: BamType,
    pub peer: PeerRole,
    pub dir: Direction,
    pub mem_type: MemoryType,
    pub enabled: bool,
    pub local_pipe_index: u32,
    pub peer_pipe_index: u32,
    pub handle: Option<PipeHandle>,
    pub wake: EventKind,
}

/// Snapshot of one bus instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub bam: BamType,
    pub registered: bool,
    pub enabled_pipes: usize,
    pub inactivity_timer_ms: u32,
    pub inactive: bool,
}

/// Endpoint wiring of a pipe, oriented from the local controller's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Device handle of the local controller's bus instance.
    pub device: DeviceHandle,
    pub local_pipe_index: u32,
    pub peer_pipe_index: u32,
    pub data_fifo: MemBuffer,
    pub desc_fifo: MemBuffer,
}

impl ConnectionInfo {
    pub(crate) fn from_connection(conn: &PipeConnection) -> Self {
        let device = match conn.desc.dir {
            Direction::LocalToPeer => conn.params.source,
            Direction::PeerToLocal => conn.params.destination,
        };
        Self {
            device,
            local_pipe_index: conn.local_pipe_index(),
            peer_pipe_index: conn.peer_pipe_index(),
            data_fifo: conn.data_buf,
            desc_fifo: conn.desc_buf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PipeTable {
        PipeTable::from_json_str(
            r#"{
                "num_pipes": 8,
                "pipes": [
                    { "label": "hsusb-a2-out-0", "mem_type": "system", "bam": "hsusb",
                      "peer": "a2", "dir": "local_to_peer", "pipe_num": 0,
                      "src_pipe_index": 1, "dst_pipe_index": 4,
                      "data_fifo_size": 1024, "desc_fifo_size": 256 },
                    { "label": "hsusb-a2-in-0", "mem_type": "system", "bam": "hsusb",
                      "peer": "a2", "dir": "peer_to_local", "pipe_num": 0,
                      "src_pipe_index": 5, "dst_pipe_index": 0,
                      "data_fifo_size": 1024, "desc_fifo_size": 256 }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn lookup_past_end_is_out_of_range() {
        let state = TableState::new(&table(), true);
        assert!(state.lookup(1).is_ok());
        assert!(matches!(
            state.lookup(2),
            Err(BamError::OutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn find_matches_full_selector() {
        let state = TableState::new(&table(), true);
        assert_eq!(
            state
                .find(BamType::Hsusb, PeerRole::A2, Direction::PeerToLocal, 0)
                .unwrap(),
            1
        );
        assert!(matches!(
            state.find(BamType::Hsic, PeerRole::A2, Direction::PeerToLocal, 0),
            Err(BamError::NotFound(_))
        ));
    }

    #[test]
    fn counter_underflow_is_tolerated() {
        let mut state = TableState::new(&table(), true);
        state.mark_enabled(0);
        assert_eq!(state.bam(BamType::Hsusb).enabled_count, 1);
        state.mark_disabled(0);
        state.mark_disabled(0);
        assert_eq!(state.bam(BamType::Hsusb).enabled_count, 0);
        assert!(state.counters_consistent());
    }

    #[test]
    fn pipe_indices_are_oriented_by_direction() {
        let state = TableState::new(&table(), true);
        let out = state.lookup(0).unwrap();
        assert_eq!((out.local_pipe_index(), out.peer_pipe_index()), (1, 4));
        let inbound = state.lookup(1).unwrap();
        assert_eq!(
            (inbound.local_pipe_index(), inbound.peer_pipe_index()),
            (0, 5)
        );
    }
}
