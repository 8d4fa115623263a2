//! Value types shared by the collaborators and the manager.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bus instances the controller exposes.
pub const MAX_BAMS: usize = 3;

/// Plug/unplug bit exchanged with the remote processor.
pub const PLUG_UNPLUG_BIT: u32 = 0x2000;

/// Event threshold used for every endpoint connect.
pub const EVENT_THRESHOLD: u32 = 16;

/// Summing/event threshold used when registering a bus instance.
pub const DEVICE_THRESHOLD: u32 = 512;

/// One of the physical transport domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum BamType {
    Ssusb,
    Hsusb,
    Hsic,
}

impl BamType {
    /// All instances in index order.
    pub const ALL: [BamType; MAX_BAMS] = [BamType::Ssusb, BamType::Hsusb, BamType::Hsic];

    /// Dense index used for per-instance arrays.
    pub fn index(self) -> usize {
        match self {
            BamType::Ssusb => 0,
            BamType::Hsusb => 1,
            BamType::Hsic => 2,
        }
    }

    /// Canonical instance name.
    pub fn name(self) -> &'static str {
        match self {
            BamType::Ssusb => "ssusb",
            BamType::Hsusb => "hsusb",
            BamType::Hsic => "hsic",
        }
    }

    /// Resolve a controller core name to its bus instance.
    ///
    /// Core names are matched by substring: `ssusb`/`dwc3` first, then
    /// `hsic`, then `hsusb`/`ci`.
    pub fn from_core_name(name: &str) -> Option<Self> {
        if name.contains("ssusb") || name.contains("dwc3") {
            Some(BamType::Ssusb)
        } else if name.contains("hsic") {
            Some(BamType::Hsic)
        } else if name.contains("hsusb") || name.contains("ci") {
            Some(BamType::Hsusb)
        } else {
            None
        }
    }

    /// Whether this instance negotiates producer/consumer grants with the
    /// resource service.
    pub fn is_negotiated(self) -> bool {
        matches!(self, BamType::Hsusb | BamType::Hsic)
    }
}

impl fmt::Display for BamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for BamType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        BamType::from_core_name(&value).ok_or_else(|| format!("invalid bam name '{value}'"))
    }
}

impl From<BamType> for &'static str {
    fn from(bam: BamType) -> Self {
        bam.name()
    }
}

/// Transfer direction relative to the local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LocalToPeer,
    PeerToLocal,
}

/// The endpoint on the other side of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Companion modem processor.
    A2,
    /// Trace/debug subsystem.
    Qdss,
    /// Packet-routing accelerator.
    Ipa,
}

/// How a pipe's FIFOs are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Backend-managed region at a fixed offset.
    PipeMem,
    /// Controller-private RAM banks behind two auxiliary clocks.
    Private,
    /// Fixed off-chip physical window.
    OffChip,
    /// DMA-coherent system memory.
    System,
}

/// Backend endpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PipeHandle(pub u32);

/// Handle of a registered device (bus instance or peer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceHandle(pub u32);

/// Accelerator client handle returned by a successful accelerator connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientHandle(pub u32);

/// A FIFO memory region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemBuffer {
    /// Physical base address; zero when nothing is owned.
    pub phys_base: u64,
    /// Size in bytes.
    pub size: u32,
    /// Virtual mapping token; zero when unmapped.
    pub base: usize,
}

/// Which side of the endpoint the local controller drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectMode {
    #[default]
    Source,
    Destination,
}

/// Endpoint option flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipeOptions {
    pub auto_enable: bool,
    pub no_disable: bool,
    pub wakeup: bool,
    pub wakeup_oneshot: bool,
}

impl PipeOptions {
    pub fn auto_enable() -> Self {
        Self {
            auto_enable: true,
            ..Self::default()
        }
    }
}

/// Parameters of one endpoint connect call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectParams {
    pub mode: ConnectMode,
    pub source: DeviceHandle,
    pub src_pipe_index: u32,
    pub destination: DeviceHandle,
    pub dest_pipe_index: u32,
    pub data: MemBuffer,
    pub desc: MemBuffer,
    pub event_thresh: u32,
    pub options: PipeOptions,
}

/// Timer operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimerMode {
    OneShot,
}

/// Registration properties of a bus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProps {
    pub bam: BamType,
    pub num_pipes: u32,
    pub summing_threshold: u32,
    pub event_threshold: u32,
    /// Do not wait for the core's reset acknowledgement on pipe reset.
    pub no_ext_pipe_reset: bool,
    pub no_local_clk_gating: bool,
}

/// Inputs of an accelerator connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorRequest {
    /// Accelerator client type.
    pub client: u32,
    pub client_bam: DeviceHandle,
    pub client_ep_index: u32,
    pub data_fifo_size: u32,
    pub desc_fifo_size: u32,
    /// Pre-provisioned FIFOs when the pipe uses backend pipe memory.
    pub data: Option<MemBuffer>,
    pub desc: Option<MemBuffer>,
}

/// Result of a successful accelerator connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorConnection {
    pub bam: DeviceHandle,
    pub pipe_index: u32,
    pub data: MemBuffer,
    pub desc: MemBuffer,
    pub client: ClientHandle,
}

/// Producer or consumer side of a negotiated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Producer,
    Consumer,
}

/// Name of a negotiated resource, e.g. `USB_PROD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceName {
    pub bam: BamType,
    pub kind: ResourceKind,
}

impl ResourceName {
    pub fn producer(bam: BamType) -> Self {
        Self {
            bam,
            kind: ResourceKind::Producer,
        }
    }

    pub fn consumer(bam: BamType) -> Self {
        Self {
            bam,
            kind: ResourceKind::Consumer,
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.bam {
            BamType::Ssusb => "SSUSB",
            BamType::Hsusb => "USB",
            BamType::Hsic => "HSIC",
        };
        let suffix = match self.kind {
            ResourceKind::Producer => "PROD",
            ResourceKind::Consumer => "CONS",
        };
        write!(f, "{prefix}_{suffix}")
    }
}

/// Immediate answer of a resource request or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Done synchronously.
    Immediate,
    /// Completion will be signalled later.
    InProgress,
}

/// Asynchronous grant notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantEvent {
    Granted,
    Released,
}

/// Shared-state domain owned by one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateDomain {
    /// Bits written by this processor.
    Local,
    /// Bits written by the remote processor.
    Remote,
}
