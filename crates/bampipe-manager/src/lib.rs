//! Connection manager for a controller's hardware data pipes.
//!
//! [`BamManager`] owns the pipe table loaded at start and drives everything
//! through the collaborators in [`bampipe_backend`]:
//! - plain and accelerator connects with per-strategy FIFO memory
//! - producer/consumer grant negotiation with bounded waits
//! - the plug/unplug handshake with the remote processor
//! - per-instance inactivity timers and wake-on-activity
//! - low-power gating around accelerator connect sequences
//!
//! Collaborator notifications are consumed by a dispatcher task, and the
//! handshake runs on its own worker task. Both live on the tokio runtime
//! the manager was started on.

mod adapter;
pub mod config;
pub mod control;
pub mod error;
pub mod handshake;
mod inactivity;
mod manager;
mod power;
pub mod resource;
pub mod table;

pub use adapter::{AcceleratorConnect, AcceleratorLink, AcceleratorTeardown};
pub use config::{ManagerConfig, TimeoutPolicy, NEGOTIATION_TIMEOUT};
pub use control::{format_timers, parse_timer_command, TimerCommand, TimerUpdate, TIMER_USAGE};
pub use error::{BamError, Result};
pub use handshake::{HandshakeState, HandshakeTransition};
pub use manager::BamManager;
pub use resource::{GrantState, WaitOutcome};
pub use table::{Callback, ConnectionInfo, EventKind, InstanceStatus, PipeStatus};
