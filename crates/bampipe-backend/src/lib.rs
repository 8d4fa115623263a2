//! Collaborator seam for the pipe manager.
//!
//! The manager never touches hardware directly. Everything it drives is
//! reached through the traits in this crate:
//! - [`PipeBackend`]: endpoint allocation, FIFO setup, connects, wake events, timers
//! - [`PlatformMemory`]: private RAM clocks, fixed windows, coherent memory
//! - [`Accelerator`]: packet-routing accelerator connects
//! - [`ResourceService`]: producer/consumer grant negotiation
//! - [`SharedState`]: cross-processor state bits
//!
//! Asynchronous notifications flow back as [`BackendEvent`]s through an
//! [`EventSink`]. [`sim::SimPlatform`] implements all of it in memory.

pub mod error;
pub mod event;
pub mod sim;
pub mod traits;
pub mod types;

pub use error::{BackendError, Result};
pub use event::{BackendEvent, EventSink};
pub use traits::{
    Accelerator, ConsumerHooks, PipeBackend, Platform, PlatformMemory, PowerControl,
    ResourceService, SharedState, WakeRegistration,
};
pub use types::*;
