//! Connection manager for a controller's hardware data pipes.
//!
//! bampipe owns the pipes between a bus controller and its peers (a modem,
//! a trace subsystem, a packet-routing accelerator): FIFO provisioning,
//! grant negotiation, the plug/unplug handshake, inactivity timers and
//! low-power gating.
//!
//! # Crate Structure
//!
//! - [`backend`]: collaborator traits, value types and the simulated platform
//! - [`config`]: load-time pipe table with JSON Schema validation
//! - [`manager`]: the connection manager itself

/// Re-export backend types.
pub mod backend {
    pub use bampipe_backend::*;
}

/// Re-export pipe table types.
pub mod config {
    pub use bampipe_config::*;
}

/// Re-export manager types.
pub mod manager {
    pub use bampipe_manager::*;
}
