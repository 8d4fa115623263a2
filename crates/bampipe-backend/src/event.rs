use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{BackendError, Result};
use crate::types::{BamType, GrantEvent, StateDomain};

/// Asynchronous notification raised by a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// Wake interrupt on the pipe registered with `token`.
    Wake { token: usize },
    /// The instance's inactivity timer fired.
    TimerExpired { bam: BamType },
    /// Producer grant state changed on the resource service.
    Producer { bam: BamType, event: GrantEvent },
    /// Shared-state bits changed.
    SharedStateChanged {
        domain: StateDomain,
        old: u32,
        new: u32,
    },
}

/// Cloneable handle collaborators use to deliver events to the manager.
///
/// Delivery never blocks: it is safe to call from interrupt-like contexts.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<BackendEvent>,
}

impl EventSink {
    /// Create a bounded event channel.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<BackendEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event for the manager.
    pub fn deliver(&self, event: BackendEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(event) => {
                warn!(?event, "event queue full, dropping event");
                BackendError::EventQueueFull
            }
            mpsc::error::TrySendError::Closed(_) => BackendError::EventQueueClosed,
        })
    }
}
