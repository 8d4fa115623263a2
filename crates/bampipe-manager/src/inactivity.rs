use bampipe_backend::{BamType, Direction, PipeOptions, TimerMode, WakeRegistration};
use tracing::{debug, error, warn};

use crate::error::{BamError, Result};
use crate::manager::{Shared, Work};
use crate::table::{Callback, EventKind, TableState};

impl Shared {
    /// Configure and restart the instance timer through the instance's
    /// first endpoint. Must not be called with the table lock held.
    pub(crate) fn arm_timer(&self, bam: BamType) {
        let (pipe, timeout_ms) = {
            let state = self.table.lock();
            (state.timer_pipe(bam), state.bam(bam).timer_ms)
        };
        let Some(pipe) = pipe else {
            debug!(bam = %bam, "no endpoint to drive the inactivity timer");
            return;
        };

        let backend = &self.platform.backend;
        if let Err(err) = backend.configure_timer(pipe, TimerMode::OneShot, timeout_ms) {
            error!(bam = %bam, error = %err, "timer configuration failed");
            return;
        }
        if let Err(err) = backend.reset_timer(pipe) {
            error!(bam = %bam, error = %err, "timer reset failed");
            return;
        }
        debug!(bam = %bam, timeout_ms, "inactivity timer armed");
    }

    /// Mark `bam` inactive and queue one inactivity event, on the first pipe
    /// carrying an inactivity callback.
    pub(crate) fn on_timer_expired(&self, bam: BamType) {
        let mut state = self.table.lock();
        state.bam_mut(bam).inactive = true;
        let notified = state
            .pipes
            .iter()
            .position(|conn| conn.desc.bam == bam && conn.inactivity.is_some())
            .or_else(|| state.pipes.iter().position(|conn| conn.desc.bam == bam));
        let Some(index) = notified else {
            warn!(bam = %bam, "inactivity timer fired for an instance without pipes");
            return;
        };
        debug!(bam = %bam, index, "instance inactive");
        let conn = &mut state.pipes[index];
        conn.event.kind = EventKind::Inactivity;
        conn.event.callback = conn.inactivity.clone();
        self.queue_event(&mut state, index);
    }

    /// Wake interrupt on pipe `index`. Per-pipe wakes always dispatch; a
    /// global wake dispatches only for the first pipe to signal after the
    /// instance went inactive.
    pub(crate) fn on_wake(&self, index: usize) {
        let mut state = self.table.lock();
        let Ok(conn) = state.lookup(index) else {
            warn!(index, "wake for unknown pipe");
            return;
        };
        let bam = conn.desc.bam;
        let kind = conn.event.kind;
        match kind {
            EventKind::WakeupPipe => self.queue_event(&mut state, index),
            EventKind::WakeupGlobal => {
                let ctx = state.bam_mut(bam);
                if !ctx.inactive {
                    debug!(bam = %bam, index, "instance already active, wake suppressed");
                    return;
                }
                ctx.inactive = false;
                self.queue_event(&mut state, index);
            }
            kind => debug!(index, ?kind, "wake without a wake registration"),
        }
    }

    fn queue_event(&self, state: &mut TableState, index: usize) {
        let event = &mut state.pipes[index].event;
        if event.queued {
            debug!(index, kind = ?event.kind, "event already queued");
            return;
        }
        event.queued = true;
        if self.work_tx.send(Work::PipeEvent { index }).is_err() {
            event.queued = false;
            warn!(index, "dispatcher gone, event dropped");
        }
    }

    /// Attach (or with `None`, detach) a wake callback to pipe `index`.
    pub(crate) fn register_wake_locked(
        &self,
        state: &mut TableState,
        index: usize,
        callback: Option<Callback>,
        per_pipe: bool,
    ) -> Result<()> {
        let conn = state.lookup_mut(index)?;
        let Some(pipe) = conn.handle else {
            return Err(BamError::InvalidArgument(format!(
                "pipe {index} has no backend endpoint"
            )));
        };

        conn.event.kind = if per_pipe {
            EventKind::WakeupPipe
        } else {
            EventKind::WakeupGlobal
        };
        let wake = callback.is_some().then(|| WakeRegistration {
            token: index,
            sink: self.sink.clone(),
        });
        let options = if callback.is_some() {
            PipeOptions {
                auto_enable: true,
                wakeup: true,
                wakeup_oneshot: true,
                ..PipeOptions::default()
            }
        } else {
            PipeOptions::auto_enable()
        };
        conn.event.callback = callback;

        let backend = &self.platform.backend;
        backend.register_wake_event(pipe, wake)?;
        backend.set_options(pipe, options)?;
        conn.params.options = options;
        debug!(index, kind = ?conn.event.kind, ?options, "wake registration updated");
        Ok(())
    }

    /// Run the deferred callback queued on pipe `index`.
    pub(crate) fn dispatch_pipe_event(&self, index: usize) {
        let (kind, callback, bam) = {
            let mut state = self.table.lock();
            let Ok(conn) = state.lookup_mut(index) else {
                return;
            };
            conn.event.queued = false;
            (conn.event.kind, conn.event.callback.clone(), conn.desc.bam)
        };

        match kind {
            EventKind::WakeupGlobal | EventKind::WakeupPipe => {
                debug!(index, ?kind, "dispatching wake");
                if let Some(callback) = callback {
                    callback();
                }
                if self.table.lock().bam(bam).timer_ms != 0 {
                    self.arm_timer(bam);
                }
            }
            EventKind::Inactivity => {
                debug!(bam = %bam, "dispatching inactivity");
                self.register_activity_wakes(bam);
                if let Some(callback) = callback {
                    callback();
                }
            }
            EventKind::None => debug!(index, "no event to dispatch"),
        }
    }

    /// Arm a global wake on every enabled inbound pipe of `bam`.
    fn register_activity_wakes(&self, bam: BamType) {
        let mut state = self.table.lock();
        let inbound: Vec<usize> = state
            .pipes
            .iter()
            .enumerate()
            .filter(|(_, conn)| {
                conn.desc.bam == bam && conn.enabled && conn.desc.dir == Direction::PeerToLocal
            })
            .map(|(index, _)| index)
            .collect();
        for index in inbound {
            let activity = state.pipes[index].activity.clone();
            if let Err(err) = self.register_wake_locked(&mut state, index, activity, false) {
                error!(index, error = %err, "failed to register activity wake");
            }
        }
    }
}
