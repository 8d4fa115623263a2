use std::fmt;
use std::sync::Arc;

use bampipe_backend::{EventSink, SharedState, StateDomain, PLUG_UNPLUG_BIT};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::table::Callback;

const TRANSITION_CAPACITY: usize = 64;

/// Handshake states, visited strictly in declaration order and back to
/// [`HandshakeState::Init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    #[default]
    Init,
    PlugNotified,
    PlugAcked,
    UnplugNotified,
}

impl HandshakeState {
    /// The only state reachable from `self`.
    pub fn successor(self) -> Self {
        match self {
            HandshakeState::Init => HandshakeState::PlugNotified,
            HandshakeState::PlugNotified => HandshakeState::PlugAcked,
            HandshakeState::PlugAcked => HandshakeState::UnplugNotified,
            HandshakeState::UnplugNotified => HandshakeState::Init,
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Init => "init",
            HandshakeState::PlugNotified => "plug_notified",
            HandshakeState::PlugAcked => "plug_acked",
            HandshakeState::UnplugNotified => "unplug_notified",
        };
        f.write_str(name)
    }
}

/// One committed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandshakeTransition {
    pub from: HandshakeState,
    pub to: HandshakeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    NotifyPlug,
    AckPlug,
    NotifyUnplug,
    CompleteUnplug,
}

/// Pure transition rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HandshakeMachine {
    state: HandshakeState,
    client_ready: bool,
    ack_received: bool,
}

impl HandshakeMachine {
    fn action(&self) -> Option<Action> {
        match self.state {
            HandshakeState::Init if self.client_ready => Some(Action::NotifyPlug),
            HandshakeState::PlugNotified if self.ack_received => Some(Action::AckPlug),
            HandshakeState::PlugAcked if !self.client_ready => Some(Action::NotifyUnplug),
            HandshakeState::UnplugNotified if self.ack_received => Some(Action::CompleteUnplug),
            _ => None,
        }
    }

    fn commit(&mut self, action: Action) -> HandshakeTransition {
        let from = self.state;
        if matches!(action, Action::AckPlug | Action::CompleteUnplug) {
            self.ack_received = false;
        }
        self.state = from.successor();
        HandshakeTransition {
            from,
            to: self.state,
        }
    }
}

#[derive(Default)]
struct HandshakeInner {
    machine: HandshakeMachine,
    queued: bool,
    pending_work: u32,
    last_remote: u32,
    reset_cb: Option<Callback>,
    subscribed: bool,
}

/// Four-state plug/unplug cycle driven by local intent and remote acks. A
/// single worker performs at most one transition per run; callers only flip
/// inputs and kick it.
pub(crate) struct Handshake {
    inner: Mutex<HandshakeInner>,
    notify: Notify,
    transitions: broadcast::Sender<HandshakeTransition>,
    shared_state: Arc<dyn SharedState>,
    sink: EventSink,
}

impl Handshake {
    pub fn new(shared_state: Arc<dyn SharedState>, sink: EventSink) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Mutex::new(HandshakeInner::default()),
            notify: Notify::new(),
            transitions,
            shared_state,
            sink,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.lock().machine.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandshakeTransition> {
        self.transitions.subscribe()
    }

    /// Record local intent. Unchanged values do not kick the worker.
    pub fn set_client_ready(&self, ready: bool) {
        let mut inner = self.inner.lock();
        if inner.machine.client_ready == ready {
            return;
        }
        debug!(ready, "client readiness changed");
        inner.machine.client_ready = ready;
        self.kick(&mut inner);
    }

    /// Remote shared state changed. Only a toggle of the plug bit counts as
    /// an acknowledgement.
    pub fn on_remote_state(&self, new: u32) {
        let current = new & PLUG_UNPLUG_BIT;
        let mut inner = self.inner.lock();
        if current == inner.last_remote {
            debug!(state = new, "remote plug bit unchanged, ignoring");
            return;
        }
        inner.last_remote = current;
        inner.machine.ack_received = true;
        self.kick(&mut inner);
    }

    /// Bind the peer-reset callback and subscribe to remote acknowledgements.
    /// An acknowledgement already latched in the remote state is delivered
    /// once before returning.
    pub fn register(&self, reset_cb: Callback) -> Result<()> {
        let subscribe = {
            let mut inner = self.inner.lock();
            inner.reset_cb = Some(reset_cb);
            !std::mem::replace(&mut inner.subscribed, true)
        };
        if subscribe {
            if let Err(err) = self.shared_state.register_callback(
                StateDomain::Remote,
                PLUG_UNPLUG_BIT,
                self.sink.clone(),
            ) {
                self.inner.lock().subscribed = false;
                return Err(err.into());
            }
        }

        let remote = self.shared_state.get_state(StateDomain::Remote);
        if remote & PLUG_UNPLUG_BIT != 0 {
            self.on_remote_state(remote);
        }
        Ok(())
    }

    pub fn unregister(&self) -> Result<()> {
        let unsubscribe = {
            let mut inner = self.inner.lock();
            inner.reset_cb = None;
            std::mem::replace(&mut inner.subscribed, false)
        };
        if unsubscribe {
            self.shared_state
                .unregister_callback(StateDomain::Remote, PLUG_UNPLUG_BIT)?;
        }
        Ok(())
    }

    fn kick(&self, inner: &mut HandshakeInner) {
        if inner.queued {
            inner.pending_work += 1;
        } else {
            inner.queued = true;
            self.notify.notify_one();
        }
    }

    /// One worker run: at most one transition, side effects outside the lock.
    fn run_once(&self) {
        let action = {
            let mut inner = self.inner.lock();
            inner.queued = false;
            inner.machine.action()
        };

        let mut advanced = false;
        if let Some(action) = action {
            if self.perform(action) {
                let transition = self.inner.lock().machine.commit(action);
                info!(from = %transition.from, to = %transition.to, "handshake transition");
                let _ = self.transitions.send(transition);
                advanced = true;
            }
        }

        let mut inner = self.inner.lock();
        if inner.pending_work > 0 {
            inner.pending_work -= 1;
            self.kick(&mut inner);
        } else if advanced && inner.machine.action().is_some() {
            self.kick(&mut inner);
        }
    }

    fn perform(&self, action: Action) -> bool {
        let result = match action {
            Action::NotifyPlug => {
                self.shared_state
                    .change_state(StateDomain::Local, 0, PLUG_UNPLUG_BIT)
            }
            Action::NotifyUnplug => {
                self.shared_state
                    .change_state(StateDomain::Local, PLUG_UNPLUG_BIT, 0)
            }
            Action::CompleteUnplug => {
                let reset_cb = self.inner.lock().reset_cb.clone();
                if let Some(reset_cb) = reset_cb {
                    reset_cb();
                }
                Ok(())
            }
            Action::AckPlug => Ok(()),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(?action, error = %err, "failed to signal remote processor");
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("handshake worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => self.run_once(),
            }
        }
        debug!("handshake worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bampipe_backend::sim::{SimOp, SimPlatform};

    use super::*;

    fn handshake(sim: &Arc<SimPlatform>) -> Handshake {
        let (sink, _rx) = EventSink::channel(8);
        Handshake::new(sim.clone(), sink)
    }

    /// Drain the worker synchronously.
    fn drain(hs: &Handshake) {
        while hs.inner.lock().queued {
            hs.run_once();
        }
    }

    #[test]
    fn machine_only_takes_cycle_edges() {
        let mut machine = HandshakeMachine::default();
        assert_eq!(machine.action(), None);
        machine.ack_received = true;
        assert_eq!(machine.action(), None);

        machine.client_ready = true;
        let t = machine.commit(machine.action().unwrap());
        assert_eq!(t.to, HandshakeState::PlugNotified);
        let t = machine.commit(machine.action().unwrap());
        assert_eq!(t.to, HandshakeState::PlugAcked);
        assert!(!machine.ack_received);
        assert_eq!(machine.action(), None);

        machine.client_ready = false;
        machine.commit(machine.action().unwrap());
        assert_eq!(machine.state, HandshakeState::UnplugNotified);
        machine.ack_received = true;
        machine.commit(machine.action().unwrap());
        assert_eq!(machine.state, HandshakeState::Init);
    }

    #[test]
    fn kicks_while_queued_count_as_pending_work() {
        let sim = SimPlatform::new();
        let hs = handshake(&sim);
        hs.set_client_ready(true);
        hs.on_remote_state(PLUG_UNPLUG_BIT);
        hs.on_remote_state(PLUG_UNPLUG_BIT);
        {
            let inner = hs.inner.lock();
            assert!(inner.queued);
            assert_eq!(inner.pending_work, 1);
        }
        drain(&hs);
        assert_eq!(hs.state(), HandshakeState::PlugAcked);
        assert_eq!(hs.inner.lock().pending_work, 0);
    }

    #[test]
    fn plug_and_unplug_signal_remote() {
        let sim = SimPlatform::new();
        let hs = handshake(&sim);

        hs.set_client_ready(true);
        drain(&hs);
        assert_eq!(hs.state(), HandshakeState::PlugNotified);
        assert_eq!(sim.shared_state(StateDomain::Local), PLUG_UNPLUG_BIT);

        hs.on_remote_state(PLUG_UNPLUG_BIT);
        hs.set_client_ready(false);
        drain(&hs);
        assert_eq!(hs.state(), HandshakeState::UnplugNotified);
        assert_eq!(sim.shared_state(StateDomain::Local), 0);
        assert!(sim.ops().contains(&SimOp::ChangeState {
            domain: StateDomain::Local,
            clear: PLUG_UNPLUG_BIT,
            set: 0,
        }));
    }

    #[test]
    fn reset_callback_runs_on_unplug_ack() {
        let sim = SimPlatform::new();
        let hs = handshake(&sim);
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = resets.clone();
        hs.register(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        hs.set_client_ready(true);
        drain(&hs);
        hs.on_remote_state(PLUG_UNPLUG_BIT);
        drain(&hs);
        hs.set_client_ready(false);
        drain(&hs);
        assert_eq!(resets.load(Ordering::SeqCst), 0);
        hs.on_remote_state(0);
        drain(&hs);

        assert_eq!(hs.state(), HandshakeState::Init);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_delivers_latched_ack_once() {
        let sim = SimPlatform::new();
        sim.set_remote_state(0, PLUG_UNPLUG_BIT);
        let hs = handshake(&sim);

        hs.register(Arc::new(|| {})).unwrap();
        assert!(hs.inner.lock().machine.ack_received);
        assert_eq!(sim.subscription_count(), 1);

        hs.register(Arc::new(|| {})).unwrap();
        assert_eq!(sim.subscription_count(), 1);

        hs.unregister().unwrap();
        assert_eq!(sim.subscription_count(), 0);
        assert!(hs.inner.lock().reset_cb.is_none());
    }

    #[test]
    fn repeated_intent_does_not_kick() {
        let sim = SimPlatform::new();
        let hs = handshake(&sim);
        hs.set_client_ready(false);
        assert!(!hs.inner.lock().queued);
    }

    #[tokio::test]
    async fn worker_publishes_transitions() {
        let sim = SimPlatform::new();
        let hs = Arc::new(handshake(&sim));
        let mut transitions = hs.subscribe();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(hs.clone().run(cancel.clone()));

        hs.set_client_ready(true);
        let t = transitions.recv().await.unwrap();
        assert_eq!(
            t,
            HandshakeTransition {
                from: HandshakeState::Init,
                to: HandshakeState::PlugNotified,
            }
        );

        cancel.cancel();
        worker.await.unwrap();
    }
}
