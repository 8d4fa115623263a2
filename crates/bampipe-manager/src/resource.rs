use std::sync::{Arc, Weak};
use std::time::Duration;

use bampipe_backend::{
    BamType, ConsumerHooks, GrantEvent, RequestStatus, ResourceName, ResourceService, MAX_BAMS,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::{ManagerConfig, TimeoutPolicy};
use crate::error::{BamError, Result};
use crate::manager::Shared;

/// Grant state of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    Granted,
    Released,
}

/// How a negotiation call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Already in the requested state, or the instance does not negotiate.
    AlreadySatisfied,
    /// The service answered synchronously.
    Immediate,
    /// The completion arrived before the deadline.
    Completed,
    /// The deadline passed; the caller proceeds without the grant.
    TimedOut,
    /// The service refused; the caller proceeds without the grant.
    Rejected,
}

/// One `watch` channel per resource, so a completion that lands before the
/// wait starts is still seen.
pub(crate) struct ResourceClient {
    service: Arc<dyn ResourceService>,
    timeout: Duration,
    policy: TimeoutPolicy,
    producer: [watch::Sender<GrantState>; MAX_BAMS],
    consumer: [watch::Sender<GrantState>; MAX_BAMS],
}

fn released() -> watch::Sender<GrantState> {
    watch::channel(GrantState::Released).0
}

impl ResourceClient {
    pub fn new(service: Arc<dyn ResourceService>, config: &ManagerConfig) -> Self {
        Self {
            service,
            timeout: config.negotiation_timeout,
            policy: config.timeout_policy,
            producer: [released(), released(), released()],
            consumer: [released(), released(), released()],
        }
    }

    pub fn producer_state(&self, bam: BamType) -> GrantState {
        *self.producer[bam.index()].borrow()
    }

    pub fn consumer_state(&self, bam: BamType) -> GrantState {
        *self.consumer[bam.index()].borrow()
    }

    pub fn on_producer_event(&self, bam: BamType, event: GrantEvent) {
        let state = match event {
            GrantEvent::Granted => GrantState::Granted,
            GrantEvent::Released => GrantState::Released,
        };
        debug!(resource = %ResourceName::producer(bam), ?state, "producer state changed");
        self.producer[bam.index()].send_replace(state);
    }

    pub fn set_consumer(&self, bam: BamType, state: GrantState) {
        debug!(resource = %ResourceName::consumer(bam), ?state, "consumer state changed");
        self.consumer[bam.index()].send_replace(state);
    }

    pub async fn request_producer(&self, bam: BamType) -> Result<WaitOutcome> {
        if !bam.is_negotiated() {
            return Ok(WaitOutcome::AlreadySatisfied);
        }
        let name = ResourceName::producer(bam);
        if self.consumer_state(bam) == GrantState::Granted {
            debug!(resource = %ResourceName::consumer(bam), "consumer already granted");
        }
        if self.producer_state(bam) == GrantState::Granted {
            debug!(resource = %name, "producer already granted");
            return Ok(WaitOutcome::AlreadySatisfied);
        }

        debug!(resource = %name, "requesting producer");
        match self.service.request(name) {
            Ok(RequestStatus::Immediate) => {
                self.producer[bam.index()].send_replace(GrantState::Granted);
                debug!(resource = %name, "producer granted without wait");
                Ok(WaitOutcome::Immediate)
            }
            Ok(RequestStatus::InProgress) => {
                self.wait_for(&self.producer[bam.index()], GrantState::Granted, name)
                    .await
            }
            Err(err) => self.on_service_error(name, err),
        }
    }

    pub async fn release_producer(&self, bam: BamType) -> Result<WaitOutcome> {
        if !bam.is_negotiated() {
            return Ok(WaitOutcome::AlreadySatisfied);
        }
        let name = ResourceName::producer(bam);
        if self.consumer_state(bam) == GrantState::Released {
            debug!(resource = %ResourceName::consumer(bam), "consumer already released");
        }
        if self.producer_state(bam) == GrantState::Released {
            debug!(resource = %name, "producer already released");
            return Ok(WaitOutcome::AlreadySatisfied);
        }

        debug!(resource = %name, "releasing producer");
        match self.service.release(name) {
            Ok(RequestStatus::Immediate) => {
                self.producer[bam.index()].send_replace(GrantState::Released);
                debug!(resource = %name, "producer released without wait");
                Ok(WaitOutcome::Immediate)
            }
            Ok(RequestStatus::InProgress) => {
                self.wait_for(&self.producer[bam.index()], GrantState::Released, name)
                    .await
            }
            Err(err) => self.on_service_error(name, err),
        }
    }

    /// Wait until the service grants the consumer resource.
    pub async fn wait_consumer_granted(&self, bam: BamType) -> Result<WaitOutcome> {
        if !bam.is_negotiated() || self.consumer_state(bam) == GrantState::Granted {
            return Ok(WaitOutcome::AlreadySatisfied);
        }
        let name = ResourceName::consumer(bam);
        self.wait_for(&self.consumer[bam.index()], GrantState::Granted, name)
            .await
    }

    /// Wait until the service releases the consumer resource. Skipped once
    /// the producer is already released.
    pub async fn wait_consumer_released(&self, bam: BamType) -> Result<WaitOutcome> {
        if !bam.is_negotiated() || self.consumer_state(bam) == GrantState::Released {
            return Ok(WaitOutcome::AlreadySatisfied);
        }
        if self.producer_state(bam) == GrantState::Released {
            debug!(bam = %bam, "producer released, not waiting for consumer release");
            return Ok(WaitOutcome::AlreadySatisfied);
        }
        let name = ResourceName::consumer(bam);
        self.wait_for(&self.consumer[bam.index()], GrantState::Released, name)
            .await
    }

    pub fn notify_completion(&self, event: GrantEvent, name: ResourceName) {
        debug!(resource = %name, ?event, "notifying completion");
        if let Err(err) = self.service.notify_completion(event, name) {
            warn!(resource = %name, error = %err, "completion notification failed");
        }
    }

    async fn wait_for(
        &self,
        tx: &watch::Sender<GrantState>,
        target: GrantState,
        name: ResourceName,
    ) -> Result<WaitOutcome> {
        let mut rx = tx.subscribe();
        debug!(resource = %name, ?target, "waiting for completion");
        let reached = tokio::time::timeout(self.timeout, async move {
            rx.wait_for(|state| *state == target).await.is_ok()
        })
        .await;

        match reached {
            Ok(true) => Ok(WaitOutcome::Completed),
            Ok(false) => Err(BamError::Shutdown),
            Err(_) => match self.policy {
                TimeoutPolicy::BestEffort => {
                    warn!(
                        resource = %name,
                        ?target,
                        timeout = ?self.timeout,
                        "timed out waiting for resource, continuing"
                    );
                    Ok(WaitOutcome::TimedOut)
                }
                TimeoutPolicy::FailFast => Err(BamError::Timeout {
                    what: format!("{name} {target:?}"),
                    after: self.timeout,
                }),
            },
        }
    }

    fn on_service_error(
        &self,
        name: ResourceName,
        err: bampipe_backend::BackendError,
    ) -> Result<WaitOutcome> {
        match self.policy {
            TimeoutPolicy::BestEffort => {
                error!(resource = %name, error = %err, "resource service refused request");
                Ok(WaitOutcome::Rejected)
            }
            TimeoutPolicy::FailFast => Err(BamError::BackendFailure(err)),
        }
    }
}

/// Consumer callbacks registered with the resource service.
///
/// A grant completes immediately when the instance already has enabled
/// pipes; a release completes immediately when it has none.
pub(crate) struct ConsumerHandle {
    pub bam: BamType,
    pub shared: Weak<Shared>,
}

impl ConsumerHooks for ConsumerHandle {
    fn request(&self) -> RequestStatus {
        let Some(shared) = self.shared.upgrade() else {
            return RequestStatus::InProgress;
        };
        debug!(resource = %ResourceName::consumer(self.bam), "consumer requested");
        shared.resources.set_consumer(self.bam, GrantState::Granted);
        if shared.table.lock().bam(self.bam).enabled_count > 0 {
            RequestStatus::Immediate
        } else {
            RequestStatus::InProgress
        }
    }

    fn release(&self) -> RequestStatus {
        let Some(shared) = self.shared.upgrade() else {
            return RequestStatus::Immediate;
        };
        debug!(resource = %ResourceName::consumer(self.bam), "consumer released");
        shared.resources.set_consumer(self.bam, GrantState::Released);
        if shared.table.lock().bam(self.bam).enabled_count == 0 {
            RequestStatus::Immediate
        } else {
            RequestStatus::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use bampipe_backend::sim::{ProducerMode, SimOp, SimPlatform};
    use bampipe_backend::EventSink;

    use super::*;

    fn client(sim: &Arc<SimPlatform>, policy: TimeoutPolicy) -> ResourceClient {
        let (sink, _rx) = EventSink::channel(8);
        for bam in [BamType::Hsusb, BamType::Hsic] {
            sim.create_producer(ResourceName::producer(bam), sink.clone())
                .unwrap();
        }
        let config = ManagerConfig {
            timeout_policy: policy,
            ..ManagerConfig::default()
        };
        ResourceClient::new(sim.clone(), &config)
    }

    #[tokio::test]
    async fn immediate_grant_sets_state() {
        let sim = SimPlatform::new();
        let client = client(&sim, TimeoutPolicy::BestEffort);
        let outcome = client.request_producer(BamType::Hsusb).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Immediate);
        assert_eq!(client.producer_state(BamType::Hsusb), GrantState::Granted);
    }

    #[tokio::test]
    async fn equivalent_state_short_circuits_without_service_call() {
        let sim = SimPlatform::new();
        let client = client(&sim, TimeoutPolicy::BestEffort);
        sim.set_producer_mode(ProducerMode::Deferred);

        let outcome = client.release_producer(BamType::Hsusb).await.unwrap();
        assert_eq!(outcome, WaitOutcome::AlreadySatisfied);
        assert!(!sim
            .ops()
            .iter()
            .any(|op| matches!(op, SimOp::ResourceRelease(_))));
    }

    #[tokio::test]
    async fn non_negotiated_instance_never_waits() {
        let sim = SimPlatform::new();
        let client = client(&sim, TimeoutPolicy::FailFast);
        assert_eq!(
            client.request_producer(BamType::Ssusb).await.unwrap(),
            WaitOutcome::AlreadySatisfied
        );
        assert_eq!(sim.op_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_grant_completes_when_signalled() {
        let sim = SimPlatform::new();
        let client = Arc::new(client(&sim, TimeoutPolicy::FailFast));
        sim.set_producer_mode(ProducerMode::Deferred);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.request_producer(BamType::Hsic).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        client.on_producer_event(BamType::Hsic, GrantEvent::Granted);

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, WaitOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_timeout_proceeds() {
        let sim = SimPlatform::new();
        let client = client(&sim, TimeoutPolicy::BestEffort);
        sim.set_producer_mode(ProducerMode::Deferred);

        let started = tokio::time::Instant::now();
        let outcome = client.request_producer(BamType::Hsusb).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(client.producer_state(BamType::Hsusb), GrantState::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_timeout_is_an_error() {
        let sim = SimPlatform::new();
        let client = client(&sim, TimeoutPolicy::FailFast);
        sim.set_producer_mode(ProducerMode::Deferred);

        let err = client.request_producer(BamType::Hsusb).await.unwrap_err();
        assert!(matches!(err, BamError::Timeout { .. }));
    }

    #[tokio::test]
    async fn refused_request_follows_policy() {
        let sim = SimPlatform::new();
        sim.set_producer_mode(ProducerMode::Rejected);

        let lenient = client(&sim, TimeoutPolicy::BestEffort);
        assert_eq!(
            lenient.request_producer(BamType::Hsusb).await.unwrap(),
            WaitOutcome::Rejected
        );

        let strict = client(&sim, TimeoutPolicy::FailFast);
        assert!(matches!(
            strict.request_producer(BamType::Hsusb).await,
            Err(BamError::BackendFailure(_))
        ));
    }

    #[tokio::test]
    async fn consumer_release_wait_skipped_when_producer_released() {
        let sim = SimPlatform::new();
        let client = client(&sim, TimeoutPolicy::FailFast);
        client.set_consumer(BamType::Hsusb, GrantState::Granted);

        let outcome = client.wait_consumer_released(BamType::Hsusb).await.unwrap();
        assert_eq!(outcome, WaitOutcome::AlreadySatisfied);
    }
}
