//! Update coordinator: per-group polling with coalescing fan-out
//!
//! One coordinator per poll group. Each tick computes the union of
//! addresses its group needs, issues a single fetch, combines the raw
//! values and notifies subscribers. Overlapping refreshes coalesce: a
//! tick that fires while a fetch is outstanding issues nothing and every
//! waiter observes the one shared result. Coordinators for different
//! groups run as independent tasks and never block each other.

use crate::combine::{combine, CombinedValue};
use crate::protocol::ProtocolSession;
use crate::registry::{PollGroup, VariableRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One poll cycle's combined snapshot, shared between subscribers
pub type Snapshot = Arc<HashMap<String, CombinedValue>>;

pub struct UpdateCoordinator {
    group: PollGroup,
    interval: Duration,
    registry: Arc<VariableRegistry>,
    session: Arc<dyn ProtocolSession>,
    current: RwLock<Snapshot>,
    updates: broadcast::Sender<Snapshot>,
    in_flight: AtomicBool,
    completed: Notify,
    cancel: CancellationToken,
}

impl UpdateCoordinator {
    pub fn new(
        group: PollGroup,
        interval: Duration,
        registry: Arc<VariableRegistry>,
        session: Arc<dyn ProtocolSession>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(16);
        Arc::new(Self {
            group,
            interval,
            registry,
            session,
            current: RwLock::new(Arc::new(HashMap::new())),
            updates,
            in_flight: AtomicBool::new(false),
            completed: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn group(&self) -> PollGroup {
        self.group
    }

    /// Subscribe to per-cycle snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    /// The most recent snapshot
    pub async fn current(&self) -> Snapshot {
        self.current.read().await.clone()
    }

    /// Refresh now, coalescing with any refresh already in flight
    pub async fn refresh(&self) -> Snapshot {
        // Register for completion before racing for the in-flight flag, so
        // a lost race can never miss the winner's notification.
        let mut notified = std::pin::pin!(self.completed.notified());
        notified.as_mut().enable();
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            notified.await;
            return self.current().await;
        }

        let snapshot = self.poll_once().await;
        self.in_flight.store(false, Ordering::SeqCst);
        self.completed.notify_waiters();
        snapshot
    }

    async fn poll_once(&self) -> Snapshot {
        let addresses = self.registry.addresses_needed_by(self.group);
        let definitions = self.registry.definitions_in(self.group);

        let snapshot: HashMap<String, CombinedValue> = match self.session.fetch(&addresses).await {
            Ok(raw) => definitions
                .iter()
                .map(|def| (def.id.clone(), combine(def, &raw)))
                .collect(),
            Err(err) => {
                // Group-wide failure: every variable goes unavailable.
                warn!(group = %self.group, error = %err, "fetch failed for poll group");
                definitions
                    .iter()
                    .map(|def| {
                        (
                            def.id.clone(),
                            CombinedValue::unavailable(def, Default::default()),
                        )
                    })
                    .collect()
            }
        };

        let snapshot = Arc::new(snapshot);
        *self.current.write().await = snapshot.clone();
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.updates.send(snapshot.clone());
        debug!(group = %self.group, variables = snapshot.len(), "poll cycle complete");
        snapshot
    }

    /// Run the periodic poll loop until shutdown
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = coordinator.cancel.cancelled() => {
                        debug!(group = %coordinator.group, "coordinator shut down");
                        break;
                    }
                    _ = ticker.tick() => {
                        coordinator.refresh().await;
                    }
                }
            }
        })
    }

    /// Stop the poll loop; outstanding fetches abort at the session layer
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSession;
    use crate::registry::{Address, VariableDefinition, VariableKind};
    use serde_json::json;

    fn single(id: &str, address: &str) -> VariableDefinition {
        VariableDefinition {
            id: id.to_string(),
            name: None,
            category: VariableKind::Sensor,
            addresses: vec![address.parse().unwrap()],
            format: None,
            decimals: None,
            writable: false,
            min: None,
            max: None,
            step: None,
            enabled: true,
            group: Some(PollGroup::Fast),
            unit: None,
        }
    }

    fn fast_registry() -> Arc<VariableRegistry> {
        Arc::new(
            VariableRegistry::from_definitions(vec![
                single("outdoor_temp", "0:11"),
                single("supply_temp", "0:20"),
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn refresh_publishes_the_snapshot_as_current() {
        let session = Arc::new(MockSession::new());
        session.set_value(Address::new(0, 11), json!(-3.5)).await;
        session.set_value(Address::new(0, 20), json!(47.0)).await;
        let coordinator = UpdateCoordinator::new(
            PollGroup::Fast,
            Duration::from_secs(10),
            fast_registry(),
            session.clone(),
        );

        assert!(coordinator.current().await.is_empty());
        let snapshot = coordinator.refresh().await;
        assert_eq!(snapshot.len(), 2);
        assert!(Arc::ptr_eq(&snapshot, &coordinator.current().await));
        assert_eq!(session.fetch_count(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_yields_invalid_snapshot() {
        let session = Arc::new(MockSession::new());
        session.fail_next_fetches(1);
        let coordinator = UpdateCoordinator::new(
            PollGroup::Fast,
            Duration::from_secs(10),
            fast_registry(),
            session,
        );

        let snapshot = coordinator.refresh().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.values().all(|v| !v.valid));
    }

    #[tokio::test]
    async fn gated_refreshes_share_one_fetch() {
        let (session, gate) = MockSession::gated();
        let session = Arc::new(session);
        let coordinator = UpdateCoordinator::new(
            PollGroup::Fast,
            Duration::from_secs(10),
            fast_registry(),
            session.clone(),
        );

        let winner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let joiner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.add_permits(1);
        let a = winner.await.unwrap();
        let b = joiner.await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(session.fetch_count(), 1);
    }
}
