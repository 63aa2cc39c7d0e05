//! Coordinator polling, coalescing and fan-out

use async_trait::async_trait;
use chrono::Utc;
use homeside_client::combine::CombinedState;
use homeside_client::coordinator::UpdateCoordinator;
use homeside_client::error::{HomesideError, Result};
use homeside_client::protocol::{ProtocolSession, RawValue, SessionState};
use homeside_client::registry::{Address, PollGroup, VariableRegistry};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Scripted session; optionally holds each fetch until a permit arrives
struct ScriptedSession {
    values: HashMap<Address, Value>,
    fetch_calls: AtomicUsize,
    fail: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedSession {
    fn new(values: HashMap<Address, Value>) -> Arc<Self> {
        Arc::new(Self {
            values,
            fetch_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: None,
        })
    }

    fn gated(values: HashMap<Address, Value>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let session = Arc::new(Self {
            values,
            fetch_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Some(gate.clone()),
        });
        (session, gate)
    }
}

#[async_trait]
impl ProtocolSession for ScriptedSession {
    async fn fetch(&self, addresses: &BTreeSet<Address>) -> Result<HashMap<Address, RawValue>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| HomesideError::connection_lost("gate closed"))?;
            permit.forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(HomesideError::connection_lost("scripted failure"));
        }
        let now = Utc::now();
        Ok(addresses
            .iter()
            .map(|a| {
                let raw = match self.values.get(a) {
                    Some(value) => RawValue::ok(value.clone(), now),
                    None => RawValue::missing(now),
                };
                (*a, raw)
            })
            .collect())
    }

    async fn write(&self, _address: Address, _value: f64) -> Result<()> {
        Ok(())
    }

    async fn state(&self) -> SessionState {
        SessionState::Ready
    }
}

fn registry() -> Arc<VariableRegistry> {
    Arc::new(
        VariableRegistry::load(
            r#"{
                "variables": [
                    {
                        "id": "outdoor_temp",
                        "category": "sensor",
                        "addresses": ["0:11"],
                        "decimals": 1,
                        "group": "fast"
                    },
                    {
                        "id": "supply_temp",
                        "category": "sensor",
                        "addresses": ["0:20"],
                        "decimals": 1,
                        "group": "fast"
                    },
                    {
                        "id": "fw_version",
                        "category": "sensor",
                        "addresses": ["0:1", "0:2"],
                        "format": "{0}.{1}",
                        "group": "very_slow"
                    }
                ]
            }"#,
        )
        .unwrap(),
    )
}

fn fast_values() -> HashMap<Address, Value> {
    HashMap::from([
        (Address::new(0, 11), json!(-3.25)),
        (Address::new(0, 20), json!(47.06)),
    ])
}

#[tokio::test]
async fn one_cycle_combines_the_whole_group() {
    let session = ScriptedSession::new(fast_values());
    let coordinator =
        UpdateCoordinator::new(PollGroup::Fast, Duration::from_secs(10), registry(), session);

    let snapshot = coordinator.refresh().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
        snapshot["outdoor_temp"].state,
        CombinedState::Numeric(-3.2)
    );
    assert_eq!(snapshot["supply_temp"].state, CombinedState::Numeric(47.1));
    assert!(snapshot.values().all(|v| v.valid));
}

#[tokio::test]
async fn concurrent_refreshes_coalesce_into_one_fetch() {
    let (session, gate) = ScriptedSession::gated(fast_values());
    let coordinator = UpdateCoordinator::new(
        PollGroup::Fast,
        Duration::from_secs(10),
        registry(),
        session.clone(),
    );

    let winner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.refresh().await })
    };
    // Let the winner claim the in-flight slot and block on the gate
    tokio::time::sleep(Duration::from_millis(20)).await;
    let joiner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.fetch_calls.load(Ordering::SeqCst), 1);

    gate.add_permits(1);
    let a = winner.await.unwrap();
    let b = joiner.await.unwrap();

    // Exactly one fetch; both callers observe the same cycle's snapshot
    assert_eq!(session.fetch_calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn group_failure_marks_every_variable_unavailable() {
    let session = ScriptedSession::new(fast_values());
    session.fail.store(true, Ordering::SeqCst);
    let coordinator = UpdateCoordinator::new(
        PollGroup::Fast,
        Duration::from_secs(10),
        registry(),
        session.clone(),
    );

    let snapshot = coordinator.refresh().await;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.values().all(|v| !v.valid));
    assert!(snapshot
        .values()
        .all(|v| v.state == CombinedState::Unavailable));

    // Recovery on the next cycle
    session.fail.store(false, Ordering::SeqCst);
    let snapshot = coordinator.refresh().await;
    assert!(snapshot.values().all(|v| v.valid));
}

#[tokio::test]
async fn subscribers_see_each_cycle() {
    let session = ScriptedSession::new(fast_values());
    let coordinator =
        UpdateCoordinator::new(PollGroup::Fast, Duration::from_secs(10), registry(), session);

    let mut updates = coordinator.subscribe();
    coordinator.refresh().await;
    coordinator.refresh().await;

    let first = updates.recv().await.unwrap();
    let second = updates.recv().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn groups_poll_independently() {
    let mut values = fast_values();
    values.insert(Address::new(0, 1), json!(2));
    values.insert(Address::new(0, 2), json!(14));
    let session = ScriptedSession::new(values);
    let reg = registry();

    let fast = UpdateCoordinator::new(
        PollGroup::Fast,
        Duration::from_secs(10),
        reg.clone(),
        session.clone(),
    );
    let very_slow = UpdateCoordinator::new(
        PollGroup::VerySlow,
        Duration::from_secs(3600),
        reg,
        session,
    );

    let fast_snapshot = fast.refresh().await;
    let slow_snapshot = very_slow.refresh().await;

    assert!(!fast_snapshot.contains_key("fw_version"));
    assert_eq!(
        slow_snapshot["fw_version"].state,
        CombinedState::Text("2.14".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn spawned_loop_polls_on_its_interval() {
    let session = ScriptedSession::new(fast_values());
    let coordinator = UpdateCoordinator::new(
        PollGroup::Fast,
        Duration::from_secs(10),
        registry(),
        session.clone(),
    );

    let handle = coordinator.spawn();
    // First tick fires immediately, then every interval
    tokio::time::sleep(Duration::from_secs(25)).await;
    let calls = session.fetch_calls.load(Ordering::SeqCst);
    assert!((3..=4).contains(&calls), "got {calls} cycles");

    coordinator.shutdown();
    handle.await.unwrap();
    let settled = session.fetch_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(session.fetch_calls.load(Ordering::SeqCst), settled);
}
