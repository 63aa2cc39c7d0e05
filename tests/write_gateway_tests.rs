//! Write gateway behaviour against the public API

use async_trait::async_trait;
use chrono::Utc;
use homeside_client::error::{HomesideError, Result};
use homeside_client::gateway::WriteGateway;
use homeside_client::protocol::{ProtocolSession, RawValue, SessionState};
use homeside_client::registry::{Address, VariableRegistry};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Records writes; optionally fails them with a scripted error
struct RecordingSession {
    writes: Mutex<Vec<(Address, f64)>>,
    write_result: Mutex<Option<HomesideError>>,
}

impl RecordingSession {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            write_result: Mutex::new(None),
        })
    }

    async fn fail_writes_with(&self, err: HomesideError) {
        *self.write_result.lock().await = Some(err);
    }

    async fn written(&self) -> Vec<(Address, f64)> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl ProtocolSession for RecordingSession {
    async fn fetch(&self, addresses: &BTreeSet<Address>) -> Result<HashMap<Address, RawValue>> {
        let now = Utc::now();
        Ok(addresses.iter().map(|a| (*a, RawValue::missing(now))).collect())
    }

    async fn write(&self, address: Address, value: f64) -> Result<()> {
        if let Some(err) = self.write_result.lock().await.take() {
            return Err(err);
        }
        self.writes.lock().await.push((address, value));
        Ok(())
    }

    async fn state(&self) -> SessionState {
        SessionState::Authenticated
    }
}

fn registry() -> Arc<VariableRegistry> {
    Arc::new(
        VariableRegistry::load(
            r#"{
                "variables": [
                    {
                        "id": "room_setpoint",
                        "category": "number",
                        "addresses": ["0:332"],
                        "writable": true,
                        "min": 10.0,
                        "max": 30.0,
                        "step": 0.5
                    },
                    {
                        "id": "outdoor_temp",
                        "category": "sensor",
                        "addresses": ["0:11"]
                    },
                    {
                        "id": "fw_version",
                        "category": "sensor",
                        "addresses": ["0:1", "0:2"],
                        "format": "{0}.{1}",
                        "writable": true
                    },
                    {
                        "id": "mode",
                        "category": "select",
                        "addresses": ["0:50"],
                        "writable": true,
                        "min": 0,
                        "max": 3,
                        "step": 1
                    }
                ]
            }"#,
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn accepted_write_reaches_the_session() {
    let session = RecordingSession::new();
    let gateway = WriteGateway::new(registry(), session.clone());

    gateway.submit("room_setpoint", 21.5).await.unwrap();
    assert_eq!(session.written().await, vec![(Address::new(0, 332), 21.5)]);
}

#[tokio::test]
async fn unknown_variable_is_not_found() {
    let session = RecordingSession::new();
    let gateway = WriteGateway::new(registry(), session.clone());

    let err = gateway.submit("no_such_thing", 1.0).await.unwrap_err();
    assert!(matches!(err, HomesideError::NotFound(_)));
    assert!(session.written().await.is_empty());
}

#[tokio::test]
async fn read_only_and_combined_variables_are_rejected() {
    let session = RecordingSession::new();
    let gateway = WriteGateway::new(registry(), session.clone());

    let err = gateway.submit("outdoor_temp", 5.0).await.unwrap_err();
    assert!(matches!(err, HomesideError::WriteRejected(_)));

    // Declared writable in the catalogue, downgraded because it is combined
    let err = gateway.submit("fw_version", 1.0).await.unwrap_err();
    assert!(matches!(err, HomesideError::WriteRejected(_)));
    assert!(session.written().await.is_empty());
}

#[tokio::test]
async fn out_of_bounds_and_off_grid_values_are_rejected() {
    let session = RecordingSession::new();
    let gateway = WriteGateway::new(registry(), session.clone());

    for bad in [9.5, 30.5, 21.3] {
        let err = gateway.submit("room_setpoint", bad).await.unwrap_err();
        assert!(matches!(err, HomesideError::OutOfRange(_)), "value {bad}");
    }
    assert!(session.written().await.is_empty());

    // Boundary values are fine
    gateway.submit("room_setpoint", 10.0).await.unwrap();
    gateway.submit("room_setpoint", 30.0).await.unwrap();
}

#[tokio::test]
async fn integer_select_grid() {
    let session = RecordingSession::new();
    let gateway = WriteGateway::new(registry(), session.clone());

    gateway.submit("mode", 2.0).await.unwrap();
    let err = gateway.submit("mode", 1.5).await.unwrap_err();
    assert!(matches!(err, HomesideError::OutOfRange(_)));
}

#[tokio::test]
async fn session_errors_pass_through() {
    let session = RecordingSession::new();
    session
        .fail_writes_with(HomesideError::WriteFailed {
            code: 28,
            text: "Access denied".to_string(),
        })
        .await;
    let gateway = WriteGateway::new(registry(), session.clone());

    let err = gateway.submit("room_setpoint", 21.0).await.unwrap_err();
    assert!(matches!(err, HomesideError::WriteFailed { code: 28, .. }));
}
