//! Mock implementations for testing
//!
//! `MockSession` stands in for the protocol session in coordinator and
//! gateway tests; `MockTransport`/`MockController` script a controller at
//! the transport seam, including the challenge handshake and the
//! encrypted phase, for session-level tests.

use crate::error::{HomesideError, Result};
use crate::protocol::crypto::{self, MessageCipher};
use crate::protocol::frame;
use crate::protocol::session::{BoxTransport, Transport, TransportMessage};
use crate::protocol::{PointError, ProtocolSession, RawValue, SessionState};
use crate::registry::Address;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};

/// Mock protocol session with scripted values
pub struct MockSession {
    values: Mutex<HashMap<Address, Value>>,
    errors: Mutex<HashMap<Address, i64>>,
    fetch_calls: AtomicUsize,
    writes: Mutex<Vec<(Address, f64)>>,
    fail_fetches: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    state: Mutex<SessionState>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            fetch_calls: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            fail_fetches: AtomicUsize::new(0),
            gate: None,
            state: Mutex::new(SessionState::Ready),
        }
    }

    /// Script a raw value for an address
    pub async fn set_value(&self, address: Address, value: Value) {
        self.values.lock().await.insert(address, value);
    }

    /// Script a controller error code for an address
    pub async fn set_error(&self, address: Address, code: i64) {
        self.errors.lock().await.insert(address, code);
    }

    /// Fail the next `n` fetches with `ConnectionLost`
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Hold every fetch until a permit is released through the returned gate
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut mock = Self::new();
        mock.gate = Some(gate.clone());
        (mock, gate)
    }

    pub async fn set_state(&self, state: SessionState) {
        *self.state.lock().await = state;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub async fn written(&self) -> Vec<(Address, f64)> {
        self.writes.lock().await.clone()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolSession for MockSession {
    async fn fetch(&self, addresses: &BTreeSet<Address>) -> Result<HashMap<Address, RawValue>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| HomesideError::connection_lost("gate closed"))?;
            permit.forget();
        }

        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(HomesideError::connection_lost("mock transport failure"));
        }

        let values = self.values.lock().await;
        let errors = self.errors.lock().await;
        let now = Utc::now();
        let mut out = HashMap::new();
        for address in addresses {
            if let Some(code) = errors.get(address) {
                out.insert(
                    *address,
                    RawValue::errored(
                        PointError {
                            code: *code,
                            text: frame::error_text(*code),
                        },
                        now,
                    ),
                );
            } else if let Some(value) = values.get(address) {
                out.insert(*address, RawValue::ok(value.clone(), now));
            } else {
                out.insert(*address, RawValue::missing(now));
            }
        }
        Ok(out)
    }

    async fn write(&self, address: Address, value: f64) -> Result<()> {
        self.writes.lock().await.push((address, value));
        Ok(())
    }

    async fn state(&self) -> SessionState {
        *self.state.lock().await
    }
}

/// Channel-backed transport handed to the session under test
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<TransportMessage>,
    outgoing: mpsc::UnboundedSender<TransportMessage>,
}

/// The test's side of a [`MockTransport`]
pub struct MockRemote {
    pub to_client: mpsc::UnboundedSender<TransportMessage>,
    pub from_client: mpsc::UnboundedReceiver<TransportMessage>,
}

/// Create a connected transport/remote pair
pub fn mock_transport_pair() -> (MockTransport, MockRemote) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    (
        MockTransport { incoming, outgoing },
        MockRemote {
            to_client,
            from_client,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outgoing
            .send(TransportMessage::Text(text))
            .map_err(|_| HomesideError::connection_lost("mock peer gone"))
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.outgoing
            .send(TransportMessage::Binary(data))
            .map_err(|_| HomesideError::connection_lost("mock peer gone"))
    }

    async fn receive(&mut self) -> Result<TransportMessage> {
        Ok(self
            .incoming
            .recv()
            .await
            .unwrap_or(TransportMessage::Closed))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Behaviour of a scripted controller
#[derive(Clone)]
pub struct MockControllerConfig {
    /// Raw values served for reads
    pub values: HashMap<Address, Value>,
    /// Error codes served instead of values
    pub errors: HashMap<Address, i64>,
    /// Accepted credentials; `None` refuses any login
    pub credentials: Option<(String, String)>,
    /// Privilege level reported after authentication
    pub session_level: i64,
    /// Drop the connection when the first read request arrives
    pub drop_on_read: bool,
    /// Error code returned for writes (0 = success)
    pub write_error: i64,
}

impl Default for MockControllerConfig {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            errors: HashMap::new(),
            credentials: None,
            session_level: 3,
            drop_on_read: false,
            write_error: 0,
        }
    }
}

/// Scripted controller speaking the EXOsocket frame protocol
pub struct MockController {
    remote: MockRemote,
    config: MockControllerConfig,
    cipher: Option<MessageCipher>,
    awaiting_iv: bool,
    client_nonce1: u32,
    server_nonce: u32,
    pending_key: Option<[u8; 16]>,
}

impl MockController {
    /// Drive a controller for one connection until the client goes away
    pub fn spawn(remote: MockRemote, config: MockControllerConfig) {
        let mut controller = Self {
            remote,
            config,
            cipher: None,
            awaiting_iv: false,
            client_nonce1: 0,
            server_nonce: crypto::random_nonce(),
            pending_key: None,
        };
        tokio::spawn(async move { controller.run().await });
    }

    async fn run(&mut self) {
        while let Some(message) = self.remote.from_client.recv().await {
            let keep_going = match message {
                TransportMessage::Text(text) => self.handle_text(&text),
                TransportMessage::Binary(data) => self.handle_binary(&data),
                TransportMessage::Closed => false,
            };
            if !keep_going {
                break;
            }
        }
    }

    fn handle_binary(&mut self, data: &[u8]) -> bool {
        if self.awaiting_iv {
            if data.len() != 16 {
                return false;
            }
            let mut client_iv = [0u8; 16];
            client_iv.copy_from_slice(data);
            let server_iv = crypto::random_iv();
            let Some(key) = self.pending_key.take() else {
                return false;
            };
            if self
                .remote
                .to_client
                .send(TransportMessage::Binary(server_iv.to_vec()))
                .is_err()
            {
                return false;
            }
            self.cipher = Some(MessageCipher::new(&key, server_iv, client_iv));
            self.awaiting_iv = false;
            let level = self.config.session_level;
            return self.send(&json!({
                "method": "sessionLevel",
                "params": {"sessionLevel": level},
            }));
        }

        let Some(cipher) = &mut self.cipher else {
            return true;
        };
        match cipher.decrypt(data) {
            Ok(text) => self.handle_text(&text),
            Err(_) => false,
        }
    }

    fn handle_text(&mut self, text: &str) -> bool {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return true;
        };
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let context = frame.get("context").and_then(Value::as_i64);

        match method {
            "versionOffer" => self.send(&json!({"method": "versionAck", "params": {}})),
            "identity" => self.send(&json!({
                "method": "identity",
                "params": {
                    "controllerName": "HS-TEST",
                    "projectName": "bench",
                    "serial": "0042",
                },
            })),
            "ping" => self.send(&json!({"method": "pingAck"})),
            "getChallenge" => {
                self.client_nonce1 = params
                    .get("clientNonce1")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let nonce = self.server_nonce;
                self.send(&json!({
                    "method": "authChallenge",
                    "params": {"serverNonce": nonce},
                }))
            }
            "authenticate" => self.handle_authenticate(&params),
            "read" => self.handle_read(&params, context),
            "write" => self.handle_write(&params, context),
            _ => true,
        }
    }

    fn handle_authenticate(&mut self, params: &Value) -> bool {
        let user = params.get("user").and_then(Value::as_str).unwrap_or("");
        let client_nonce2 = params
            .get("clientNonce2")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let response = params
            .get("challengeResponse")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let accepted = self.config.credentials.as_ref().and_then(|(u, p)| {
            let secrets = crypto::derive_session_secrets(
                u,
                p,
                self.client_nonce1,
                self.server_nonce,
                client_nonce2,
            );
            (u.eq_ignore_ascii_case(user) && response == secrets.response as u64)
                .then_some(secrets)
        });

        match accepted {
            Some(secrets) => {
                self.pending_key = Some(secrets.key);
                self.awaiting_iv = true;
                let confirmation = secrets.confirmation;
                self.send(&json!({
                    "method": "authenticateReply",
                    "params": {"confirmation": confirmation},
                }))
            }
            None => self.send(&json!({
                "method": "authenticateReply",
                "error": {"code": 26, "text": "Wrong password"},
            })),
        }
    }

    fn handle_read(&mut self, params: &Value, context: Option<i64>) -> bool {
        if self.config.drop_on_read {
            return false;
        }
        let mut blocks = Vec::new();
        for block in params
            .get("devices")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let device = block.get("device").and_then(Value::as_u64).unwrap_or(0) as u16;
            let items: Vec<u32> = block
                .get("items")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_u64)
                        .map(|i| i as u32)
                        .collect()
                })
                .unwrap_or_default();
            let mut values = Vec::new();
            let mut errors = Vec::new();
            for item in &items {
                let address = Address::new(device, *item);
                if let Some(code) = self.config.errors.get(&address) {
                    values.push(Value::Null);
                    errors.push(json!(code));
                } else {
                    values.push(self.config.values.get(&address).cloned().unwrap_or(Value::Null));
                    errors.push(json!(0));
                }
            }
            blocks.push(json!({
                "device": device,
                "items": items,
                "values": values,
                "errors": errors,
            }));
        }
        self.send(&json!({
            "method": "update",
            "context": context,
            "params": {"devices": blocks},
        }))
    }

    fn handle_write(&mut self, params: &Value, context: Option<i64>) -> bool {
        let block = params
            .get("devices")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(Value::Null);
        let device = block.get("device").and_then(Value::as_u64).unwrap_or(0);
        let items = block.get("items").cloned().unwrap_or(json!([]));
        let error = self.config.write_error;
        self.send(&json!({
            "method": "update",
            "context": context,
            "params": {
                "devices": [{
                    "device": device,
                    "items": items,
                    "values": [Value::Null],
                    "errors": [error],
                }],
            },
        }))
    }

    fn send(&mut self, frame: &Value) -> bool {
        let text = frame.to_string();
        let message = match &mut self.cipher {
            Some(cipher) => TransportMessage::Binary(cipher.encrypt(&text)),
            None => TransportMessage::Text(text),
        };
        self.remote.to_client.send(message).is_ok()
    }
}

/// Connector producing one scripted controller connection per attempt
pub fn mock_connector(
    config: MockControllerConfig,
) -> (crate::protocol::session::Connector, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let connector: crate::protocol::session::Connector = Arc::new(move || {
        let config = config.clone();
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let (transport, remote) = mock_transport_pair();
            MockController::spawn(remote, config);
            Ok(Box::new(transport) as BoxTransport)
        })
    });
    (connector, attempts)
}

/// Connector whose every attempt fails at the transport layer
pub fn failing_connector() -> (crate::protocol::session::Connector, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let connector: crate::protocol::session::Connector = Arc::new(move || {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HomesideError::connection_lost("mock refuses to connect"))
        })
    });
    (connector, attempts)
}
