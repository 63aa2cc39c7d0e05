//! Protocol session lifecycle over the EXOsocket transport
//!
//! One session exists per controller. All round trips serialize through
//! an internal lock: the wire has no multiplexing beyond context
//! correlation, so concurrent callers queue. Transport failures drive the
//! state machine through `Error → Disconnected` and reconnection happens
//! lazily with exponential backoff on the next call; authentication
//! failures are sticky and never retried automatically.

use crate::config::HomesideConfig;
use crate::error::{HomesideError, Result};
use crate::protocol::crypto::{self, MessageCipher};
use crate::protocol::frame::{self, ContextCounter, ServerFrame};
use crate::protocol::{ProtocolSession, RawValue, SessionIdentity, SessionState};
use crate::registry::Address;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message at the transport boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

/// Minimal transport seam below the session
///
/// Production uses [`WsTransport`]; tests script a channel-backed pair.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()>;
    async fn receive(&mut self) -> Result<TransportMessage>;
    async fn close(&mut self) -> Result<()>;
}

pub type BoxTransport = Box<dyn Transport + Send>;

/// Factory producing a fresh transport per connection attempt
pub type Connector =
    Arc<dyn Fn() -> BoxFuture<'static, Result<BoxTransport>> + Send + Sync>;

/// WebSocket transport speaking the `EXOsocket` subprotocol
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| HomesideError::websocket(format!("invalid endpoint {url}: {e}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(frame::WS_SUBPROTOCOL),
        );
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| HomesideError::connection_lost(format!("connect to {url} failed: {e}")))?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| HomesideError::connection_lost(format!("send failed: {e}")))
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.stream
            .send(Message::Binary(data))
            .await
            .map_err(|e| HomesideError::connection_lost(format!("send failed: {e}")))
    }

    async fn receive(&mut self) -> Result<TransportMessage> {
        loop {
            match self.stream.next().await {
                None => return Ok(TransportMessage::Closed),
                Some(Err(e)) => {
                    return Err(HomesideError::connection_lost(format!("receive failed: {e}")))
                }
                Some(Ok(Message::Text(text))) => return Ok(TransportMessage::Text(text)),
                Some(Ok(Message::Binary(data))) => return Ok(TransportMessage::Binary(data)),
                Some(Ok(Message::Close(_))) => return Ok(TransportMessage::Closed),
                Some(Ok(_)) => continue, // ping/pong frames
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| HomesideError::websocket(format!("close failed: {e}")))
    }
}

struct Connection {
    transport: BoxTransport,
    cipher: Option<MessageCipher>,
}

#[derive(Default)]
struct BackoffState {
    attempt: u32,
    next_allowed: Option<Instant>,
    last_delay: Option<Duration>,
}

impl BackoffState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct SessionInner {
    conn: Option<Connection>,
    context: ContextCounter,
    backoff: BackoffState,
    auth_failed: bool,
    session_level: Option<i64>,
}

/// The one protocol session per configured controller
pub struct HomesideSession {
    config: HomesideConfig,
    connector: Connector,
    state: RwLock<SessionState>,
    identity: RwLock<SessionIdentity>,
    inner: Mutex<SessionInner>,
    cancel: CancellationToken,
}

impl HomesideSession {
    /// Create a session connecting over WebSocket to the configured host
    pub fn new(config: HomesideConfig) -> Self {
        let url = config.ws_url();
        let connector: Connector = Arc::new(move || {
            let url = url.clone();
            Box::pin(async move {
                let transport = WsTransport::connect(&url).await?;
                Ok(Box::new(transport) as BoxTransport)
            })
        });
        Self::with_connector(config, connector)
    }

    /// Create a session with a custom transport factory (tests, tunnels)
    pub fn with_connector(config: HomesideConfig, connector: Connector) -> Self {
        Self {
            config,
            connector,
            state: RwLock::new(SessionState::Disconnected),
            identity: RwLock::new(SessionIdentity::default()),
            inner: Mutex::new(SessionInner {
                conn: None,
                context: ContextCounter::default(),
                backoff: BackoffState::default(),
                auth_failed: false,
                session_level: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Controller identity from the handshake
    pub async fn identity(&self) -> SessionIdentity {
        self.identity.read().await.clone()
    }

    /// Privilege level of the authenticated session, if any
    pub async fn session_level(&self) -> Option<i64> {
        self.inner.lock().await.session_level
    }

    /// Reconnect delay currently in force, if the session is backing off
    pub async fn reconnect_backoff(&self) -> Option<Duration> {
        self.inner.lock().await.backoff.last_delay
    }

    /// Establish the transport (and authenticate when credentials are set)
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected(&mut inner).await
    }

    /// Keep-alive round trip
    pub async fn ping(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected(&mut inner).await?;
        let result = self.ping_locked(&mut inner).await;
        if let Err(err) = &result {
            self.handle_transport_error(&mut inner, err).await;
        }
        result
    }

    /// Shut down the session, aborting outstanding round trips
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        if let Some(mut conn) = inner.conn.take() {
            let _ = conn.transport.close().await;
        }
        self.set_state(SessionState::Disconnected).await;
    }

    async fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!(from = ?*state, to = ?next, "session state transition");
            *state = next;
        }
    }

    async fn ensure_connected(&self, inner: &mut SessionInner) -> Result<()> {
        if inner.conn.is_some() {
            return Ok(());
        }
        if inner.auth_failed {
            return Err(HomesideError::auth_failed(
                "authentication previously failed; not retrying without operator action",
            ));
        }
        if let Some(next_allowed) = inner.backoff.next_allowed {
            if Instant::now() < next_allowed {
                return Err(HomesideError::connection_lost(format!(
                    "reconnect backoff active for another {:?}",
                    next_allowed.saturating_duration_since(Instant::now())
                )));
            }
        }

        self.set_state(SessionState::Connecting).await;
        match self.establish(inner).await {
            Ok(()) => {
                inner.backoff.reset();
                let authenticated = inner
                    .conn
                    .as_ref()
                    .is_some_and(|c| c.cipher.is_some());
                self.set_state(if authenticated {
                    SessionState::Authenticated
                } else {
                    SessionState::Ready
                })
                .await;
                info!(authenticated, "session established");
                Ok(())
            }
            Err(err) => {
                inner.conn = None;
                if err.is_auth_error() {
                    // Surfaced to the operator; no automatic retry.
                    inner.auth_failed = true;
                    self.set_state(SessionState::Error).await;
                    warn!(error = %err, "authentication failed, session halted");
                } else {
                    self.record_failure(inner, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn record_failure(&self, inner: &mut SessionInner, err: &HomesideError) {
        inner.backoff.attempt += 1;
        let delay = self.config.backoff.delay_for(inner.backoff.attempt);
        inner.backoff.last_delay = Some(delay);
        inner.backoff.next_allowed = Some(Instant::now() + delay);
        self.set_state(SessionState::Error).await;
        self.set_state(SessionState::Disconnected).await;
        warn!(
            error = %err,
            attempt = inner.backoff.attempt,
            retry_in = ?delay,
            "transport failure, reconnecting with backoff"
        );
    }

    /// Drop the connection after a transport-level error mid round trip
    async fn handle_transport_error(&self, inner: &mut SessionInner, err: &HomesideError) {
        if !err.is_retryable() {
            return;
        }
        inner.conn = None;
        self.record_failure(inner, err).await;
    }

    async fn establish(&self, inner: &mut SessionInner) -> Result<()> {
        let connect = (self.connector)();
        let transport = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| HomesideError::timeout("transport establishment timed out"))??;
        let mut conn = Connection {
            transport,
            cipher: None,
        };

        let deadline = Instant::now() + self.config.request_timeout;
        self.send_frame(&mut conn, &frame::version_offer()).await?;
        self.await_method(&mut conn, "versionAck", deadline).await?;

        self.send_frame(&mut conn, &frame::identity_offer()).await?;
        let identity = self.await_method(&mut conn, "identity", deadline).await?;
        *self.identity.write().await = SessionIdentity {
            controller_name: identity.param_str("controllerName").map(String::from),
            project_name: identity.param_str("projectName").map(String::from),
            serial: identity.param_str("serial").map(String::from),
        };

        if self.config.has_credentials() {
            self.set_state(SessionState::Handshaking).await;
            let username = self.config.username.clone().unwrap_or_default();
            let password = self.config.password.clone().unwrap_or_default();
            let level = self.authenticate(&mut conn, &username, &password).await?;
            inner.session_level = Some(level);
            debug!(session_level = level, "session authenticated");
        }

        inner.conn = Some(conn);
        Ok(())
    }

    /// Challenge/response authentication, then payload encryption setup
    async fn authenticate(
        &self,
        conn: &mut Connection,
        username: &str,
        password: &str,
    ) -> Result<i64> {
        let deadline = Instant::now() + self.config.request_timeout;

        let client_nonce1 = crypto::random_nonce();
        self.send_frame(conn, &frame::get_challenge(client_nonce1)).await?;
        let challenge = self.await_method(conn, "authChallenge", deadline).await?;
        let server_nonce = challenge
            .param_u64("serverNonce")
            .ok_or_else(|| HomesideError::auth_failed("auth challenge missing serverNonce"))?
            as u32;

        let client_nonce2 = crypto::random_nonce();
        let secrets = crypto::derive_session_secrets(
            username,
            password,
            client_nonce1,
            server_nonce,
            client_nonce2,
        );
        self.send_frame(
            conn,
            &frame::authenticate(username, client_nonce2, secrets.response),
        )
        .await?;

        let reply = self.await_method(conn, "authenticateReply", deadline).await?;
        if let Some(error) = &reply.error {
            return Err(HomesideError::auth_failed(format!("login rejected: {error}")));
        }
        let confirmation = reply.param_u64("confirmation");
        if confirmation != Some(secrets.confirmation as u64) {
            return Err(HomesideError::auth_failed("login confirmation mismatch"));
        }

        // Announce our cipher accumulator seed, then take the controller's.
        let send_iv = crypto::random_iv();
        conn.transport.send_binary(send_iv.to_vec()).await?;
        let recv_iv = self.await_iv(conn, deadline).await?;
        conn.cipher = Some(MessageCipher::new(&secrets.key, send_iv, recv_iv));

        // The privilege level arrives as the first encrypted frame.
        let level_frame = self.await_method(conn, "sessionLevel", deadline).await?;
        level_frame
            .param_i64("sessionLevel")
            .ok_or_else(|| HomesideError::auth_failed("sessionLevel frame missing level"))
    }

    async fn await_iv(&self, conn: &mut Connection, deadline: Instant) -> Result<[u8; 16]> {
        loop {
            match self.recv_raw(conn, deadline).await? {
                TransportMessage::Binary(data) if data.len() == 16 => {
                    let mut iv = [0u8; 16];
                    iv.copy_from_slice(&data);
                    return Ok(iv);
                }
                TransportMessage::Binary(data) => {
                    return Err(HomesideError::auth_failed(format!(
                        "expected 16-byte cipher IV, got {} bytes",
                        data.len()
                    )));
                }
                TransportMessage::Text(text) => {
                    debug!(frame = %text, "discarding text frame while awaiting cipher IV");
                }
                TransportMessage::Closed => {
                    return Err(HomesideError::connection_lost("socket closed during handshake"));
                }
            }
        }
    }

    async fn send_frame(&self, conn: &mut Connection, frame: &Value) -> Result<()> {
        let text = frame.to_string();
        match &mut conn.cipher {
            Some(cipher) => conn.transport.send_binary(cipher.encrypt(&text)).await,
            None => conn.transport.send_text(text).await,
        }
    }

    async fn recv_raw(&self, conn: &mut Connection, deadline: Instant) -> Result<TransportMessage> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HomesideError::timeout("response window elapsed"));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(HomesideError::connection_lost("session shut down"))
            }
            result = tokio::time::timeout(remaining, conn.transport.receive()) => {
                match result {
                    Err(_) => Err(HomesideError::timeout("no response within the bounded window")),
                    Ok(message) => message,
                }
            }
        }
    }

    /// Receive the next parseable frame, decrypting when the cipher is up
    async fn recv_frame(&self, conn: &mut Connection, deadline: Instant) -> Result<ServerFrame> {
        loop {
            let text = match self.recv_raw(conn, deadline).await? {
                TransportMessage::Text(text) => text,
                TransportMessage::Binary(data) => match &mut conn.cipher {
                    Some(cipher) => cipher.decrypt(&data)?,
                    None => {
                        debug!(len = data.len(), "ignoring binary frame on plaintext session");
                        continue;
                    }
                },
                TransportMessage::Closed => {
                    return Err(HomesideError::connection_lost("socket closed by controller"));
                }
            };
            match serde_json::from_str::<ServerFrame>(&text) {
                Ok(frame) => return Ok(frame),
                Err(e) => debug!(error = %e, "skipping non-JSON frame"),
            }
        }
    }

    /// Skip frames until one with the expected method arrives
    async fn await_method(
        &self,
        conn: &mut Connection,
        method: &str,
        deadline: Instant,
    ) -> Result<ServerFrame> {
        loop {
            let frame = self.recv_frame(conn, deadline).await?;
            if frame.is(method) {
                return Ok(frame);
            }
            debug!(
                expected = method,
                got = frame.method.as_deref().unwrap_or("<none>"),
                "discarding unmatched frame"
            );
        }
    }

    async fn ping_locked(&self, inner: &mut SessionInner) -> Result<()> {
        let conn = inner
            .conn
            .as_mut()
            .ok_or_else(|| HomesideError::connection_lost("not connected"))?;
        let deadline = Instant::now() + self.config.request_timeout;
        self.send_frame(conn, &frame::ping()).await?;
        self.await_method(conn, "pingAck", deadline).await?;
        Ok(())
    }

    async fn fetch_locked(
        &self,
        inner: &mut SessionInner,
        addresses: &BTreeSet<Address>,
    ) -> Result<HashMap<Address, RawValue>> {
        let SessionInner { conn, context, .. } = inner;
        let conn = conn
            .as_mut()
            .ok_or_else(|| HomesideError::connection_lost("not connected"))?;

        let batches = frame::chunk_reads(addresses);
        let mut pending: HashSet<i64> = HashSet::with_capacity(batches.len());
        for batch in &batches {
            let ctx = context.next();
            pending.insert(ctx);
            self.send_frame(conn, &frame::read_request(ctx, batch)).await?;
        }

        let deadline = Instant::now() + self.config.request_timeout;
        let mut out = HashMap::new();
        while !pending.is_empty() {
            let response = self.recv_frame(conn, deadline).await?;
            if !response.is("update") {
                debug!(
                    method = response.method.as_deref().unwrap_or("<none>"),
                    "discarding non-update frame during fetch"
                );
                continue;
            }
            match response.context {
                // Out-of-order responses are fine; each is matched by context.
                Some(ctx) if pending.remove(&ctx) => {
                    out.extend(frame::parse_update(&response.params, Utc::now()));
                }
                other => {
                    debug!(context = ?other, "discarding update with unknown context");
                }
            }
        }

        // Partial results: anything the controller never answered for gets
        // an explicit error marker instead of silently disappearing.
        let now = Utc::now();
        for address in addresses {
            out.entry(*address).or_insert_with(|| RawValue::missing(now));
        }
        Ok(out)
    }

    async fn write_locked(
        &self,
        inner: &mut SessionInner,
        address: Address,
        value: f64,
    ) -> Result<()> {
        let SessionInner { conn, context, .. } = inner;
        let conn = conn
            .as_mut()
            .ok_or_else(|| HomesideError::connection_lost("not connected"))?;

        let ctx = context.next();
        self.send_frame(conn, &frame::write_request(ctx, address, value)).await?;

        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let response = self.recv_frame(conn, deadline).await?;
            if !response.is("update") || response.context != Some(ctx) {
                debug!("discarding unmatched frame during write");
                continue;
            }
            let parsed = frame::parse_update(&response.params, Utc::now());
            if let Some(error) = parsed.get(&address).and_then(|raw| raw.error.clone()) {
                return Err(HomesideError::WriteFailed {
                    code: error.code,
                    text: error.text,
                });
            }
            return Ok(());
        }
    }
}

#[async_trait]
impl ProtocolSession for HomesideSession {
    async fn fetch(&self, addresses: &BTreeSet<Address>) -> Result<HashMap<Address, RawValue>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let mut inner = self.inner.lock().await;
        self.ensure_connected(&mut inner).await?;

        let authenticated = inner.conn.as_ref().is_some_and(|c| c.cipher.is_some());
        self.set_state(SessionState::Polling).await;
        let result = self.fetch_locked(&mut inner, addresses).await;
        match result {
            Ok(values) => {
                self.set_state(if authenticated {
                    SessionState::Authenticated
                } else {
                    SessionState::Ready
                })
                .await;
                Ok(values)
            }
            Err(err) => {
                self.handle_transport_error(&mut inner, &err).await;
                // In-flight requests fail with ConnectionLost; callers re-issue.
                Err(err)
            }
        }
    }

    async fn write(&self, address: Address, value: f64) -> Result<()> {
        // The auth gate rejects before any socket I/O.
        if !self.config.has_credentials() {
            return Err(HomesideError::not_authenticated(
                "write requires credentials; session is read-only",
            ));
        }
        let mut inner = self.inner.lock().await;
        self.ensure_connected(&mut inner).await?;

        if let Some(level) = inner.session_level {
            // Guest (1) and None (0) sessions can read but never write.
            if level <= 1 {
                return Err(HomesideError::not_authenticated(format!(
                    "session level {level} does not allow writes"
                )));
            }
        }

        let result = self.write_locked(&mut inner, address, value).await;
        if let Err(err) = &result {
            self.handle_transport_error(&mut inner, err).await;
        }
        result
    }

    async fn state(&self) -> SessionState {
        self.state().await
    }
}
