//! Protocol session: EXOsocket connection lifecycle, framing and crypto
//!
//! The session is the only component that touches the socket and the key
//! material. Everything above it consumes the [`ProtocolSession`] trait.

pub mod crypto;
pub mod frame;
pub mod session;

use crate::error::Result;
use crate::registry::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

pub use session::{BoxTransport, Connector, HomesideSession, Transport, TransportMessage, WsTransport};

/// Session lifecycle states
///
/// `Disconnected → Connecting → (Handshaking → Authenticated) | Ready`,
/// with `Polling` while a fetch round trip is on the wire and `Error` on
/// any transport or authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticated,
    Ready,
    Polling,
    Error,
}

impl SessionState {
    /// Whether the transport is established and usable
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Authenticated | SessionState::Ready | SessionState::Polling
        )
    }
}

/// Controller identity reported during the session handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionIdentity {
    pub controller_name: Option<String>,
    pub project_name: Option<String>,
    pub serial: Option<String>,
}

/// Per-address read error reported by the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointError {
    pub code: i64,
    pub text: String,
}

/// One raw value as fetched from the controller
///
/// Raw values are transient: the coordinator replaces them wholesale each
/// poll cycle, never mutating them in place across cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawValue {
    /// Scalar payload; `None` when the controller returned nothing
    pub value: Option<serde_json::Value>,

    /// Fetch-error marker for this address
    pub error: Option<PointError>,

    /// Freshness timestamp
    pub fetched_at: DateTime<Utc>,
}

impl RawValue {
    pub fn ok(value: serde_json::Value, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            error: None,
            fetched_at,
        }
    }

    pub fn errored(error: PointError, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value: None,
            error: Some(error),
            fetched_at,
        }
    }

    /// Marker for an address the controller never answered for
    pub fn missing(fetched_at: DateTime<Utc>) -> Self {
        Self::errored(
            PointError {
                code: -1,
                text: "no data returned".to_string(),
            },
            fetched_at,
        )
    }

    /// Usable for value combination: present, non-null, no error marker
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.value.as_ref().is_some_and(|v| !v.is_null())
    }
}

/// The seam between the session and its consumers (coordinators, gateway)
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Fetch a set of raw addresses in as few round trips as the wire allows.
    ///
    /// Partial failures are non-fatal: the mapping carries an error marker
    /// per affected address, and callers must tolerate that.
    async fn fetch(&self, addresses: &BTreeSet<Address>) -> Result<HashMap<Address, RawValue>>;

    /// Write one value to a single address; requires an authenticated session
    async fn write(&self, address: Address, value: f64) -> Result<()>;

    /// Current lifecycle state
    async fn state(&self) -> SessionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_states() {
        assert!(SessionState::Ready.is_connected());
        assert!(SessionState::Authenticated.is_connected());
        assert!(SessionState::Polling.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
        assert!(!SessionState::Error.is_connected());
        assert!(!SessionState::Connecting.is_connected());
    }

    #[test]
    fn raw_value_validity() {
        let now = Utc::now();
        assert!(RawValue::ok(serde_json::json!(21.5), now).is_valid());
        assert!(!RawValue::ok(serde_json::Value::Null, now).is_valid());
        assert!(!RawValue::missing(now).is_valid());
        assert!(!RawValue::errored(
            PointError {
                code: 19,
                text: "The variable does not exist".into()
            },
            now
        )
        .is_valid());
    }
}
