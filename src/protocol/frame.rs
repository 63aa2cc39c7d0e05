//! EXOsocket wire frames
//!
//! The controller speaks JSON messages over a WebSocket with the
//! `EXOsocket` subprotocol. Requests carry a monotonically increasing
//! `context` number; `update` responses are correlated by it. Reads are
//! batched as `indexedPoints` device blocks with parallel `items`,
//! `values` and `errors` arrays.

use crate::protocol::{PointError, RawValue};
use crate::registry::Address;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// WebSocket endpoint path on the controller
pub const WS_PATH: &str = "/_EXOsocket/";

/// Required WebSocket subprotocol
pub const WS_SUBPROTOCOL: &str = "EXOsocket";

/// Items per read request against the master device
pub const ITEMS_PER_READ: usize = 80;

/// A tail shorter than this is merged into the preceding chunk
pub const ITEMS_PER_READ_TAIL: usize = 5;

/// Read contexts wrap around at this value
pub const READ_CONTEXT_MAX: i64 = 99_999;

/// Monotonic request-correlation counter, wrapping at the protocol bound
#[derive(Debug, Default)]
pub struct ContextCounter {
    next: i64,
}

impl ContextCounter {
    pub fn next(&mut self) -> i64 {
        let context = self.next;
        self.next += 1;
        if self.next > READ_CONTEXT_MAX {
            self.next = 0;
        }
        context
    }
}

/// One read batch: a set of items on a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub device: u16,
    pub items: Vec<u32>,
}

/// Split an address set into the minimum number of read batches
///
/// Addresses are grouped per device; each device's items are chunked at
/// [`ITEMS_PER_READ`], with a short tail folded into the last chunk.
pub fn chunk_reads(addresses: &BTreeSet<Address>) -> Vec<ReadBatch> {
    let mut grouped: BTreeMap<u16, Vec<u32>> = BTreeMap::new();
    for address in addresses {
        grouped.entry(address.device).or_default().push(address.item);
    }

    let mut batches = Vec::new();
    for (device, items) in grouped {
        let mut remaining = items.as_slice();
        while !remaining.is_empty() {
            let take = if remaining.len() < ITEMS_PER_READ + ITEMS_PER_READ_TAIL {
                remaining.len()
            } else {
                ITEMS_PER_READ
            };
            batches.push(ReadBatch {
                device,
                items: remaining[..take].to_vec(),
            });
            remaining = &remaining[take..];
        }
    }
    batches
}

/// Any frame received from the controller
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFrame {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub context: Option<i64>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ServerFrame {
    pub fn is(&self, method: &str) -> bool {
        self.method.as_deref() == Some(method)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

pub fn version_offer() -> Value {
    json!({
        "method": "versionOffer",
        "params": {"version": 1, "featureLevel": 0, "capabilities": 0},
    })
}

pub fn identity_offer() -> Value {
    json!({
        "method": "identity",
        "params": {
            "implementation": "ControllerWebFramework",
            "implementationVersion": "2.0-0-00",
            "sessionID": 1,
        },
    })
}

pub fn get_challenge(client_nonce1: u32) -> Value {
    json!({
        "method": "getChallenge",
        "params": {"clientNonce1": client_nonce1},
    })
}

pub fn authenticate(user: &str, client_nonce2: u32, challenge_response: u32) -> Value {
    json!({
        "method": "authenticate",
        "params": {
            "user": user,
            "clientNonce2": client_nonce2,
            "challengeResponse": challenge_response,
        },
    })
}

pub fn ping() -> Value {
    json!({"method": "ping"})
}

pub fn read_request(context: i64, batch: &ReadBatch) -> Value {
    json!({
        "method": "read",
        "context": context,
        "params": {
            "kind": "indexedPoints",
            "devices": [{"device": batch.device, "items": batch.items}],
        },
    })
}

pub fn write_request(context: i64, address: Address, value: f64) -> Value {
    json!({
        "method": "write",
        "context": context,
        "params": {
            "kind": "indexedPoints",
            "devices": [{
                "device": address.device,
                "items": [address.item],
                "values": [value],
            }],
        },
    })
}

/// Parse an `update` frame's device blocks into per-address raw values
///
/// A non-zero entry in the `errors` array marks that address errored;
/// missing values map to an empty raw value that fails validity checks.
pub fn parse_update(params: &Value, fetched_at: DateTime<Utc>) -> HashMap<Address, RawValue> {
    let mut out = HashMap::new();
    let devices = match params.get("devices").and_then(Value::as_array) {
        Some(devices) => devices,
        None => return out,
    };

    for block in devices {
        let device = match block.get("device").and_then(Value::as_u64) {
            Some(d) if d <= u16::MAX as u64 => d as u16,
            _ => continue,
        };
        let items = block
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let values = block
            .get("values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let errors = block
            .get("errors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (idx, item) in items.iter().enumerate() {
            let item = match item.as_u64() {
                Some(i) if i <= u32::MAX as u64 => i as u32,
                _ => continue,
            };
            let address = Address::new(device, item);
            let code = errors.get(idx).and_then(Value::as_i64).unwrap_or(0);
            let raw = if code != 0 {
                RawValue::errored(
                    PointError {
                        code,
                        text: error_text(code),
                    },
                    fetched_at,
                )
            } else {
                RawValue {
                    value: values.get(idx).cloned(),
                    error: None,
                    fetched_at,
                }
            };
            out.insert(address, raw);
        }
    }
    out
}

/// Human-readable text for a controller error code
pub fn error_text(code: i64) -> String {
    let text = match code {
        0 => "OK",
        1 => "Wrong data type",
        3 => "Illegal load number",
        5 => "It does not exist",
        19 => "The variable does not exist",
        20 => "The memory of the controller is full",
        23 | 24 => "Illegal access level",
        25 => "Illegal parameter value",
        26 => "Wrong password",
        28 => "Access denied",
        30 => "Internal error on hardware device",
        37 => "Illegal address",
        38 => "Illegal command",
        39 => "Wrong message length",
        40 => "Data too large",
        41 => "Address outside range",
        43 => "Not allowed",
        45 => "It is busy for the moment",
        47 => "Dataconversion error",
        100 => "Data invalid",
        193 => "No Answer",
        194 => "Internal error",
        196 => "Wrong checksum or incorrect answer syntax",
        201 => "No response from the configured IP address",
        203 => "Serious TCP/IP error. Check the network installation and configuration",
        204 => "No configured route for this EXOline address",
        206 => "End-of-Message not received",
        207 => "Received message is too long",
        208 => "Parity or format error",
        _ => return format!("Unknown error {code}"),
    };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn context_counter_wraps() {
        let mut counter = ContextCounter { next: READ_CONTEXT_MAX };
        assert_eq!(counter.next(), READ_CONTEXT_MAX);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn chunking_groups_by_device() {
        let addresses: BTreeSet<Address> =
            [addr("0:1"), addr("0:2"), addr("1:7")].into_iter().collect();
        let batches = chunk_reads(&addresses);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], ReadBatch { device: 0, items: vec![1, 2] });
        assert_eq!(batches[1], ReadBatch { device: 1, items: vec![7] });
    }

    #[test]
    fn chunking_folds_short_tail() {
        // 83 items: tail of 3 would be below the merge threshold, so one batch
        let addresses: BTreeSet<Address> = (0..83).map(|i| Address::new(0, i)).collect();
        let batches = chunk_reads(&addresses);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].items.len(), 83);

        // 90 items: split at 80, leaving a tail of 10
        let addresses: BTreeSet<Address> = (0..90).map(|i| Address::new(0, i)).collect();
        let batches = chunk_reads(&addresses);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].items.len(), 80);
        assert_eq!(batches[1].items.len(), 10);
    }

    #[test]
    fn update_parsing_with_partial_errors() {
        let params = serde_json::json!({
            "devices": [{
                "device": 0,
                "items": [100, 101, 102],
                "values": [21.5, null, 3],
                "errors": [0, 19, 0],
            }],
        });
        let now = Utc::now();
        let parsed = parse_update(&params, now);
        assert_eq!(parsed.len(), 3);

        let ok = &parsed[&addr("0:100")];
        assert!(ok.is_valid());
        assert_eq!(ok.value, Some(serde_json::json!(21.5)));

        let errored = &parsed[&addr("0:101")];
        assert!(!errored.is_valid());
        assert_eq!(
            errored.error,
            Some(PointError {
                code: 19,
                text: "The variable does not exist".to_string()
            })
        );

        let integral = &parsed[&addr("0:102")];
        assert!(integral.is_valid());
        assert_eq!(integral.value, Some(serde_json::json!(3)));
    }

    #[test]
    fn update_parsing_tolerates_missing_arrays() {
        let params = serde_json::json!({
            "devices": [{"device": 0, "items": [5]}],
        });
        let parsed = parse_update(&params, Utc::now());
        assert!(!parsed[&addr("0:5")].is_valid());
    }

    #[test]
    fn read_request_shape() {
        let frame = read_request(42, &ReadBatch { device: 0, items: vec![1, 2] });
        assert_eq!(frame["method"], "read");
        assert_eq!(frame["context"], 42);
        assert_eq!(frame["params"]["kind"], "indexedPoints");
        assert_eq!(frame["params"]["devices"][0]["items"], serde_json::json!([1, 2]));
    }

    #[test]
    fn unknown_error_code_text() {
        assert_eq!(error_text(9999), "Unknown error 9999");
        assert_eq!(error_text(19), "The variable does not exist");
    }
}
