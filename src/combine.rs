//! Value combiner: raw per-address values into one logical value
//!
//! A pure function of the variable definition and the current raw-value
//! mapping. If any required constituent is missing or errored the result
//! is invalid; consumers render "unavailable", never a stale or default
//! value. Combined (multi-address) variables are always read-only here,
//! so platform adapters cannot get that policy wrong.

use crate::protocol::RawValue;
use crate::registry::{Address, VariableDefinition, VariableKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Resolved state of one logical variable
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CombinedState {
    Unavailable,
    Bool(bool),
    Numeric(f64),
    Text(String),
}

/// The combined, formatted value of a logical variable for one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedValue {
    pub id: String,
    pub state: CombinedState,
    /// False when any required raw value was missing or errored
    pub valid: bool,
    /// Effective writability; always false for combined variables
    pub writable: bool,
    /// Contributing raw values, exposed as auxiliary attributes
    pub sources: BTreeMap<Address, RawValue>,
}

impl CombinedValue {
    /// An invalid value carrying whatever sources were present
    pub fn unavailable(def: &VariableDefinition, sources: BTreeMap<Address, RawValue>) -> Self {
        Self {
            id: def.id.clone(),
            state: CombinedState::Unavailable,
            valid: false,
            writable: def.effective_writable(),
            sources,
        }
    }
}

/// Round half-to-even at the given number of decimal places
///
/// Matches display conventions: exact ties go to the even neighbour. The
/// tie comparison uses a small tolerance so decimal literals that sit a
/// hair under the boundary (e.g. 22.445) still count as ties.
pub fn round_half_even(value: f64, decimals: u8) -> f64 {
    const TIE_EPS: f64 = 1e-9;
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let floor = scaled.floor();
    let diff = scaled - floor;
    let rounded = if diff > 0.5 + TIE_EPS {
        floor + 1.0
    } else if diff < 0.5 - TIE_EPS {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    };
    rounded / factor
}

/// Render one raw scalar for template substitution
fn render_scalar(value: &Value, decimals: Option<u8>) -> String {
    match value {
        Value::Number(n) => {
            if let Some(decimals) = decimals {
                if let Some(f) = n.as_f64() {
                    return format!("{:.*}", decimals as usize, round_half_even(f, decimals));
                }
            }
            // Integral raw values render without a fractional part
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.to_string()
            }
        }
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.to_lowercase().as_str(), "1" | "true" | "on"),
        _ => false,
    }
}

/// Substitute positional placeholders `{0}`, `{1}`, ... with rendered values
fn apply_template(template: &str, rendered: &[String]) -> String {
    let mut out = template.to_string();
    for (idx, value) in rendered.iter().enumerate() {
        out = out.replace(&format!("{{{idx}}}"), value);
    }
    out
}

/// Combine the raw values for one definition into its logical value
pub fn combine(def: &VariableDefinition, raw: &HashMap<Address, RawValue>) -> CombinedValue {
    let mut sources = BTreeMap::new();
    let mut values = Vec::with_capacity(def.addresses.len());

    for address in &def.addresses {
        match raw.get(address) {
            Some(sample) => {
                sources.insert(*address, sample.clone());
                if !sample.is_valid() {
                    return CombinedValue::unavailable(def, sources);
                }
                // is_valid guarantees a non-null payload
                match &sample.value {
                    Some(value) => values.push(value.clone()),
                    None => return CombinedValue::unavailable(def, sources),
                }
            }
            None => return CombinedValue::unavailable(def, sources),
        }
    }

    let state = match &def.format {
        Some(template) => {
            let rendered: Vec<String> = values
                .iter()
                .map(|v| render_scalar(v, def.decimals))
                .collect();
            CombinedState::Text(apply_template(template, &rendered))
        }
        None => match values.first() {
            Some(value) => single_state(def, value),
            None => return CombinedValue::unavailable(def, sources),
        },
    };

    CombinedValue {
        id: def.id.clone(),
        state,
        valid: true,
        writable: def.effective_writable(),
        sources,
    }
}

fn single_state(def: &VariableDefinition, value: &Value) -> CombinedState {
    match def.category {
        VariableKind::BinarySensor | VariableKind::Switch => CombinedState::Bool(truthy(value)),
        _ => match value {
            Value::Number(n) => {
                let Some(f) = n.as_f64() else {
                    return CombinedState::Text(n.to_string());
                };
                match def.decimals {
                    Some(decimals) => CombinedState::Numeric(round_half_even(f, decimals)),
                    None => CombinedState::Numeric(f),
                }
            }
            Value::String(s) => CombinedState::Text(s.clone()),
            Value::Bool(b) => CombinedState::Bool(*b),
            other => CombinedState::Text(other.to_string()),
        },
    }
}
