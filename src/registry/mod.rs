//! Variable registry: the declarative catalogue of controller variables
//!
//! The catalogue is data, not logic. It is loaded and validated once at
//! startup, indexed by identifier and by poll group, and immutable from
//! then on, so coordinators and the write gateway can read it
//! concurrently without synchronization.

use crate::error::{HomesideError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Wire-level location of one raw controller value, encoded as "device:item"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub device: u16,
    pub item: u32,
}

impl Address {
    pub fn new(device: u16, item: u32) -> Self {
        Self { device, item }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.item)
    }
}

impl FromStr for Address {
    type Err = HomesideError;

    fn from_str(s: &str) -> Result<Self> {
        let (device, item) = s
            .split_once(':')
            .ok_or_else(|| HomesideError::invalid_input(format!("address '{s}' must be 'device:item'")))?;
        let device = device
            .trim()
            .parse::<u16>()
            .map_err(|_| HomesideError::invalid_input(format!("invalid device in address '{s}'")))?;
        let item = item
            .trim()
            .parse::<u32>()
            .map_err(|_| HomesideError::invalid_input(format!("invalid item in address '{s}'")))?;
        Ok(Self { device, item })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Entity category a variable is exposed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Sensor,
    BinarySensor,
    Number,
    Switch,
    Select,
}

/// Coordinator group, one shared polling interval each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollGroup {
    Fast,
    Normal,
    Slow,
    VerySlow,
    Diagnostic,
}

impl PollGroup {
    pub const ALL: [PollGroup; 5] = [
        PollGroup::Fast,
        PollGroup::Normal,
        PollGroup::Slow,
        PollGroup::VerySlow,
        PollGroup::Diagnostic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PollGroup::Fast => "fast",
            PollGroup::Normal => "normal",
            PollGroup::Slow => "slow",
            PollGroup::VerySlow => "very_slow",
            PollGroup::Diagnostic => "diagnostic",
        }
    }
}

impl fmt::Display for PollGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Name fragments the controller vendor uses for fast-moving process values
// (temperatures, pressures, flow/return lines) and for near-static data.
// Swedish terms come from the stock variable tables.
const FAST_PATTERNS: &[&str] = &[
    "temp",
    "temperatur",
    "tryck",
    "pressure",
    "bar",
    "framledning",
    "retur",
    "tapp",
];

const SLOW_PATTERNS: &[&str] = &[
    "kalibrering",
    "calibration",
    "kurv",
    "curve",
    "börvärde",
    "setpoint",
    "sommardrift",
    "val",
    "gräns",
    "limit",
];

const VERY_SLOW_PATTERNS: &[&str] = &[
    "version",
    "serial",
    "id",
    "fc-nr",
    "latitud",
    "longitud",
    "sekund",
];

/// Classify a variable into a poll group from its display name
pub fn classify_group(name: &str) -> PollGroup {
    let name = name.to_lowercase();
    if VERY_SLOW_PATTERNS.iter().any(|p| name.contains(p)) {
        PollGroup::VerySlow
    } else if SLOW_PATTERNS.iter().any(|p| name.contains(p)) {
        PollGroup::Slow
    } else if FAST_PATTERNS.iter().any(|p| name.contains(p)) {
        PollGroup::Fast
    } else {
        PollGroup::Normal
    }
}

/// One catalogue record: a logical variable backed by one or more addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Stable identifier
    pub id: String,

    /// Display name; falls back to the id
    #[serde(default)]
    pub name: Option<String>,

    /// Entity category
    pub category: VariableKind,

    /// Ordered protocol addresses; order drives format substitution
    pub addresses: Vec<Address>,

    /// Positional format template ("{0}-{1}"); optional for single addresses
    #[serde(default)]
    pub format: Option<String>,

    /// Decimal places applied to numeric values before substitution
    #[serde(default)]
    pub decimals: Option<u8>,

    /// Whether writes are accepted; forced off for combined variables
    #[serde(default)]
    pub writable: bool,

    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    #[serde(default)]
    pub step: Option<f64>,

    /// Whether the variable is exposed by default
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Explicit poll group; classified from the name when absent
    #[serde(default)]
    pub group: Option<PollGroup>,

    /// Unit of measurement, passed through to consumers
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl VariableDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// A combined variable derives its value from more than one address
    pub fn is_combined(&self) -> bool {
        self.addresses.len() > 1
    }

    /// Effective writability: combined variables are always read-only
    pub fn effective_writable(&self) -> bool {
        self.writable && !self.is_combined()
    }

    /// Poll group, explicit or classified from the display name
    pub fn poll_group(&self) -> PollGroup {
        self.group.unwrap_or_else(|| classify_group(self.display_name()))
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\d+)\}").expect("placeholder pattern is valid"));

/// Extract the positional placeholder indices referenced by a template
pub fn template_indices(template: &str) -> BTreeSet<usize> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}

/// Top-level catalogue file shape
#[derive(Debug, Deserialize)]
struct Catalogue {
    variables: Vec<VariableDefinition>,
}

/// Immutable, validated variable catalogue with id and group indexes
#[derive(Debug)]
pub struct VariableRegistry {
    by_id: HashMap<String, VariableDefinition>,
    group_members: HashMap<PollGroup, Vec<String>>,
    group_addresses: HashMap<PollGroup, BTreeSet<Address>>,
}

impl VariableRegistry {
    /// Parse and validate a JSON catalogue
    pub fn load(source: &str) -> Result<Self> {
        let catalogue: Catalogue = serde_json::from_str(source)
            .map_err(|e| HomesideError::config(format!("malformed variable catalogue: {e}")))?;
        Self::from_definitions(catalogue.variables)
    }

    /// Load a catalogue from a file path
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            HomesideError::config(format!(
                "cannot read catalogue {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::load(&source)
    }

    /// Build a registry from already-parsed definitions
    pub fn from_definitions(definitions: Vec<VariableDefinition>) -> Result<Self> {
        let mut by_id: HashMap<String, VariableDefinition> = HashMap::new();
        let mut group_members: HashMap<PollGroup, Vec<String>> = HashMap::new();
        let mut group_addresses: HashMap<PollGroup, BTreeSet<Address>> = HashMap::new();

        for mut def in definitions {
            validate_definition(&def)?;

            if def.writable && def.is_combined() {
                // Explicit policy: combined variables are downgraded to
                // read-only rather than rejected at load.
                warn!(
                    id = %def.id,
                    addresses = def.addresses.len(),
                    "combined variable declared writable, downgrading to read-only"
                );
                def.writable = false;
            }

            if by_id.contains_key(&def.id) {
                return Err(HomesideError::config(format!(
                    "duplicate variable id '{}'",
                    def.id
                )));
            }

            if def.enabled {
                let group = def.poll_group();
                group_members
                    .entry(group)
                    .or_default()
                    .push(def.id.clone());
                group_addresses
                    .entry(group)
                    .or_default()
                    .extend(def.addresses.iter().copied());
            }

            by_id.insert(def.id.clone(), def);
        }

        debug!(
            variables = by_id.len(),
            groups = group_members.len(),
            "variable catalogue loaded"
        );

        Ok(Self {
            by_id,
            group_members,
            group_addresses,
        })
    }

    /// Look up a definition by identifier
    pub fn definition(&self, id: &str) -> Result<&VariableDefinition> {
        self.by_id
            .get(id)
            .ok_or_else(|| HomesideError::not_found(format!("unknown variable '{id}'")))
    }

    /// Deduplicated set of raw addresses needed to refresh a group
    pub fn addresses_needed_by(&self, group: PollGroup) -> BTreeSet<Address> {
        self.group_addresses.get(&group).cloned().unwrap_or_default()
    }

    /// Enabled definitions belonging to a group
    pub fn definitions_in(&self, group: PollGroup) -> Vec<&VariableDefinition> {
        self.group_members
            .get(&group)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    /// Groups that have at least one enabled variable
    pub fn active_groups(&self) -> Vec<PollGroup> {
        PollGroup::ALL
            .into_iter()
            .filter(|g| self.group_members.contains_key(g))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn validate_definition(def: &VariableDefinition) -> Result<()> {
    if def.id.trim().is_empty() {
        return Err(HomesideError::config("variable with empty id"));
    }
    if def.addresses.is_empty() {
        return Err(HomesideError::config(format!(
            "variable '{}' has no addresses",
            def.id
        )));
    }

    match &def.format {
        Some(template) => {
            let indices = template_indices(template);
            let expected: BTreeSet<usize> = (0..def.addresses.len()).collect();
            if indices != expected {
                return Err(HomesideError::config(format!(
                    "variable '{}': format template must reference exactly indices 0..{} (found {:?})",
                    def.id,
                    def.addresses.len().saturating_sub(1),
                    indices
                )));
            }
        }
        None => {
            if def.is_combined() {
                return Err(HomesideError::config(format!(
                    "combined variable '{}' requires a format template",
                    def.id
                )));
            }
        }
    }

    if let (Some(min), Some(max)) = (def.min, def.max) {
        if min > max {
            return Err(HomesideError::config(format!(
                "variable '{}': min {min} exceeds max {max}",
                def.id
            )));
        }
    }
    if let Some(step) = def.step {
        if step <= 0.0 {
            return Err(HomesideError::config(format!(
                "variable '{}': step must be positive, got {step}",
                def.id
            )));
        }
    }

    Ok(())
}
