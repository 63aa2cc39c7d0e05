//! Write gateway: validated writes against registry constraints
//!
//! Every write re-validates against the catalogue before touching the
//! session: unknown ids, read-only and combined variables, and values off
//! the declared min/max/step grid are rejected here and logged, without
//! any socket I/O.

use crate::error::{HomesideError, Result};
use crate::protocol::ProtocolSession;
use crate::registry::{VariableDefinition, VariableRegistry};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tolerance for min/max/step comparisons
const FLOAT_TOLERANCE: f64 = 1e-6;

pub struct WriteGateway {
    registry: Arc<VariableRegistry>,
    session: Arc<dyn ProtocolSession>,
}

impl WriteGateway {
    pub fn new(registry: Arc<VariableRegistry>, session: Arc<dyn ProtocolSession>) -> Self {
        Self { registry, session }
    }

    /// Validate and submit one write
    pub async fn submit(&self, id: &str, value: f64) -> Result<()> {
        let def = match self.registry.definition(id) {
            Ok(def) => def,
            Err(err) => {
                warn!(id, "write rejected: unknown variable");
                return Err(err);
            }
        };

        if def.is_combined() {
            warn!(id, "write rejected: combined variables are read-only");
            return Err(HomesideError::write_rejected(format!(
                "'{id}' is a combined variable and read-only"
            )));
        }
        if !def.writable {
            warn!(id, "write rejected: variable is not writable");
            return Err(HomesideError::write_rejected(format!(
                "'{id}' is not writable"
            )));
        }
        validate_bounds(def, value)?;

        let address = def.addresses.first().copied().ok_or_else(|| {
            HomesideError::config(format!("variable '{id}' has no address"))
        })?;
        debug!(id, %address, value, "submitting write");
        self.session.write(address, value).await
    }
}

fn validate_bounds(def: &VariableDefinition, value: f64) -> Result<()> {
    if let Some(min) = def.min {
        if value < min - FLOAT_TOLERANCE {
            warn!(id = %def.id, value, min, "write rejected: below minimum");
            return Err(HomesideError::out_of_range(format!(
                "{value} below minimum {min} for '{}'",
                def.id
            )));
        }
    }
    if let Some(max) = def.max {
        if value > max + FLOAT_TOLERANCE {
            warn!(id = %def.id, value, max, "write rejected: above maximum");
            return Err(HomesideError::out_of_range(format!(
                "{value} above maximum {max} for '{}'",
                def.id
            )));
        }
    }
    if let Some(step) = def.step {
        // Value must sit on min + k*step for some non-negative integer k.
        let base = def.min.unwrap_or(0.0);
        let steps = (value - base) / step;
        let nearest = steps.round();
        if nearest < -FLOAT_TOLERANCE || (value - (base + nearest * step)).abs() > FLOAT_TOLERANCE {
            warn!(id = %def.id, value, step, "write rejected: off the step grid");
            return Err(HomesideError::out_of_range(format!(
                "{value} is not on the {step} step grid from {base} for '{}'",
                def.id
            )));
        }
    }
    Ok(())
}
