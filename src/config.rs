use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dtype::DeviceClass;
use crate::errors::{DispatchError, Result};

/// Routing and dispatch settings for one MoE layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Number of experts each token is sent to (k in top-k)
    pub top_k: usize,

    /// Multiplier on the even-split token count per expert.
    /// Values below 1.0 force drops even for perfectly balanced routing.
    pub capacity_factor: f64,

    /// Accumulate the load balance loss in float32 regardless of gate dtype
    pub fp32_gate: bool,

    /// Hand out capacity slots by descending gate confidence instead of token order
    pub batch_prioritized_routing: bool,

    /// Apply gates when combining expert outputs (decode) rather than when dispatching (encode)
    pub is_postscore: bool,

    /// Device class the scatter kernels run on
    pub device: DeviceClass,

    /// Weight of the load balance loss in the training objective (typically 0.01)
    pub load_balance_weight: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            top_k: 2,
            capacity_factor: 1.0,
            fp32_gate: false,
            batch_prioritized_routing: false,
            is_postscore: true,
            device: DeviceClass::Host,
            load_balance_weight: 0.01,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(DispatchError::invalid("top_k must be at least 1"));
        }
        if !self.capacity_factor.is_finite() || self.capacity_factor <= 0.0 {
            return Err(DispatchError::invalid(format!(
                "capacity_factor must be positive, got {}",
                self.capacity_factor
            )));
        }
        if !self.load_balance_weight.is_finite() || self.load_balance_weight < 0.0 {
            return Err(DispatchError::invalid(format!(
                "load_balance_weight must be non-negative, got {}",
                self.load_balance_weight
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RoutingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded routing config");
        Ok(config)
    }
}
