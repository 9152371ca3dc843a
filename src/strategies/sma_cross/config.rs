//! SMA Cross Configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for the SMA cross strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaCrossConfig {
    /// Fast SMA period (default: 5)
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,

    /// Slow SMA period (default: 20)
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,

    /// Also trade death crosses short (default: false)
    #[serde(default)]
    pub allow_short: bool,

    /// Stop loss below entry as a ratio, 0 disables (default: 0.0)
    #[serde(default)]
    pub stop_loss_pct: f64,

    /// Enter with a limit this ratio below/above the close, 0 for market (default: 0.0)
    #[serde(default)]
    pub limit_offset: f64,
}

fn default_fast_period() -> usize { 5 }
fn default_slow_period() -> usize { 20 }

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            allow_short: false,
            stop_loss_pct: 0.0,
            limit_offset: 0.0,
        }
    }
}

impl SmaCrossConfig {
    /// Build from a policy's numeric parameter map; unknown keys are ignored.
    pub fn from_params(params: &BTreeMap<String, f64>) -> Self {
        let mut cfg = Self::default();
        let period = |v: f64| v.round().max(1.0) as usize;
        if let Some(v) = params.get("fast") {
            cfg.fast_period = period(*v);
        }
        if let Some(v) = params.get("slow") {
            cfg.slow_period = period(*v);
        }
        if let Some(v) = params.get("allow_short") {
            cfg.allow_short = *v > 0.0;
        }
        if let Some(v) = params.get("stop_loss") {
            cfg.stop_loss_pct = *v;
        }
        if let Some(v) = params.get("limit_offset") {
            cfg.limit_offset = *v;
        }
        cfg
    }

    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.fast_period >= self.slow_period {
            return Err(crate::errors::TradeError::new(
                crate::errors::ErrKind::BadConfig,
                format!("fast period {} must be below slow period {}", self.fast_period, self.slow_period),
            ));
        }
        if !(0.0..1.0).contains(&self.stop_loss_pct) || !(0.0..1.0).contains(&self.limit_offset) {
            return Err(crate::errors::TradeError::new(
                crate::errors::ErrKind::BadConfig,
                "stop_loss and limit_offset must be ratios in [0, 1)",
            ));
        }
        Ok(())
    }
}
