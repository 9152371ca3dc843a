//! Volatility Regime Strategy
//!
//! Long-only breakout that only trades when volatility is calm.
//!
//! ## Regimes
//! The current ATR is compared with its mean over `volatility_lookback` bars:
//! - Compression: ratio <= `compression_threshold`
//! - Normal: in between
//! - Expansion: ratio >= `expansion_threshold`
//! - Extreme: ratio >= `extreme_threshold`
//!
//! ## Entry Logic
//! - Regime is Compression or Normal
//! - Fast EMA above slow EMA
//! - Close crosses above `recent_high - breakout_atr_multiple * ATR`
//!
//! ## Exit Logic
//! - ATR-based stop loss and take profit set at entry
//! - Trailing stop once the move reaches `trailing_activation` ATRs
//! - Extreme regime, or a profitable close below the slow EMA

mod config;
mod strategy;

pub use config::VolatilityRegimeConfig;
pub use strategy::VolatilityRegimeStrategy;

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Strategy;
use crate::config::RunPolicyConfig;
use crate::errors::Result;

/// Registry name
pub const NAME: &str = "volatility_regime";

/// Market volatility regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityRegime {
    Compression,
    Normal,
    Expansion,
    Extreme,
}

pub fn create(pol: &RunPolicyConfig, params: &BTreeMap<String, f64>) -> Result<Arc<dyn Strategy>> {
    let cfg = VolatilityRegimeConfig::from_params(params);
    cfg.validate()?;
    Ok(Arc::new(VolatilityRegimeStrategy::new(cfg, pol)?))
}
