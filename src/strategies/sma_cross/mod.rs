//! SMA Cross Strategy
//!
//! Trend follower on two simple moving averages.
//!
//! ## Entry Logic
//! - Long when the fast SMA crosses above the slow SMA
//! - Short on the opposite cross, when `allow_short` is set
//!
//! ## Exit Logic
//! - The opposite cross closes the position
//! - Optional fixed stop loss from `stop_loss`

mod config;
mod strategy;

pub use config::SmaCrossConfig;
pub use strategy::SmaCrossStrategy;

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Strategy;
use crate::config::RunPolicyConfig;
use crate::errors::Result;

/// Registry name
pub const NAME: &str = "sma_cross";

/// Create the strategy for one policy and pair
pub fn create(pol: &RunPolicyConfig, params: &BTreeMap<String, f64>) -> Result<Arc<dyn Strategy>> {
    let cfg = SmaCrossConfig::from_params(params);
    cfg.validate()?;
    Ok(Arc::new(SmaCrossStrategy::new(cfg, pol)?))
}
