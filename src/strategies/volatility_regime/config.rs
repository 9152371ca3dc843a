//! Volatility Regime Configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ErrKind, Result, TradeError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityRegimeConfig {
    /// ATR period (default: 14)
    pub atr_period: usize,
    /// Bars the ATR mean and the breakout high look back (default: 20)
    pub volatility_lookback: usize,
    pub compression_threshold: f64,
    pub expansion_threshold: f64,
    pub extreme_threshold: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    /// Breakout level below the recent high, in ATRs
    pub breakout_atr_multiple: f64,
    pub stop_atr_multiple: f64,
    pub target_atr_multiple: f64,
    /// Profit in ATRs before the stop starts trailing, 0 disables
    pub trailing_activation: f64,
    pub trailing_atr_multiple: f64,
}

impl Default for VolatilityRegimeConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            volatility_lookback: 20,
            compression_threshold: 0.6,
            expansion_threshold: 1.5,
            extreme_threshold: 2.5,
            ema_fast: 8,
            ema_slow: 21,
            breakout_atr_multiple: 1.5,
            stop_atr_multiple: 2.5,
            target_atr_multiple: 5.0,
            trailing_activation: 2.0,
            trailing_atr_multiple: 1.5,
        }
    }
}

impl VolatilityRegimeConfig {
    /// Build from a policy's numeric parameter map; unknown keys are ignored.
    pub fn from_params(params: &BTreeMap<String, f64>) -> Self {
        let mut cfg = Self::default();
        let period = |v: f64| v.round().max(1.0) as usize;
        for (key, val) in params.iter() {
            let val = *val;
            match key.as_str() {
                "atr_period" => cfg.atr_period = period(val),
                "volatility_lookback" => cfg.volatility_lookback = period(val),
                "compression" | "compression_threshold" => cfg.compression_threshold = val,
                "expansion_threshold" => cfg.expansion_threshold = val,
                "extreme_threshold" => cfg.extreme_threshold = val,
                "ema_fast" => cfg.ema_fast = period(val),
                "ema_slow" => cfg.ema_slow = period(val),
                "breakout_atr" | "breakout_atr_multiple" => cfg.breakout_atr_multiple = val,
                "stop_atr" | "stop_atr_multiple" => cfg.stop_atr_multiple = val,
                "target_atr" | "target_atr_multiple" => cfg.target_atr_multiple = val,
                "trailing_activation" => cfg.trailing_activation = val,
                "trailing_atr" | "trailing_atr_multiple" => cfg.trailing_atr_multiple = val,
                _ => {}
            }
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(TradeError::new(ErrKind::BadConfig, msg));
        if self.ema_fast >= self.ema_slow {
            return bad(format!("ema_fast {} must be below ema_slow {}", self.ema_fast, self.ema_slow));
        }
        if !(self.compression_threshold < self.expansion_threshold
            && self.expansion_threshold < self.extreme_threshold)
        {
            return bad("regime thresholds must increase: compression < expansion < extreme".to_string());
        }
        if self.stop_atr_multiple <= 0.0 || self.target_atr_multiple <= 0.0 {
            return bad("stop and target ATR multiples must be positive".to_string());
        }
        Ok(())
    }

    /// Bars needed before the first signal
    pub fn warmup(&self) -> usize {
        (self.atr_period + self.volatility_lookback).max(self.ema_slow) + 1
    }
}
