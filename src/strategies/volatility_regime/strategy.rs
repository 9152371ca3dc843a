//! Volatility Regime Strategy Implementation
//!
//! Indicators are updated incrementally per bar and kept in the job state.

use std::collections::VecDeque;
use ta::indicators::{AverageTrueRange, ExponentialMovingAverage};
use ta::Next;
use tracing::debug;

use super::config::VolatilityRegimeConfig;
use super::{VolatilityRegime, NAME};
use crate::config::RunPolicyConfig;
use crate::errors::{ErrKind, Result, TradeError};
use crate::orders::ExitTrigger;
use crate::scheduler::env::BarEnv;
use crate::scheduler::job::StratJob;
use crate::strategies::{EnterReq, ExitReq, Strategy};
use crate::types::{Dirt, Kline};

/// Per-job indicator state
#[derive(Debug, Clone)]
struct RegimeState {
    atr: AverageTrueRange,
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    atrs: VecDeque<f64>,
    highs: VecDeque<f64>,
    prev_close: Option<f64>,
    seen: usize,
    /// Entry price of the open position
    entry: Option<f64>,
    trail_stop: f64,
}

/// Indicator values of the latest bar
#[derive(Debug, Clone, Copy)]
struct Reading {
    regime: VolatilityRegime,
    atr: f64,
    fast: f64,
    slow: f64,
    breakout: bool,
    entry: Option<f64>,
    trail_stop: f64,
}

#[derive(Debug, Clone)]
pub struct VolatilityRegimeStrategy {
    config: VolatilityRegimeConfig,
    init: RegimeState,
    run_timeframes: Vec<String>,
    stake_rate: f64,
    order_bar_max: i64,
}

impl VolatilityRegimeStrategy {
    pub fn new(config: VolatilityRegimeConfig, pol: &RunPolicyConfig) -> Result<Self> {
        let bad = |what: &str, period: usize, e: ta::errors::TaError| {
            TradeError::new(ErrKind::BadConfig, format!("{}({}): {:?}", what, period, e))
        };
        let init = RegimeState {
            atr: AverageTrueRange::new(config.atr_period).map_err(|e| bad("atr", config.atr_period, e))?,
            ema_fast: ExponentialMovingAverage::new(config.ema_fast).map_err(|e| bad("ema", config.ema_fast, e))?,
            ema_slow: ExponentialMovingAverage::new(config.ema_slow).map_err(|e| bad("ema", config.ema_slow, e))?,
            atrs: VecDeque::with_capacity(config.volatility_lookback + 1),
            highs: VecDeque::with_capacity(config.volatility_lookback + 1),
            prev_close: None,
            seen: 0,
            entry: None,
            trail_stop: 0.0,
        };
        Ok(Self {
            config,
            init,
            run_timeframes: pol.run_timeframes.clone(),
            stake_rate: pol.stake_rate,
            order_bar_max: pol.order_bar_max,
        })
    }

    pub fn config(&self) -> &VolatilityRegimeConfig {
        &self.config
    }

    /// Classify `atr` against the mean of the recent values.
    fn classify(&self, atr: f64, atrs: &VecDeque<f64>) -> VolatilityRegime {
        let mean = if atrs.is_empty() { 0.0 } else { atrs.iter().sum::<f64>() / atrs.len() as f64 };
        if mean <= 0.0 {
            return VolatilityRegime::Normal;
        }
        let ratio = atr / mean;
        let cfg = &self.config;
        if ratio >= cfg.extreme_threshold {
            VolatilityRegime::Extreme
        } else if ratio >= cfg.expansion_threshold {
            VolatilityRegime::Expansion
        } else if ratio <= cfg.compression_threshold {
            VolatilityRegime::Compression
        } else {
            VolatilityRegime::Normal
        }
    }

    /// Feed one bar into the job state. `None` until warmed up.
    fn update(&self, job: &mut StratJob, bar: &Kline) -> Option<Reading> {
        let lookback = self.config.volatility_lookback;
        let warmup = self.config.warmup();
        let flat = job.long_ods.is_empty();
        let st = job.state_or_insert_with(|| self.init.clone())?;
        let atr = st.atr.next(bar);
        let fast = st.ema_fast.next(bar.close);
        let slow = st.ema_slow.next(bar.close);
        st.seen += 1;

        let recent_high = st.highs.iter().copied().fold(f64::MIN, f64::max);
        let level = recent_high - self.config.breakout_atr_multiple * atr;
        let breakout = st.highs.len() >= lookback
            && st.prev_close.map(|p| p <= level).unwrap_or(false)
            && bar.close > level;

        st.atrs.push_back(atr);
        st.highs.push_back(bar.high);
        while st.atrs.len() > lookback {
            st.atrs.pop_front();
        }
        while st.highs.len() > lookback {
            st.highs.pop_front();
        }
        st.prev_close = Some(bar.close);
        if flat {
            st.entry = None;
            st.trail_stop = 0.0;
        }
        if st.seen < warmup {
            return None;
        }
        let regime = self.classify(atr, &st.atrs);
        Some(Reading {
            regime,
            atr,
            fast,
            slow,
            breakout,
            entry: st.entry,
            trail_stop: st.trail_stop,
        })
    }

    fn manage_long(&self, job: &mut StratJob, close: f64, rd: &Reading) {
        if rd.regime == VolatilityRegime::Extreme {
            let _ = job.close_orders(ExitReq::new("extreme").with_dirt(Dirt::Long));
            return;
        }
        let Some(entry) = rd.entry else {
            return;
        };
        if close >= entry && close < rd.slow {
            let _ = job.close_orders(ExitReq::new("ema_exit").with_dirt(Dirt::Long));
            return;
        }
        let cfg = &self.config;
        if cfg.trailing_activation <= 0.0 || rd.atr <= 0.0 {
            return;
        }
        if (close - entry) / rd.atr < cfg.trailing_activation {
            return;
        }
        let stop = (close - cfg.trailing_atr_multiple * rd.atr).max(entry - cfg.stop_atr_multiple * rd.atr);
        if stop <= rd.trail_stop {
            return;
        }
        if let Err(err) = job.set_all_stop_loss(Dirt::Long, Some(ExitTrigger::new(stop).with_tag("trail"))) {
            debug!(symbol = %job.pair(), %err, "trailing stop rejected");
            return;
        }
        if let Some(st) = job.state_or_insert_with(|| self.init.clone()) {
            st.trail_stop = stop;
        }
    }
}

impl Strategy for VolatilityRegimeStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn warmup_num(&self) -> usize {
        self.config.warmup()
    }

    fn stake_rate(&self) -> f64 {
        self.stake_rate
    }

    fn order_bar_max(&self) -> i64 {
        self.order_bar_max
    }

    fn each_max_long(&self) -> i32 {
        1
    }

    fn each_max_short(&self) -> i32 {
        -1
    }

    fn run_timeframes(&self) -> Vec<String> {
        self.run_timeframes.clone()
    }

    fn on_bar(&self, job: &mut StratJob, env: &BarEnv) {
        let Some(bar) = env.last().copied() else {
            return;
        };
        if !bar.close.is_finite() {
            return;
        }
        let Some(rd) = self.update(job, &bar) else {
            return;
        };
        if !job.long_ods.is_empty() {
            self.manage_long(job, bar.close, &rd);
            return;
        }
        let calm = matches!(rd.regime, VolatilityRegime::Compression | VolatilityRegime::Normal);
        if !calm || rd.fast <= rd.slow || !rd.breakout {
            return;
        }
        let cfg = &self.config;
        let req = EnterReq::long("breakout")
            .with_stop_loss(bar.close - cfg.stop_atr_multiple * rd.atr, 0.0)
            .with_take_profit(bar.close + cfg.target_atr_multiple * rd.atr, 0.0);
        match job.open_order(req) {
            Ok(()) => {
                if let Some(st) = job.state_or_insert_with(|| self.init.clone()) {
                    st.entry = Some(bar.close);
                    st.trail_stop = 0.0;
                }
            }
            Err(err) => debug!(symbol = %env.symbol, %err, "volatility_regime entry rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn strategy() -> VolatilityRegimeStrategy {
        VolatilityRegimeStrategy::new(VolatilityRegimeConfig::default(), &RunPolicyConfig::new(NAME)).unwrap()
    }

    #[test]
    fn test_classify_regimes() {
        let stg = strategy();
        let atrs: VecDeque<f64> = vec![1.0; 10].into();
        assert_eq!(stg.classify(0.5, &atrs), VolatilityRegime::Compression);
        assert_eq!(stg.classify(1.0, &atrs), VolatilityRegime::Normal);
        assert_eq!(stg.classify(2.0, &atrs), VolatilityRegime::Expansion);
        assert_eq!(stg.classify(3.0, &atrs), VolatilityRegime::Extreme);
        assert_eq!(stg.classify(3.0, &VecDeque::new()), VolatilityRegime::Normal);
    }

    #[test]
    fn test_params_and_validation() {
        let mut params = BTreeMap::new();
        params.insert("ema_fast".to_string(), 5.0);
        params.insert("ema_slow".to_string(), 13.0);
        params.insert("stop_atr".to_string(), 2.0);
        let cfg = VolatilityRegimeConfig::from_params(&params);
        assert_eq!((cfg.ema_fast, cfg.ema_slow), (5, 13));
        assert_eq!(cfg.stop_atr_multiple, 2.0);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.warmup(), 35);

        params.insert("extreme_threshold".to_string(), 1.0);
        assert!(VolatilityRegimeConfig::from_params(&params).validate().is_err());
    }
}
