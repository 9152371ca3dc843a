//! SMA Cross Strategy Implementation

use ta::indicators::SimpleMovingAverage;
use ta::Next;
use tracing::debug;

use super::config::SmaCrossConfig;
use super::NAME;
use crate::config::RunPolicyConfig;
use crate::errors::{ErrKind, Result, TradeError};
use crate::scheduler::env::BarEnv;
use crate::scheduler::job::StratJob;
use crate::strategies::{EnterReq, ExitReq, Strategy};
use crate::types::Dirt;

/// Per-job indicator state
#[derive(Debug, Clone)]
struct SmaState {
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    prev_diff: Option<f64>,
    seen: usize,
}

#[derive(Debug, Clone)]
pub struct SmaCrossStrategy {
    config: SmaCrossConfig,
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    run_timeframes: Vec<String>,
    stake_rate: f64,
    order_bar_max: i64,
}

impl SmaCrossStrategy {
    pub fn new(config: SmaCrossConfig, pol: &RunPolicyConfig) -> Result<Self> {
        let sma = |period: usize| {
            SimpleMovingAverage::new(period)
                .map_err(|e| TradeError::new(ErrKind::BadConfig, format!("sma({}): {:?}", period, e)))
        };
        Ok(Self {
            fast: sma(config.fast_period)?,
            slow: sma(config.slow_period)?,
            config,
            run_timeframes: pol.run_timeframes.clone(),
            stake_rate: pol.stake_rate,
            order_bar_max: pol.order_bar_max,
        })
    }

    pub fn config(&self) -> &SmaCrossConfig {
        &self.config
    }

    fn enter_req(&self, short: bool, close: f64) -> EnterReq {
        let mut req = if short { EnterReq::short("cross") } else { EnterReq::long("cross") };
        if self.config.limit_offset > 0.0 {
            let dirt = if short { 1.0 } else { -1.0 };
            req = req.with_limit(close * (1.0 + dirt * self.config.limit_offset));
        }
        req
    }
}

impl Strategy for SmaCrossStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn warmup_num(&self) -> usize {
        self.config.slow_period + 1
    }

    fn stake_rate(&self) -> f64 {
        self.stake_rate
    }

    fn order_bar_max(&self) -> i64 {
        self.order_bar_max
    }

    fn stop_loss(&self) -> Option<f64> {
        if self.config.stop_loss_pct > 0.0 {
            Some(self.config.stop_loss_pct)
        } else {
            None
        }
    }

    fn each_max_short(&self) -> i32 {
        if self.config.allow_short {
            1
        } else {
            -1
        }
    }

    fn each_max_long(&self) -> i32 {
        1
    }

    fn run_timeframes(&self) -> Vec<String> {
        self.run_timeframes.clone()
    }

    fn on_bar(&self, job: &mut StratJob, env: &BarEnv) {
        let close = env.close();
        if !close.is_finite() {
            return;
        }
        let slow_period = self.config.slow_period;
        let (prev, diff) = {
            let Some(st) = job.state_or_insert_with(|| SmaState {
                fast: self.fast.clone(),
                slow: self.slow.clone(),
                prev_diff: None,
                seen: 0,
            }) else {
                return;
            };
            let diff = st.fast.next(close) - st.slow.next(close);
            st.seen += 1;
            let prev = st.prev_diff.replace(diff);
            if st.seen < slow_period {
                return;
            }
            (prev, diff)
        };
        let Some(prev) = prev else {
            return;
        };
        let golden = prev <= 0.0 && diff > 0.0;
        let death = prev >= 0.0 && diff < 0.0;
        if golden {
            if !job.short_ods.is_empty() {
                let _ = job.close_orders(ExitReq::new("cross").with_dirt(Dirt::Short));
            }
            if job.long_ods.is_empty() {
                if let Err(err) = job.open_order(self.enter_req(false, close)) {
                    debug!(symbol = %env.symbol, %err, "sma_cross long rejected");
                }
            }
        } else if death {
            if !job.long_ods.is_empty() {
                let _ = job.close_orders(ExitReq::new("cross").with_dirt(Dirt::Long));
            }
            if self.config.allow_short && job.short_ods.is_empty() {
                if let Err(err) = job.open_order(self.enter_req(true, close)) {
                    debug!(symbol = %env.symbol, %err, "sma_cross short rejected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_params() {
        let mut params = BTreeMap::new();
        params.insert("fast".to_string(), 3.0);
        params.insert("slow".to_string(), 8.4);
        params.insert("allow_short".to_string(), 1.0);
        let cfg = SmaCrossConfig::from_params(&params);
        assert_eq!(cfg.fast_period, 3);
        assert_eq!(cfg.slow_period, 8);
        assert!(cfg.allow_short);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_periods() {
        let mut params = BTreeMap::new();
        params.insert("fast".to_string(), 30.0);
        let cfg = SmaCrossConfig::from_params(&params);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_limit_entry_offset() {
        let cfg = SmaCrossConfig {
            limit_offset: 0.01,
            ..Default::default()
        };
        let stg = SmaCrossStrategy::new(cfg, &RunPolicyConfig::new(NAME)).unwrap();
        let req = stg.enter_req(false, 100.0);
        assert!((req.limit - 99.0).abs() < 1e-9);
        let req = stg.enter_req(true, 100.0);
        assert!((req.limit - 101.0).abs() < 1e-9);
        assert_eq!(stg.warmup_num(), 21);
    }
}
