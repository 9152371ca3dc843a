//! Account-level loss circuit breakers
//!
//! `fatal_stop` maps a look-back window in minutes to a maximum loss rate.
//! When the profit of orders entered inside a window adds up to a loss of
//! at least that rate, new entries of the account are blocked for
//! `fatal_stop_hours`.
//!
//! ```text
//! loss_rate = |sum_profit| / (|sum_profit| + total_legal)
//! ```

use tracing::error;

use crate::config::Config;
use crate::engine::Engine;
use crate::orders::InOutOrder;

/// Loss windows of one run
#[derive(Debug, Clone, Default)]
pub struct FatalStop {
    /// `(interval_minutes, max_loss_rate)`, shortest first
    stops: Vec<(i64, f64)>,
    block_ms: i64,
}

/// A breaker that fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FatalHit {
    pub interval_min: i64,
    pub loss_rate: f64,
    pub until_ms: i64,
}

impl FatalStop {
    pub fn from_config(cfg: &Config) -> Self {
        let hours = if cfg.fatal_stop_hours > 0 { cfg.fatal_stop_hours } else { 8 };
        Self {
            stops: cfg.fatal_stops(),
            block_ms: hours * 3_600_000,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Longest window, in minutes
    pub fn max_interval_min(&self) -> i64 {
        self.stops.iter().map(|(m, _)| *m).max().unwrap_or(0)
    }

    /// Check `account` against every window using its finished orders.
    /// Does nothing while entries are already blocked.
    pub fn check(&self, eng: &Engine, account: &str, closed: &[InOutOrder]) -> Option<FatalHit> {
        if self.stops.is_empty() {
            return None;
        }
        let acc = eng.account(account).ok()?;
        let now = eng.now_ms();
        if acc.no_enter_until() >= now {
            return None;
        }
        let total_legal = acc.lock_wallets().total_legal(None, false, &eng.ctx.prices);
        for (mins, max_rate) in self.stops.iter() {
            let loss_rate = calc_fatal_loss(closed, total_legal, now, *mins);
            if loss_rate >= *max_rate {
                let until_ms = now + self.block_ms;
                acc.set_no_enter_until(until_ms);
                error!(
                    account,
                    loss_pct = (loss_rate * 100.0) as i64,
                    interval_min = mins,
                    hours = self.block_ms / 3_600_000,
                    "loss limit reached, entries blocked"
                );
                return Some(FatalHit {
                    interval_min: *mins,
                    loss_rate,
                    until_ms,
                });
            }
        }
        None
    }
}

/// Loss share of the orders entered in the last `back_mins` minutes.
pub fn calc_fatal_loss(closed: &[InOutOrder], total_legal: f64, now_ms: i64, back_mins: i64) -> f64 {
    let min_ms = now_ms - back_mins * 60_000;
    let sum: f64 = closed
        .iter()
        .filter(|od| od.real_enter_ms() >= min_ms)
        .map(|od| od.profit)
        .sum();
    if sum >= 0.0 {
        return 0.0;
    }
    let loss = sum.abs();
    loss / (loss + total_legal.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecMode;
    use crate::exchange::SimExchange;
    use crate::runtime::Ctx;
    use crate::types::OrderType;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn closed(enter_at: i64, profit: f64) -> InOutOrder {
        let mut od = InOutOrder::new(1, "BTC/USDT", 1, "1h", "s", false, "t", enter_at, OrderType::Market);
        od.profit = profit;
        od
    }

    #[test]
    fn test_loss_rate_only_counts_window() {
        let ods = vec![closed(0, -500.0), closed(50 * 60_000, -100.0), closed(55 * 60_000, 20.0)];
        let now = 60 * 60_000;
        assert_relative_eq!(calc_fatal_loss(&ods, 920.0, now, 30), 80.0 / 1000.0);
        assert_eq!(calc_fatal_loss(&ods[2..], 920.0, now, 30), 0.0);
    }

    #[test]
    fn test_breaker_blocks_entries() {
        let mut cfg = Config::default();
        cfg.run_timeframes = vec!["1h".into()];
        cfg.wallet_amounts.insert("USDT".into(), 900.0);
        cfg.fatal_stop.insert("60".into(), 0.05);
        let cfg = Arc::new(cfg);
        let ctx = Ctx::backtest(cfg.clone(), Arc::new(SimExchange::default()), 120 * 60_000);
        let eng = Engine::new(Arc::new(ctx), ExecMode::Local);
        let fs = FatalStop::from_config(&cfg);
        assert_eq!(fs.max_interval_min(), 60);
        let ods = vec![closed(100 * 60_000, -100.0)];
        let hit = fs.check(&eng, "default", &ods).unwrap();
        assert_eq!(hit.interval_min, 60);
        assert_relative_eq!(hit.loss_rate, 0.1);
        assert_eq!(hit.until_ms, 120 * 60_000 + 8 * 3_600_000);
        assert_eq!(eng.account("default").unwrap().no_enter_until(), hit.until_ms);
        // already blocked
        assert!(fs.check(&eng, "default", &ods).is_none());
    }
}
