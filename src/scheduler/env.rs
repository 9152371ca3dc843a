//! Rolling bar window per (symbol, timeframe)

use std::collections::VecDeque;

use crate::errors::{ErrKind, Result, TradeError};
use crate::types::{tf_to_ms, Kline};

/// Default number of bars kept per environment.
pub const DEFAULT_BAR_CACHE: usize = 600;

#[derive(Debug, Clone)]
pub struct BarEnv {
    pub symbol: String,
    pub timeframe: String,
    pub tf_ms: i64,
    /// Exchange symbol id
    pub sid: i32,
    bars: VecDeque<Kline>,
    max_len: usize,
    /// Open time of the oldest cached bar
    pub time_start: i64,
    /// Close time of the newest bar
    pub time_stop: i64,
    /// Unfinished bar from a tick stream
    pub last_tick: Option<Kline>,
    pub bar_num: usize,
}

impl BarEnv {
    pub fn new(symbol: &str, timeframe: &str, sid: i32, max_len: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            tf_ms: tf_to_ms(timeframe),
            sid,
            bars: VecDeque::with_capacity(max_len.min(4096)),
            max_len: max_len.max(1),
            time_start: 0,
            time_stop: 0,
            last_tick: None,
            bar_num: 0,
        }
    }

    /// `symbol_timeframe`
    pub fn key(&self) -> String {
        env_key(&self.symbol, &self.timeframe)
    }

    /// Append a finished bar. Bars must arrive in ascending time order.
    pub fn push(&mut self, bar: Kline) -> Result<()> {
        if let Some(last) = self.bars.back() {
            if bar.time <= last.time {
                return Err(TradeError::new(
                    ErrKind::InvalidParam,
                    format!("{}: bar {} not after {}", self.key(), bar.time, last.time),
                ));
            }
        }
        if self.bars.len() == self.max_len {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
        self.last_tick = None;
        self.time_start = self.bars.front().map(|b| b.time).unwrap_or(bar.time);
        self.time_stop = bar.time + self.tf_ms;
        self.bar_num += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Kline> {
        self.bars.back()
    }

    pub fn close(&self) -> f64 {
        self.last().map(|b| b.close).unwrap_or(f64::NAN)
    }

    pub fn bars(&self) -> impl Iterator<Item = &Kline> {
        self.bars.iter()
    }

    /// The most recent `n` bars, oldest first
    pub fn tail(&self, n: usize) -> Vec<Kline> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).copied().collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn opens(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.open).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }

    /// Mean volume of the last `n` bars; 0 when none cached.
    pub fn avg_volume(&self, n: usize) -> f64 {
        let tail = self.tail(n);
        if tail.is_empty() {
            return 0.0;
        }
        tail.iter().map(|b| b.volume).sum::<f64>() / tail.len() as f64
    }
}

pub fn env_key(symbol: &str, timeframe: &str) -> String {
    format!("{}_{}", symbol, timeframe)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, close: f64, vol: f64) -> Kline {
        Kline::new(i * 3_600_000, close, close + 1.0, close - 1.0, close, vol)
    }

    #[test]
    fn test_window_bounded() {
        let mut env = BarEnv::new("BTC/USDT", "1h", 1, 3);
        for i in 0..5 {
            env.push(bar(i, 100.0 + i as f64, 1.0)).unwrap();
        }
        assert_eq!(env.len(), 3);
        assert_eq!(env.closes(), vec![102.0, 103.0, 104.0]);
        assert_eq!(env.time_start, 2 * 3_600_000);
        assert_eq!(env.time_stop, 5 * 3_600_000);
        assert_eq!(env.bar_num, 5);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let mut env = BarEnv::new("BTC/USDT", "1h", 1, 10);
        env.push(bar(2, 1.0, 1.0)).unwrap();
        assert!(env.push(bar(1, 1.0, 1.0)).is_err());
        assert!(env.push(bar(2, 1.0, 1.0)).is_err());
    }

    #[test]
    fn test_avg_volume() {
        let mut env = BarEnv::new("BTC/USDT", "1h", 1, 10);
        assert_eq!(env.avg_volume(5), 0.0);
        for (i, v) in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].iter().enumerate() {
            env.push(bar(i as i64, 10.0, *v)).unwrap();
        }
        assert_eq!(env.avg_volume(5), 4.0);
        assert_eq!(env.key(), "BTC/USDT_1h");
    }
}
