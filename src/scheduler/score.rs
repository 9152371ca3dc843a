//! Per-job performance scores
//!
//! After each finished order the job's recent profit rates are summed and
//! all jobs of the same strategy are split into five groups by that sum
//! (log-scaled). Losing groups get a reduced stake multiplier and the
//! removed weight is handed to the winning groups.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lowest stake multiplier a job can get
pub const MIN_SCORE: f64 = 0.1;
/// Highest stake multiplier a job can get
pub const MAX_SCORE: f64 = 1.5;

/// Tuning of the job score grouping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratPerfConfig {
    /// Orders a job needs before it is scored (default: 5)
    #[serde(default = "default_min_od_num")]
    pub min_od_num: usize,

    /// Most recent orders considered per job (default: 30)
    #[serde(default = "default_max_od_num")]
    pub max_od_num: usize,

    /// Scored jobs a strategy needs before grouping starts (default: 7)
    #[serde(default = "default_min_job_num")]
    pub min_job_num: usize,

    /// Multiplier of the middle group (default: 0.7)
    #[serde(default = "default_mid_weight")]
    pub mid_weight: f64,

    /// Multiplier of the second-worst group (default: 0.3)
    #[serde(default = "default_bad_weight")]
    pub bad_weight: f64,
}

fn default_min_od_num() -> usize { 5 }
fn default_max_od_num() -> usize { 30 }
fn default_min_job_num() -> usize { 7 }
fn default_mid_weight() -> f64 { 0.7 }
fn default_bad_weight() -> f64 { 0.3 }

impl Default for StratPerfConfig {
    fn default() -> Self {
        Self {
            min_od_num: default_min_od_num(),
            max_od_num: default_max_od_num(),
            min_job_num: default_min_job_num(),
            mid_weight: default_mid_weight(),
            bad_weight: default_bad_weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPerf {
    pub num: usize,
    pub total_pft: f64,
    /// Stake multiplier
    pub score: f64,
}

impl Default for JobPerf {
    fn default() -> Self {
        Self {
            num: 0,
            total_pft: 0.0,
            score: 1.0,
        }
    }
}

impl JobPerf {
    pub fn get_amount(&self, amount: f64) -> f64 {
        amount * self.score
    }
}

/// Grouping state of one strategy across all its jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfStats {
    pub od_num: usize,
    /// `od_num` when the groups were last rebuilt
    pub last_gp_at: usize,
    /// Upper bounds of the four lower groups, in log space
    pub splits: Option<[f64; 4]>,
    /// Scale applied before the log transform
    pub delta: f64,
}

impl PerfStats {
    fn log2(&self, profit: f64) -> f64 {
        let val = (profit.abs() * self.delta + 1.0).log2();
        if profit < 0.0 {
            -val
        } else {
            val
        }
    }

    fn find_gid(&self, val: f64) -> usize {
        match &self.splits {
            Some(splits) => splits.iter().position(|s| val <= *s).unwrap_or(splits.len()),
            None => 2,
        }
    }
}

/// Scores of every job of an account plus per-strategy grouping state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfBook {
    pub perfs: HashMap<String, JobPerf>,
    pub stats: HashMap<String, PerfStats>,
}

/// `strategy_pair_tf`
pub fn perf_key(strategy: &str, pair: &str, tf: &str) -> String {
    format!("{}_{}_{}", strategy, pair, tf)
}

impl PerfBook {
    pub fn score(&self, strategy: &str, pair: &str, tf: &str) -> f64 {
        self.perfs
            .get(&perf_key(strategy, pair, tf))
            .map(|p| p.score)
            .unwrap_or(1.0)
    }

    /// Update the job after an order finished.
    ///
    /// `rates` are profit rates of the job's finished orders, oldest first.
    pub fn update_job(&mut self, cfg: &StratPerfConfig, strategy: &str, pair: &str, tf: &str, rates: &[f64]) {
        let sta = self.stats.entry(strategy.to_string()).or_default();
        sta.od_num += 1;
        if rates.len() < cfg.min_od_num {
            return;
        }
        let skip = rates.len().saturating_sub(cfg.max_od_num);
        let recent = &rates[skip..];
        let total: f64 = recent.iter().sum();
        let key = perf_key(strategy, pair, tf);
        let perf = self.perfs.entry(key.clone()).or_default();
        perf.num = recent.len();
        perf.total_pft = total;

        let prefix = format!("{}_", strategy);
        let keys: Vec<String> = self
            .perfs
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if keys.len() < cfg.min_job_num {
            return;
        }
        let mut sta = self.stats.remove(strategy).unwrap_or_default();
        if sta.splits.is_none() || sta.od_num - sta.last_gp_at >= keys.len() {
            self.regroup(cfg, &mut sta, &keys);
        } else {
            // groups still valid: copy the score of the nearest job
            let near = keys
                .iter()
                .filter(|k| **k != key)
                .filter_map(|k| self.perfs.get(k))
                .min_by(|a, b| (a.total_pft - total).abs().total_cmp(&(b.total_pft - total).abs()))
                .map(|p| p.score);
            if let (Some(score), Some(perf)) = (near, self.perfs.get_mut(&key)) {
                perf.score = score;
            }
        }
        self.stats.insert(strategy.to_string(), sta);
    }

    fn regroup(&mut self, cfg: &StratPerfConfig, sta: &mut PerfStats, keys: &[String]) {
        let profits: Vec<f64> = keys
            .iter()
            .map(|k| self.perfs.get(k).map(|p| p.total_pft).unwrap_or(0.0))
            .collect();
        let abs_avg = profits.iter().map(|p| p.abs()).sum::<f64>() / profits.len() as f64;
        sta.delta = if abs_avg > 0.0 { 9.0 / abs_avg } else { 1.0 };
        let logs: Vec<f64> = profits.iter().map(|p| sta.log2(*p)).collect();
        let mut sorted = logs.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let mut splits = [0.0; 4];
        for (i, split) in splits.iter_mut().enumerate() {
            let end = ((i + 1) * n / 5).max(1);
            *split = sorted[end - 1];
        }
        sta.splits = Some(splits);
        sta.last_gp_at = sta.od_num;

        let gids: Vec<usize> = logs.iter().map(|v| sta.find_gid(*v)).collect();
        let (mut total_add, mut good, mut best) = (0.0, 0usize, 0usize);
        for (key, gid) in keys.iter().zip(gids.iter()) {
            let score = match gid {
                0 => MIN_SCORE,
                1 => cfg.bad_weight,
                2 => cfg.mid_weight,
                3 => {
                    good += 1;
                    1.0
                }
                _ => {
                    best += 1;
                    1.0
                }
            };
            if *gid < 3 {
                total_add += 1.0 - score;
            }
            if let Some(p) = self.perfs.get_mut(key) {
                p.score = score;
            }
        }
        let weight = good as f64 + best as f64 * 2.0;
        if total_add > 0.0 && weight > 0.0 {
            let unit = total_add / weight;
            for (key, gid) in keys.iter().zip(gids.iter()) {
                if *gid < 3 {
                    continue;
                }
                if let Some(p) = self.perfs.get_mut(key) {
                    p.score = (p.score + unit * (*gid as f64 - 2.0)).min(MAX_SCORE);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_few_orders_keeps_default() {
        let mut book = PerfBook::default();
        let cfg = StratPerfConfig::default();
        book.update_job(&cfg, "s", "BTC/USDT", "1h", &[0.1, 0.2]);
        assert_eq!(book.score("s", "BTC/USDT", "1h"), 1.0);
        assert_eq!(book.stats["s"].od_num, 1);
    }

    #[test]
    fn test_grouping_rewards_winners() {
        let mut book = PerfBook::default();
        let cfg = StratPerfConfig {
            min_od_num: 1,
            min_job_num: 5,
            ..Default::default()
        };
        let pairs = ["A/USDT", "B/USDT", "C/USDT", "D/USDT", "E/USDT"];
        let pfts = [-0.5, -0.1, 0.0, 0.2, 0.6];
        for (pair, pft) in pairs.iter().zip(pfts.iter()) {
            book.update_job(&cfg, "s", pair, "1h", &[*pft]);
        }
        let worst = book.score("s", "A/USDT", "1h");
        let best = book.score("s", "E/USDT", "1h");
        assert!(worst >= MIN_SCORE && worst < 1.0);
        assert!(best > 1.0 && best <= MAX_SCORE);
        for pair in pairs.iter() {
            let s = book.score("s", pair, "1h");
            assert!((MIN_SCORE..=MAX_SCORE).contains(&s));
        }
    }
}
