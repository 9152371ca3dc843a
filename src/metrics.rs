//! Backtest report
//!
//! Built once after cleanup from the finished orders and the equity curve:
//! totals, drawdowns, Sharpe/Sortino on daily returns and grouping tables
//! (pair, date, enter tag, exit tag, profit range).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::orders::InOutOrder;
use crate::types::fmt_ms;

/// Samples kept before the curve is thinned by [`PLOT_SHRINK`].
pub const MAX_PLOT_NUM: usize = 600;
pub const PLOT_SHRINK: usize = 5;

/// Profit-rate bucket edges for the range table.
const PROFIT_EDGES: [f64; 7] = [-0.1, -0.05, -0.02, 0.0, 0.02, 0.05, 0.1];

// =============================================================================
// Equity curve
// =============================================================================

/// One equity sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PlotPoint {
    pub time_ms: i64,
    /// Total legal value including unrealized profit and withdrawals
    pub real: f64,
    pub available: f64,
    pub profit: f64,
    pub unrealized_pol: f64,
    pub withdraw: f64,
    pub od_num: usize,
    pub job_num: usize,
}

/// Equity curve that thins itself to stay under `MAX_PLOT_NUM * PLOT_SHRINK` points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotData {
    pub points: Vec<PlotPoint>,
    /// Record one of every `step` offered samples
    step: usize,
    offered: usize,
}

impl Default for PlotData {
    fn default() -> Self {
        Self {
            points: Vec::new(),
            step: 1,
            offered: 0,
        }
    }
}

impl PlotData {
    pub fn add(&mut self, point: PlotPoint) {
        self.offered += 1;
        if self.offered % self.step != 0 {
            return;
        }
        self.points.push(point);
        if self.points.len() > MAX_PLOT_NUM * PLOT_SHRINK {
            self.points = self.points.iter().step_by(PLOT_SHRINK).copied().collect();
            self.step *= PLOT_SHRINK;
            self.offered = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Last sample of each UTC day
    pub fn daily(&self) -> Vec<PlotPoint> {
        let mut res: Vec<PlotPoint> = Vec::new();
        for p in self.points.iter() {
            let day = p.time_ms.div_euclid(86_400_000);
            match res.last_mut() {
                Some(last) if last.time_ms.div_euclid(86_400_000) == day => *last = *p,
                _ => res.push(*p),
            }
        }
        res
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Annualized Sharpe and Sortino of daily returns, population deviation.
pub fn sharpe_sortino(daily_values: &[f64]) -> (f64, f64) {
    if daily_values.len() < 3 {
        return (0.0, 0.0);
    }
    let returns: Vec<f64> = daily_values
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let ann = 365f64.sqrt();
    let mean = returns.iter().mean();
    let std = returns.iter().population_std_dev();
    let sharpe = if std > 0.0 { mean / std * ann } else { 0.0 };
    let down_dev = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64).sqrt();
    let sortino = if down_dev > 0.0 { mean / down_dev * ann } else { 0.0 };
    (sharpe, sortino)
}

/// Largest peak-to-trough fall as `(rate, value)`.
pub fn max_drawdown(values: &[f64]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let (mut rate, mut val) = (0.0f64, 0.0f64);
    for v in values.iter().copied() {
        peak = peak.max(v);
        if peak > 0.0 {
            rate = rate.max((peak - v) / peak);
        }
        val = val.max(peak - v);
    }
    (rate, val)
}

// =============================================================================
// Groupings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupRow {
    pub title: String,
    pub count: usize,
    pub wins: usize,
    pub profit_sum: f64,
    pub profit_pct_sum: f64,
    pub cost_sum: f64,
    pub hold_ms_avg: i64,
}

impl GroupRow {
    pub fn win_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.wins as f64 / self.count as f64
        }
    }
}

fn group_by<F>(ods: &[InOutOrder], key: F) -> Vec<GroupRow>
where
    F: Fn(&InOutOrder) -> String,
{
    let mut map: BTreeMap<String, (GroupRow, i64)> = BTreeMap::new();
    for od in ods {
        let title = key(od);
        let (row, hold) = map.entry(title.clone()).or_insert_with(|| {
            (
                GroupRow {
                    title,
                    ..Default::default()
                },
                0,
            )
        });
        row.count += 1;
        if od.profit > 0.0 {
            row.wins += 1;
        }
        row.profit_sum += od.profit;
        row.profit_pct_sum += od.profit_rate;
        row.cost_sum += od.enter_cost();
        *hold += (od.real_exit_ms() - od.real_enter_ms()).max(0);
    }
    map.into_values()
        .map(|(mut row, hold)| {
            row.hold_ms_avg = hold / row.count.max(1) as i64;
            row
        })
        .collect()
}

fn profit_range(rate: f64) -> String {
    let idx = PROFIT_EDGES.iter().position(|e| rate < *e).unwrap_or(PROFIT_EDGES.len());
    // leading index keeps the ranges sorted
    let lo = if idx == 0 { "-inf".to_string() } else { format!("{:.0}%", PROFIT_EDGES[idx - 1] * 100.0) };
    let hi = if idx == PROFIT_EDGES.len() {
        "+inf".to_string()
    } else {
        format!("{:.0}%", PROFIT_EDGES[idx] * 100.0)
    };
    format!("{} [{}, {})", idx, lo, hi)
}

fn day_of(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

// =============================================================================
// Result
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BtResult {
    pub start_ms: i64,
    pub end_ms: i64,
    pub bar_num: usize,
    pub order_num: usize,
    pub total_invest: f64,
    pub final_balance: f64,
    pub total_profit: f64,
    pub total_cost: f64,
    pub total_fee: f64,
    pub win_rate: f64,
    pub max_open_orders: usize,
    pub min_real: f64,
    pub max_real: f64,
    /// Drawdown of the equity curve
    pub max_drawdown: f64,
    pub max_drawdown_val: f64,
    /// Drawdown of initial balance plus cumulative order profit
    pub profit_drawdown: f64,
    pub profit_drawdown_val: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub fail_opens: BTreeMap<String, usize>,
    pub by_pair: Vec<GroupRow>,
    pub by_date: Vec<GroupRow>,
    pub by_enter_tag: Vec<GroupRow>,
    pub by_exit_tag: Vec<GroupRow>,
    pub by_profit_range: Vec<GroupRow>,
    pub plot: PlotData,
}

impl BtResult {
    /// Fill every derived field from the finished orders and the curve.
    pub fn calc(&mut self, ods: &[InOutOrder]) {
        self.order_num = ods.len();
        self.total_profit = ods.iter().map(|o| o.profit).sum();
        self.total_cost = ods.iter().map(|o| o.enter_cost()).sum();
        self.total_fee = ods
            .iter()
            .map(|o| o.enter.fee + o.exit.as_ref().map(|e| e.fee).unwrap_or(0.0))
            .sum();
        let wins = ods.iter().filter(|o| o.profit > 0.0).count();
        self.win_rate = if ods.is_empty() { 0.0 } else { wins as f64 / ods.len() as f64 };

        let reals: Vec<f64> = self.plot.points.iter().map(|p| p.real).collect();
        if let Some((lo, hi)) = reals.iter().copied().map(OrderedFloat).minmax().into_option() {
            self.min_real = lo.into_inner();
            self.max_real = hi.into_inner();
        }
        (self.max_drawdown, self.max_drawdown_val) = max_drawdown(&reals);

        let mut by_exit: Vec<&InOutOrder> = ods.iter().collect();
        by_exit.sort_by_key(|o| o.real_exit_ms());
        let mut cum = self.total_invest;
        let mut series = vec![cum];
        for od in by_exit {
            cum += od.profit;
            series.push(cum);
        }
        (self.profit_drawdown, self.profit_drawdown_val) = max_drawdown(&series);

        let daily: Vec<f64> = self.plot.daily().iter().map(|p| p.real).collect();
        (self.sharpe, self.sortino) = sharpe_sortino(&daily);

        self.by_pair = group_by(ods, |o| o.symbol.clone());
        self.by_date = group_by(ods, |o| day_of(o.real_enter_ms()));
        self.by_enter_tag = group_by(ods, |o| o.enter_tag.clone());
        self.by_exit_tag = group_by(ods, |o| o.exit_tag.clone());
        self.by_profit_range = group_by(ods, |o| profit_range(o.profit_rate));
    }

    /// Write `orders.csv` and `result.json` into `dir`.
    pub fn dump(&self, dir: impl AsRef<Path>, ods: &[InOutOrder]) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        let path = dir.join("orders.csv");
        let mut writer = csv::Writer::from_path(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        for od in ods {
            writer.serialize(OrderRow::from(od))?;
        }
        writer.flush()?;
        let path = dir.join("result.json");
        let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self).context("Failed to write result.json")?;
        info!(dir = %dir.display(), orders = ods.len(), "backtest report saved");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct OrderRow<'a> {
    id: i64,
    symbol: &'a str,
    timeframe: &'a str,
    strategy: &'a str,
    short: bool,
    enter_tag: &'a str,
    exit_tag: &'a str,
    enter_at: String,
    exit_at: String,
    enter_price: f64,
    exit_price: f64,
    amount: f64,
    leverage: f64,
    cost: f64,
    fee: f64,
    profit_rate: f64,
    profit: f64,
}

impl<'a> From<&'a InOutOrder> for OrderRow<'a> {
    fn from(od: &'a InOutOrder) -> Self {
        let exit = od.exit.as_ref();
        Self {
            id: od.id,
            symbol: &od.symbol,
            timeframe: &od.timeframe,
            strategy: &od.strategy,
            short: od.short,
            enter_tag: &od.enter_tag,
            exit_tag: &od.exit_tag,
            enter_at: fmt_ms(od.real_enter_ms()),
            exit_at: fmt_ms(od.real_exit_ms()),
            enter_price: od.enter.average,
            exit_price: exit.map(|e| e.average).unwrap_or(0.0),
            amount: od.enter.filled,
            leverage: od.leverage,
            cost: od.enter_cost(),
            fee: od.enter.fee + exit.map(|e| e.fee).unwrap_or(0.0),
            profit_rate: od.profit_rate,
            profit: od.profit,
        }
    }
}

fn write_groups(f: &mut fmt::Formatter<'_>, name: &str, rows: &[GroupRow]) -> fmt::Result {
    if rows.is_empty() {
        return Ok(());
    }
    writeln!(f, "\n{}", name)?;
    writeln!(f, "{}", "-".repeat(60))?;
    writeln!(f, "{:<24} {:>6} {:>7} {:>12} {:>8}", "Key", "Count", "Win%", "Profit", "Pft%")?;
    for row in rows {
        writeln!(
            f,
            "{:<24} {:>6} {:>6.1}% {:>12.2} {:>7.2}%",
            row.title,
            row.count,
            row.win_rate() * 100.0,
            row.profit_sum,
            row.profit_pct_sum * 100.0
        )?;
    }
    Ok(())
}

impl fmt::Display for BtResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "BACKTEST RESULTS")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Range:              {} - {}", fmt_ms(self.start_ms), fmt_ms(self.end_ms))?;
        writeln!(f, "Bars:               {}", self.bar_num)?;
        writeln!(f, "Total Invest:       {:.2}", self.total_invest)?;
        writeln!(f, "Final Balance:      {:.2}", self.final_balance)?;
        writeln!(f, "Total Profit:       {:.2}", self.total_profit)?;
        writeln!(f, "Total Cost:         {:.2}", self.total_cost)?;
        writeln!(f, "Total Fee:          {:.4}", self.total_fee)?;
        writeln!(f, "Orders:             {}", self.order_num)?;
        writeln!(f, "Win Rate:           {:.2}%", self.win_rate * 100.0)?;
        writeln!(f, "Max Open Orders:    {}", self.max_open_orders)?;
        writeln!(f, "Balance Range:      {:.2} - {:.2}", self.min_real, self.max_real)?;
        writeln!(f, "Max Drawdown:       {:.2}% ({:.2})", self.max_drawdown * 100.0, self.max_drawdown_val)?;
        writeln!(f, "Profit Drawdown:    {:.2}% ({:.2})", self.profit_drawdown * 100.0, self.profit_drawdown_val)?;
        writeln!(f, "Sharpe Ratio:       {:.2}", self.sharpe)?;
        writeln!(f, "Sortino Ratio:      {:.2}", self.sortino)?;
        if !self.fail_opens.is_empty() {
            writeln!(f, "\nRejected Entries")?;
            for (tag, num) in self.fail_opens.iter() {
                writeln!(f, "  {:<28} {}", tag, num)?;
            }
        }
        write_groups(f, "By Pair", &self.by_pair)?;
        write_groups(f, "By Enter Tag", &self.by_enter_tag)?;
        write_groups(f, "By Exit Tag", &self.by_exit_tag)?;
        write_groups(f, "By Profit Range", &self.by_profit_range)?;
        write_groups(f, "By Date", &self.by_date)?;
        write!(f, "{}", "=".repeat(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;
    use approx::assert_relative_eq;

    fn done(symbol: &str, tag: &str, profit: f64, rate: f64, at: i64) -> InOutOrder {
        let mut od = InOutOrder::new(1, symbol, 1, "1h", "s", false, "ent", at, OrderType::Market);
        od.enter.filled = 1.0;
        od.enter.average = 100.0;
        od.enter.update_at = at;
        od.set_exit(at + 3_600_000, tag, None, 0.0);
        if let Some(exit) = od.exit.as_mut() {
            exit.update_at = at + 3_600_000;
        }
        od.profit = profit;
        od.profit_rate = rate;
        od
    }

    #[test]
    fn test_plot_thins_itself() {
        let mut plot = PlotData::default();
        for i in 0..(MAX_PLOT_NUM * PLOT_SHRINK + 1) {
            plot.add(PlotPoint {
                time_ms: i as i64,
                ..Default::default()
            });
        }
        assert_eq!(plot.len(), MAX_PLOT_NUM + 1);
        assert_eq!(plot.points[1].time_ms, PLOT_SHRINK as i64);
        // after thinning only every fifth sample is kept
        for _ in 0..4 {
            plot.add(PlotPoint::default());
        }
        assert_eq!(plot.len(), MAX_PLOT_NUM + 1);
        plot.add(PlotPoint::default());
        assert_eq!(plot.len(), MAX_PLOT_NUM + 2);
    }

    #[test]
    fn test_drawdown() {
        let (rate, val) = max_drawdown(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert_relative_eq!(rate, 0.25);
        assert_relative_eq!(val, 30.0);
        assert_eq!(max_drawdown(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_sharpe_uses_population_std() {
        let vals = [100.0, 110.0, 99.0, 108.9];
        let (sharpe, sortino) = sharpe_sortino(&vals);
        // returns 0.1, -0.1, 0.1: mean 1/30, population std sqrt(0.08/9)
        let mean = 0.1 / 3.0;
        let std = (0.08f64 / 9.0).sqrt();
        assert_relative_eq!(sharpe, mean / std * 365f64.sqrt(), epsilon = 1e-9);
        let down = (0.01f64 / 3.0).sqrt();
        assert_relative_eq!(sortino, mean / down * 365f64.sqrt(), epsilon = 1e-9);
        assert_eq!(sharpe_sortino(&[1.0, 2.0]), (0.0, 0.0));
    }

    #[test]
    fn test_calc_groups_orders() {
        let ods = vec![
            done("BTC/USDT", "take_profit", 10.0, 0.1, 0),
            done("BTC/USDT", "stop_loss", -5.0, -0.05, 86_400_000),
            done("ETH/USDT", "take_profit", 3.0, 0.03, 86_400_000),
        ];
        let mut res = BtResult {
            total_invest: 1000.0,
            ..Default::default()
        };
        res.calc(&ods);
        assert_eq!(res.order_num, 3);
        assert_relative_eq!(res.total_profit, 8.0);
        assert_relative_eq!(res.win_rate, 2.0 / 3.0);
        assert_eq!(res.by_pair.len(), 2);
        assert_eq!(res.by_pair[0].count, 2);
        assert_eq!(res.by_date.len(), 2);
        assert_eq!(res.by_exit_tag.iter().find(|r| r.title == "take_profit").unwrap().wins, 2);
        assert_eq!(res.by_profit_range.len(), 3);
        assert_eq!(res.by_pair[0].hold_ms_avg, 3_600_000);
        assert_relative_eq!(res.profit_drawdown_val, 5.0);
    }
}
