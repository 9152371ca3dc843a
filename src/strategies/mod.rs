//! Trading Strategies Module
//!
//! - [`Strategy`]: lifecycle hooks every strategy may implement; only
//!   `name` and `on_bar` are mandatory
//! - [`EnterReq`] / [`ExitReq`]: intents a strategy pushes onto its job
//! - A dynamic registry mapping policy names to factories

pub mod sma_cross;
pub mod volatility_regime;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, RwLock};

use crate::config::RunPolicyConfig;
use crate::engine::OdChange;
use crate::errors::{ErrKind, Result, TradeError};
use crate::orders::InOutOrder;
use crate::scheduler::env::BarEnv;
use crate::scheduler::job::StratJob;
use crate::types::{tf_to_secs, Dirt, OrderType, Side};

/// Symbol placeholder in [`PairSub`] meaning "the job's own pair".
pub const CUR_PAIR: &str = "_cur_";

// =============================================================================
// Requests
// =============================================================================

/// Request to open a position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterReq {
    /// Entry tag, required
    pub tag: String,
    /// Filled in by the job
    pub strat_name: String,
    pub short: bool,
    /// `None` uses the configured default
    pub order_type: Option<OrderType>,
    /// Limit price, 0 for market
    pub limit: f64,
    /// Multiplier on the stake amount, 0 means 1
    pub cost_rate: f64,
    /// Stake in legal currency, computed by the job when 0
    pub legal_cost: f64,
    pub leverage: f64,
    /// Base amount, derived from `legal_cost` when 0
    pub amount: f64,
    /// Bars a limit entry may wait, 0 uses the default
    pub stop_bars: i64,
    pub client_id: String,
    pub infos: BTreeMap<String, serde_json::Value>,
    pub stop_loss: f64,
    pub sl_limit: f64,
    /// Stop distance in price units from the entry
    pub stop_loss_val: f64,
    pub stop_loss_rate: f64,
    pub stop_loss_tag: String,
    pub take_profit: f64,
    pub tp_limit: f64,
    pub take_profit_val: f64,
    pub take_profit_rate: f64,
    pub take_profit_tag: String,
    pub log: bool,
}

impl EnterReq {
    pub fn long(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn short(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            short: true,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, price: f64) -> Self {
        self.limit = price;
        self
    }

    pub fn with_cost(mut self, legal_cost: f64) -> Self {
        self.legal_cost = legal_cost;
        self
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_stop_loss(mut self, price: f64, limit: f64) -> Self {
        self.stop_loss = price;
        self.sl_limit = limit;
        self
    }

    pub fn with_take_profit(mut self, price: f64, limit: f64) -> Self {
        self.take_profit = price;
        self.tp_limit = limit;
        self
    }

    pub fn with_stop_bars(mut self, bars: i64) -> Self {
        self.stop_bars = bars;
        self
    }

    pub fn side(&self) -> Side {
        if self.short {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

/// Request to close positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitReq {
    pub tag: String,
    /// Restrict to one strategy (policy id); filled in by the job
    pub strat_name: String,
    /// Exit only this order when > 0
    pub order_id: i64,
    pub enter_tag: String,
    pub dirt: Dirt,
    pub order_type: Option<OrderType>,
    /// Limit price; beyond the market in the profit direction it becomes a take-profit
    pub limit: f64,
    /// Fraction of holdings to exit, 0 means all
    pub exit_rate: f64,
    /// Base amount to exit, overrides `exit_rate`
    pub amount: f64,
    pub unfill_only: bool,
    pub filled_only: bool,
    /// Skip the `can_close` age check
    pub force: bool,
    pub log: bool,
}

impl Default for ExitReq {
    fn default() -> Self {
        Self {
            tag: String::new(),
            strat_name: String::new(),
            order_id: 0,
            enter_tag: String::new(),
            dirt: Dirt::Both,
            order_type: None,
            limit: 0.0,
            exit_rate: 0.0,
            amount: 0.0,
            unfill_only: false,
            filled_only: false,
            force: false,
            log: false,
        }
    }
}

impl ExitReq {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn with_dirt(mut self, dirt: Dirt) -> Self {
        self.dirt = dirt;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.exit_rate = rate;
        self
    }

    pub fn with_limit(mut self, price: f64) -> Self {
        self.limit = price;
        self
    }

    pub fn with_order(mut self, order_id: i64) -> Self {
        self.order_id = order_id;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Extra stream a job subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSub {
    /// Pair or [`CUR_PAIR`]
    pub symbol: String,
    pub timeframe: String,
    pub warmup: usize,
}

/// Quality score of one timeframe for a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfScore {
    pub timeframe: String,
    pub score: f64,
}

/// Public trade from a tick stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub amount: f64,
    pub side: Side,
    pub time: i64,
}

// =============================================================================
// Helpers
// =============================================================================

/// Share of the maximum favourable move given back before a drawdown exit.
///
/// `max_chg` is the best price change since entry as a fraction of the
/// entry price; returns 0 when the drawdown exit is not active yet.
pub fn calc_drawdown_exit_rate(max_chg: f64) -> f64 {
    if max_chg > 0.1 {
        0.15
    } else if max_chg > 0.04 {
        0.17
    } else if max_chg > 0.025 {
        0.25
    } else if max_chg > 0.015 {
        0.37
    } else if max_chg > 0.007 {
        0.5
    } else {
        0.0
    }
}

/// First timeframe, smallest first, whose score reaches `min_score`.
///
/// Sub-minute timeframes always score 1.
pub fn default_pick_timeframe(min_score: f64, allowed: &[String], scores: &[TfScore]) -> Option<String> {
    let mut rows: Vec<&TfScore> = scores
        .iter()
        .filter(|s| allowed.is_empty() || allowed.contains(&s.timeframe))
        .collect();
    rows.sort_by_key(|s| tf_to_secs(&s.timeframe));
    rows.into_iter()
        .find(|s| tf_to_secs(&s.timeframe) < 60 || s.score >= min_score)
        .map(|s| s.timeframe.clone())
}

// =============================================================================
// Strategy Trait
// =============================================================================

/// Trading strategy.
///
/// Strategies are shared by every job of a policy and must keep per-pair
/// state in [`StratJob::more`]. Hooks must not block.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> i32 {
        1
    }

    /// Bars replayed before signals count
    fn warmup_num(&self) -> usize {
        0
    }

    /// 0 uses the configured `min_tf_score`
    fn min_tf_score(&self) -> f64 {
        0.0
    }

    fn watch_book(&self) -> bool {
        false
    }

    /// 0 uses the policy or global value
    fn order_bar_max(&self) -> i64 {
        0
    }

    /// 0 uses the policy value
    fn stake_rate(&self) -> f64 {
        0.0
    }

    /// Default stop distance as a ratio of the entry price
    fn stop_loss(&self) -> Option<f64> {
        None
    }

    /// 0 uses the configured `stop_enter_bars`
    fn stop_enter_bars(&self) -> i64 {
        0
    }

    /// Enable the built-in trailing exit driven by [`Strategy::get_drawdown_exit_rate`]
    fn draw_down_exit(&self) -> bool {
        false
    }

    /// Hold requests until every pair of the timeframe produced its bar
    fn batch_in_out(&self) -> bool {
        false
    }

    fn batch_info(&self) -> bool {
        false
    }

    /// Max open longs per job, 0 unlimited, -1 forbidden
    fn each_max_long(&self) -> i32 {
        0
    }

    fn each_max_short(&self) -> i32 {
        0
    }

    fn run_timeframes(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_startup(&self) {}

    /// Extra streams needed by a job
    fn on_pair_infos(&self, _job: &StratJob) -> Vec<PairSub> {
        Vec::new()
    }

    fn on_bar(&self, job: &mut StratJob, env: &BarEnv);

    fn on_info_bar(&self, _job: &mut StratJob, _env: &BarEnv, _pair: &str, _tf: &str) {}

    fn on_trades(&self, _job: &mut StratJob, _trades: &[Trade]) {}

    /// All jobs of one timeframe, account and strategy after a bar
    fn on_batch_jobs(&self, _jobs: &mut [&mut StratJob]) {}

    fn on_batch_infos(&self, _tf: &str, _jobs: &mut [&mut StratJob]) {}

    /// Custom exit check for each open order of the job
    fn on_check_exit(&self, _job: &mut StratJob, _od: &InOutOrder) -> Option<ExitReq> {
        None
    }

    fn on_order_change(&self, _job: &mut StratJob, _od: &InOutOrder, _kind: OdChange) {}

    fn get_drawdown_exit_rate(&self, _job: &StratJob, _od: &InOutOrder, max_chg: f64) -> f64 {
        calc_drawdown_exit_rate(max_chg)
    }

    fn pick_timeframe(&self, min_score: f64, allowed: &[String], scores: &[TfScore]) -> Option<String> {
        default_pick_timeframe(min_score, allowed, scores)
    }

    fn on_shutdown(&self, _job: &mut StratJob) {}
}

// =============================================================================
// Strategy Registry
// =============================================================================

/// Builds a strategy for a policy with the pair's merged parameters.
pub type StrategyFactory =
    Arc<dyn Fn(&RunPolicyConfig, &BTreeMap<String, f64>) -> Result<Arc<dyn Strategy>> + Send + Sync>;

static REGISTRY: OnceLock<RwLock<HashMap<String, StrategyFactory>>> = OnceLock::new();

fn get_registry() -> &'static RwLock<HashMap<String, StrategyFactory>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, StrategyFactory> = HashMap::new();
        map.insert(sma_cross::NAME.to_string(), Arc::new(sma_cross::create));
        map.insert(volatility_regime::NAME.to_string(), Arc::new(volatility_regime::create));
        RwLock::new(map)
    })
}

/// Instantiate the strategy of a policy for one pair.
pub fn create_strategy(pol: &RunPolicyConfig, pair: &str) -> Result<Arc<dyn Strategy>> {
    let factory = {
        let registry = get_registry().read().unwrap_or_else(|e| e.into_inner());
        registry.get(pol.name.as_str()).cloned()
    };
    let factory = factory.ok_or_else(|| {
        TradeError::new(
            ErrKind::BadConfig,
            format!(
                "unknown strategy: '{}'. Available: {}",
                pol.name,
                available_strategies().join(", ")
            ),
        )
    })?;
    factory(pol, &pol.params_for(pair))
}

/// Registered strategy names, sorted
pub fn available_strategies() -> Vec<String> {
    let mut names: Vec<String> = get_registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Register a strategy factory (plugins and tests)
pub fn register_strategy<F>(name: &str, factory: F)
where
    F: Fn(&RunPolicyConfig, &BTreeMap<String, f64>) -> Result<Arc<dyn Strategy>> + Send + Sync + 'static,
{
    get_registry()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.to_string(), Arc::new(factory));
}
