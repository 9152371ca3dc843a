//! Configuration management
//!
//! Loads the JSON run configuration: wallet, stake sizing, order limits,
//! run policies (which strategy runs on which pairs/timeframes) and
//! per-account overrides. `TRADE_ACCOUNT` overrides the default account.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::{ErrKind, TradeError};
use crate::scheduler::score::StratPerfConfig;
use crate::types::{parse_tf, Dirt, OrderType};

pub const DEFAULT_ACCOUNT: &str = "default";

/// What to do with an entry whose legal cost is under `min_stake_amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LowCostAction {
    /// Accept when cost is above 40% of the floor, raising it to 1.1x the floor
    #[default]
    KeepBig,
    /// Always raise to the floor
    KeepAll,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    #[default]
    Spot,
    Linear,
    Inverse,
}

impl MarketType {
    pub fn is_contract(&self) -> bool {
        !matches!(self, MarketType::Spot)
    }
}

/// Per-account overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub leverage: f64,
    /// 0 means no per-account cap
    pub max_pair: usize,
    pub max_open_orders: usize,
    pub stake_rate: f64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            leverage: 0.0,
            max_pair: 0,
            max_open_orders: 0,
            stake_rate: 1.0,
        }
    }
}

/// Periodic pair refresh during backtests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RefreshPairs {
    /// Refresh every N bars of the smallest timeframe; 0 disables
    pub interval_bars: i64,
    /// Pair lists taking effect from a given time, replacing `pairs`
    pub schedule: Vec<PairsFrom>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PairsFrom {
    /// Same formats as `time_start`
    pub from: String,
    pub pairs: Vec<String>,
}

/// One strategy instantiation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPolicyConfig {
    pub name: String,
    pub params: BTreeMap<String, f64>,
    /// Parameter overrides per pair
    pub pair_params: BTreeMap<String, BTreeMap<String, f64>>,
    pub pairs: Vec<String>,
    pub run_timeframes: Vec<String>,
    /// `long`, `short`, `any` or empty
    pub dirt: String,
    pub stake_rate: f64,
    pub order_bar_max: i64,
    #[serde(deserialize_with = "de_stop_loss")]
    pub stop_loss: Option<f64>,
    pub max_pair: usize,
    /// 0 means unlimited
    pub max_open: usize,
    pub max_simul_open: usize,
    pub filters: Vec<serde_json::Value>,
}

impl Default for RunPolicyConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            params: BTreeMap::new(),
            pair_params: BTreeMap::new(),
            pairs: Vec::new(),
            run_timeframes: Vec::new(),
            dirt: String::new(),
            stake_rate: 1.0,
            order_bar_max: 0,
            stop_loss: None,
            max_pair: 999,
            max_open: 0,
            max_simul_open: 0,
            filters: Vec::new(),
        }
    }
}

impl RunPolicyConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn dirt(&self) -> Dirt {
        match self.dirt.as_str() {
            "long" => Dirt::Long,
            "short" => Dirt::Short,
            _ => Dirt::Both,
        }
    }

    /// `name` or `name:long` / `name:short`
    pub fn id(&self) -> String {
        match self.dirt() {
            Dirt::Long => format!("{}:long", self.name),
            Dirt::Short => format!("{}:short", self.name),
            Dirt::Both => self.name.clone(),
        }
    }

    /// Parameters for one pair, overrides applied on top of the base set.
    pub fn params_for(&self, pair: &str) -> BTreeMap<String, f64> {
        let mut res = self.params.clone();
        if let Some(over) = self.pair_params.get(pair) {
            for (k, v) in over {
                res.insert(k.clone(), *v);
            }
        }
        res
    }
}

/// Parse a stop-loss value.
///
/// Accepts a float ratio, a numeric string, a percent string such as `"5%"`
/// or null. Integer zero is treated as a configuration mistake.
pub fn parse_stop_loss(val: &serde_json::Value) -> crate::errors::Result<Option<f64>> {
    use serde_json::Value;
    let bad = |msg: String| TradeError::new(ErrKind::BadConfig, msg);
    match val {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if n.is_i64() && n.as_i64() == Some(0) {
                return Err(bad("stop_loss must not be integer 0, omit it instead".into()));
            }
            let v = n.as_f64().ok_or_else(|| bad(format!("invalid stop_loss: {}", n)))?;
            if v == 0.0 {
                Ok(None)
            } else {
                Ok(Some(v))
            }
        }
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return Ok(None);
            }
            let (num, scale) = match text.strip_suffix('%') {
                Some(n) => (n.trim(), 0.01),
                None => (text, 1.0),
            };
            let v: f64 = num
                .parse()
                .map_err(|_| bad(format!("invalid stop_loss: {}", s)))?;
            Ok(Some(v * scale))
        }
        other => Err(bad(format!("invalid stop_loss: {}", other))),
    }
}

fn de_stop_loss<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    parse_stop_loss(&val).map_err(serde::de::Error::custom)
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    /// `prod` or `dry_run`
    pub env: String,
    pub leverage: f64,
    pub market_type: MarketType,
    pub contract_type: String,
    pub time_start: String,
    pub time_end: String,
    pub stake_currency: Vec<String>,
    pub fee_rate: f64,
    pub max_open_orders: usize,
    /// Max orders opened in one bar, 0 means unlimited
    pub max_simul_open: usize,
    pub order_bar_max: i64,
    /// Limit entries not filled within this many bars are cancelled, 0 disables
    pub stop_enter_bars: i64,
    pub order_type: OrderType,
    pub open_vol_rate: f64,
    pub low_cost_action: LowCostAction,
    pub min_stake_amount: f64,
    pub stake_amount: f64,
    pub stake_pct: f64,
    pub max_stake_amt: f64,
    pub margin_add_rate: f64,
    pub min_open_rate: f64,
    pub charge_on_bomb: bool,
    pub relay_sim_unfinish: bool,
    pub wallet_amounts: BTreeMap<String, f64>,
    pub draw_balance_over: f64,
    /// Minutes without new bars before a job's orders are exited, 0 disables
    pub close_on_stuck: i64,
    pub take_over_strategy: String,
    /// Job score grouping; job scores are disabled when absent
    pub strat_perf: Option<StratPerfConfig>,
    pub pairs: Vec<String>,
    pub refresh_pairs: RefreshPairs,
    pub put_limit_secs: i64,
    pub min_tf_score: f64,
    /// Simulated order latency in seconds for backtests
    pub bt_net_cost: f64,
    pub run_timeframes: Vec<String>,
    pub run_policy: Vec<RunPolicyConfig>,
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Interval minutes (as text keys) to max loss rate
    pub fatal_stop: BTreeMap<String, f64>,
    pub fatal_stop_hours: i64,
    pub default_account: String,
    pub data_dir: String,
    pub db_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "bot".to_string(),
            env: "dry_run".to_string(),
            leverage: 1.0,
            market_type: MarketType::Spot,
            contract_type: String::new(),
            time_start: String::new(),
            time_end: String::new(),
            stake_currency: vec!["USDT".to_string()],
            fee_rate: 0.001,
            max_open_orders: 30,
            max_simul_open: 0,
            order_bar_max: 500,
            stop_enter_bars: 0,
            order_type: OrderType::Market,
            open_vol_rate: 1.0,
            low_cost_action: LowCostAction::KeepBig,
            min_stake_amount: 10.0,
            stake_amount: 15.0,
            stake_pct: 0.0,
            max_stake_amt: 0.0,
            margin_add_rate: 0.66,
            min_open_rate: 0.5,
            charge_on_bomb: false,
            relay_sim_unfinish: false,
            wallet_amounts: BTreeMap::new(),
            draw_balance_over: 0.0,
            close_on_stuck: 20,
            take_over_strategy: String::new(),
            strat_perf: None,
            pairs: Vec::new(),
            refresh_pairs: RefreshPairs::default(),
            put_limit_secs: 120,
            min_tf_score: 0.8,
            bt_net_cost: 3.0,
            run_timeframes: Vec::new(),
            run_policy: Vec::new(),
            accounts: BTreeMap::new(),
            fatal_stop: BTreeMap::new(),
            fatal_stop_hours: 8,
            default_account: DEFAULT_ACCOUNT.to_string(),
            data_dir: "data".to_string(),
            db_path: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(text).context("Failed to parse config JSON")?;
        config.apply_env();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(acc) = std::env::var("TRADE_ACCOUNT") {
            if !acc.is_empty() {
                self.default_account = acc;
            }
        }
    }

    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.run_timeframes.is_empty() {
            return Err(TradeError::new(ErrKind::InvalidConfig, "run_timeframes is required"));
        }
        for tf in self.run_timeframes.iter() {
            parse_tf(tf)?;
        }
        for pol in self.run_policy.iter() {
            if pol.name.is_empty() {
                return Err(TradeError::new(ErrKind::InvalidConfig, "run_policy entry without name"));
            }
            for tf in pol.run_timeframes.iter() {
                parse_tf(tf)?;
            }
        }
        if self.market_type.is_contract() && self.leverage <= 0.0 {
            return Err(TradeError::new(ErrKind::InvalidConfig, "leverage must be > 0 for contracts"));
        }
        for key in self.fatal_stop.keys() {
            key.parse::<i64>().map_err(|_| {
                TradeError::new(ErrKind::BadConfig, format!("fatal_stop key must be minutes: {}", key))
            })?;
        }
        Ok(())
    }

    pub fn is_contract(&self) -> bool {
        self.market_type.is_contract()
    }

    pub fn is_prod(&self) -> bool {
        self.env == "prod"
    }

    /// Account names to trade; the default account when none configured
    pub fn account_names(&self) -> Vec<String> {
        if self.accounts.is_empty() {
            vec![self.default_account.clone()]
        } else {
            self.accounts.keys().cloned().collect()
        }
    }

    pub fn account(&self, name: &str) -> AccountConfig {
        self.accounts.get(name).cloned().unwrap_or_default()
    }

    /// Leverage for an account, falling back to the global value
    pub fn account_leverage(&self, name: &str) -> f64 {
        let acc = self.account(name);
        if acc.leverage > 0.0 {
            acc.leverage
        } else {
            self.leverage
        }
    }

    pub fn account_max_open_orders(&self, name: &str) -> usize {
        let acc = self.account(name);
        if acc.max_open_orders > 0 {
            acc.max_open_orders
        } else {
            self.max_open_orders
        }
    }

    /// Policy whose [`RunPolicyConfig::id`] matches
    pub fn policy(&self, id: &str) -> Option<&RunPolicyConfig> {
        self.run_policy.iter().find(|p| p.id() == id)
    }

    /// `(interval_minutes, max_loss_rate)` sorted by interval
    pub fn fatal_stops(&self) -> Vec<(i64, f64)> {
        let mut res: Vec<(i64, f64)> = self
            .fatal_stop
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|m| (m, *v)))
            .collect();
        res.sort_by_key(|(m, _)| *m);
        res
    }

    pub fn start_ms(&self) -> crate::errors::Result<i64> {
        parse_time_ms(&self.time_start)
    }

    /// Pairs in effect at `now_ms`: the latest schedule entry already
    /// started, else `pairs`.
    pub fn pairs_at(&self, now_ms: i64) -> crate::errors::Result<Vec<String>> {
        let mut best: Option<(i64, &Vec<String>)> = None;
        for item in self.refresh_pairs.schedule.iter() {
            let from = parse_time_ms(&item.from)?;
            if from > now_ms {
                continue;
            }
            if best.map(|(t, _)| from >= t).unwrap_or(true) {
                best = Some((from, &item.pairs));
            }
        }
        Ok(best.map(|(_, pairs)| pairs.clone()).unwrap_or_else(|| self.pairs.clone()))
    }

    pub fn end_ms(&self) -> crate::errors::Result<i64> {
        parse_time_ms(&self.time_end)
    }

    /// Fingerprint stored with each task
    pub fn config_hash(&self) -> String {
        let text = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

/// Parse `2024-01-01`, `20240101`, `2024-01-01 08:00:00` or a millisecond
/// timestamp. Empty text yields 0.
pub fn parse_time_ms(text: &str) -> crate::errors::Result<i64> {
    use chrono::{NaiveDate, NaiveDateTime};
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let bad = || TradeError::new(ErrKind::BadConfig, format!("invalid time: {}", text));
    if text.len() > 8 && text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse::<i64>().map_err(|_| bad());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y%m%d %H%M%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            let dt = d.and_hms_opt(0, 0, 0).ok_or_else(bad)?;
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(bad())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_loss_grammar() {
        assert_eq!(parse_stop_loss(&json!(0.05)).unwrap(), Some(0.05));
        assert_eq!(parse_stop_loss(&json!("0.05")).unwrap(), Some(0.05));
        assert_eq!(parse_stop_loss(&json!("5%")).unwrap(), Some(0.05));
        assert_eq!(parse_stop_loss(&json!(null)).unwrap(), None);
        let err = parse_stop_loss(&json!(0)).unwrap_err();
        assert_eq!(err.kind, ErrKind::BadConfig);
        assert!(parse_stop_loss(&json!("abc")).is_err());
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let cfg: Config = serde_json::from_value(json!({
            "run_timeframes": ["1h"],
            "wallet_amounts": {"USDT": 1000.0},
            "run_policy": [{"name": "sma_cross", "dirt": "long", "stop_loss": "5%"}]
        }))
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_open_orders, 30);
        assert_eq!(cfg.run_policy[0].id(), "sma_cross:long");
        assert_eq!(cfg.run_policy[0].stop_loss, Some(0.05));
        assert_eq!(cfg.run_policy[0].max_pair, 999);
    }

    #[test]
    fn test_missing_timeframes_is_invalid_config() {
        let cfg = Config::default();
        assert_eq!(cfg.validate().unwrap_err().kind, ErrKind::InvalidConfig);
    }

    #[test]
    fn test_integer_zero_stop_loss_rejected_on_load() {
        let res: std::result::Result<Config, _> = serde_json::from_value(json!({
            "run_timeframes": ["1h"],
            "run_policy": [{"name": "a", "stop_loss": 0}]
        }));
        assert!(res.is_err());
    }

    #[test]
    fn test_parse_time_ms() {
        assert_eq!(parse_time_ms("2024-01-01").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time_ms("20240101").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time_ms("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time_ms("").unwrap(), 0);
        assert!(parse_time_ms("yesterday").is_err());
    }

    #[test]
    fn test_pairs_at_follows_schedule() {
        let mut cfg = Config::default();
        cfg.pairs = vec!["BTC/USDT".into()];
        cfg.refresh_pairs.schedule = vec![
            PairsFrom {
                from: "2024-01-03".into(),
                pairs: vec!["SOL/USDT".into()],
            },
            PairsFrom {
                from: "2024-01-02".into(),
                pairs: vec!["BTC/USDT".into(), "ETH/USDT".into()],
            },
        ];
        let day = 86_400_000;
        let jan1 = parse_time_ms("2024-01-01").unwrap();
        assert_eq!(cfg.pairs_at(jan1).unwrap(), vec!["BTC/USDT".to_string()]);
        assert_eq!(cfg.pairs_at(jan1 + day).unwrap().len(), 2);
        assert_eq!(cfg.pairs_at(jan1 + 5 * day).unwrap(), vec!["SOL/USDT".to_string()]);
    }

    #[test]
    fn test_params_for_pair() {
        let mut pol = RunPolicyConfig::new("sma_cross");
        pol.params.insert("fast".into(), 5.0);
        let mut over = BTreeMap::new();
        over.insert("fast".to_string(), 8.0);
        pol.pair_params.insert("ETH/USDT".into(), over);
        assert_eq!(pol.params_for("ETH/USDT")["fast"], 8.0);
        assert_eq!(pol.params_for("BTC/USDT")["fast"], 5.0);
    }

    #[test]
    fn test_fatal_stops_sorted() {
        let mut cfg = Config::default();
        cfg.fatal_stop.insert("1440".into(), 0.1);
        cfg.fatal_stop.insert("60".into(), 0.05);
        assert_eq!(cfg.fatal_stops(), vec![(60, 0.05), (1440, 0.1)]);
    }
}
