//! Core data types used across the trading core

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ErrKind, Result, TradeError};

/// Smallest amount treated as a real fill.
pub const AMT_DUST: f64 = 1e-8;
/// Simulated network latency applied to market fills in backtests.
pub const NET_COST_SECS: f64 = 3.0;
/// Delay after the latest bar before batch jobs are flushed in live mode.
pub const DELAY_BATCH_MS: i64 = 3000;
/// Per-order lock holding time above which a warning is logged.
pub const LOCK_WARN_SECS: u64 = 5;

/// OHLCV bar. `time` is the bar open time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Kline {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Auxiliary channel such as open interest or turnover
    #[serde(default)]
    pub info: f64,
}

impl Kline {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            info: 0.0,
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.open <= self.close
    }

    /// Reject bars the simulator cannot reason about.
    pub fn validate(&self) -> Result<()> {
        let vals = [self.open, self.high, self.low, self.close, self.volume];
        if vals.iter().any(|v| !v.is_finite()) {
            return Err(TradeError::new(
                ErrKind::InvalidParam,
                format!("bar at {} has NaN/Inf fields", self.time),
            ));
        }
        if self.high < self.low {
            return Err(TradeError::new(
                ErrKind::InvalidParam,
                format!("bar at {}: high {} < low {}", self.time, self.high, self.low),
            ));
        }
        Ok(())
    }
}

impl ta::High for Kline {
    fn high(&self) -> f64 {
        self.high
    }
}

impl ta::Low for Kline {
    fn low(&self) -> f64 {
        self.low
    }
}

impl ta::Close for Kline {
    fn close(&self) -> f64 {
        self.close
    }
}

/// A bar tagged with the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairBar {
    pub symbol: String,
    pub timeframe: String,
    pub bar: Kline,
    pub is_warmup: bool,
}

/// Exchange symbol record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExSymbol {
    pub id: i32,
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub list_ms: i64,
    pub delist_ms: i64,
}

impl ExSymbol {
    pub fn new(id: i32, exchange: &str, market: &str, symbol: &str) -> Self {
        Self {
            id,
            exchange: exchange.to_string(),
            market: market.to_string(),
            symbol: symbol.to_string(),
            list_ms: 0,
            delist_ms: 0,
        }
    }

    pub fn parts(&self) -> SymbolParts {
        split_symbol(&self.symbol)
    }
}

/// Pieces of a symbol such as `BTC/USDT:USDT-240628`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolParts {
    pub base: String,
    pub quote: String,
    /// Settle coin, falls back to quote for spot symbols
    pub settle: String,
    pub ident: String,
}

/// Split a symbol on `/`, `:` and `-`.
pub fn split_symbol(symbol: &str) -> SymbolParts {
    let (pair, settle_part) = match symbol.split_once(':') {
        Some((p, s)) => (p, Some(s)),
        None => (symbol, None),
    };
    let (base, rest) = match pair.split_once('/') {
        Some((b, q)) => (b, q),
        None => (pair, ""),
    };
    let (mut quote, mut ident) = (rest.to_string(), String::new());
    let mut settle = String::new();
    match settle_part {
        Some(s) => {
            let (st, id) = match s.split_once('-') {
                Some((a, b)) => (a, b),
                None => (s, ""),
            };
            settle = st.to_string();
            ident = id.to_string();
        }
        None => {
            if let Some((q, id)) = rest.split_once('-') {
                quote = q.to_string();
                ident = id.to_string();
            }
        }
    }
    if settle.is_empty() {
        settle = quote.clone();
    }
    SymbolParts {
        base: base.to_string(),
        quote,
        settle,
        ident,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(text: &str) -> Result<Side> {
        match text {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(TradeError::param(format!("invalid side: {}", text))),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }

    pub fn parse(text: &str) -> Result<OrderType> {
        match text {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            _ => Err(TradeError::param(format!("invalid order type: {}", text))),
        }
    }

    pub fn is_limit(&self) -> bool {
        matches!(self, OrderType::Limit)
    }
}

/// Position direction filter. Numeric values match the sign of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dirt {
    Short = -1,
    #[default]
    Both = 0,
    Long = 1,
}

impl Dirt {
    pub fn sign(&self) -> f64 {
        *self as i32 as f64
    }

    pub fn of(short: bool) -> Dirt {
        if short {
            Dirt::Short
        } else {
            Dirt::Long
        }
    }

    pub fn matches(&self, short: bool) -> bool {
        match self {
            Dirt::Both => true,
            Dirt::Short => short,
            Dirt::Long => !short,
        }
    }
}

/// Exit reasons recorded on orders.
pub mod exit_tag {
    pub const UNKNOWN: &str = "unknown";
    pub const CANCEL: &str = "cancel";
    pub const BOT_STOP: &str = "bot_stop";
    pub const FORCE_EXIT: &str = "force_exit";
    pub const USER_EXIT: &str = "user_exit";
    pub const THIRD: &str = "third";
    pub const FATAL_ERR: &str = "fatal_err";
    pub const PAIR_DEL: &str = "pair_del";
    pub const STOP_LOSS: &str = "stop_loss";
    pub const SL_TAKE: &str = "sl_take";
    pub const TAKE_PROFIT: &str = "take_profit";
    pub const DRAW_DOWN: &str = "draw_down";
    pub const DATA_STUCK: &str = "data_stuck";
    pub const LIQUIDATION: &str = "liquidation";
    pub const ENV_END: &str = "env_end";
    pub const ENT_EXP: &str = "ent_exp";
    pub const EXIT_DELAY: &str = "exit_delay";
}

/// Status message attached when a limit entry times out.
pub const MSG_STOP_ENTER_BARS: &str = "reach StopEnterBars";

/// Parse a timeframe such as `1m`, `15m`, `1h`, `1d`, `1w` or `30s` into seconds.
pub fn parse_tf(tf: &str) -> Result<i64> {
    if tf == "ws" {
        return Ok(5);
    }
    if tf.len() < 2 {
        return Err(TradeError::new(ErrKind::BadConfig, format!("invalid timeframe: {}", tf)));
    }
    let (num, unit) = tf.split_at(tf.len() - 1);
    let num: i64 = num
        .parse()
        .map_err(|_| TradeError::new(ErrKind::BadConfig, format!("invalid timeframe: {}", tf)))?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        "M" => 2592000,
        _ => {
            return Err(TradeError::new(
                ErrKind::BadConfig,
                format!("invalid timeframe unit: {}", tf),
            ))
        }
    };
    if num <= 0 {
        return Err(TradeError::new(ErrKind::BadConfig, format!("invalid timeframe: {}", tf)));
    }
    Ok(num * unit_secs)
}

/// Timeframe in seconds; 0 for unparsable values (config validation rejects those).
pub fn tf_to_secs(tf: &str) -> i64 {
    parse_tf(tf).unwrap_or(0)
}

pub fn tf_to_ms(tf: &str) -> i64 {
    tf_to_secs(tf) * 1000
}

/// Floor a timestamp to the start of its timeframe bucket.
pub fn align_tf_ms(ms: i64, tf_ms: i64) -> i64 {
    if tf_ms <= 0 {
        return ms;
    }
    ms.div_euclid(tf_ms) * tf_ms
}

/// Replace NaN and infinities before persisting.
pub fn nan_inf_to(val: f64, def: f64) -> f64 {
    if val.is_finite() {
        val
    } else {
        def
    }
}

/// Float equality within a relative tolerance.
pub fn equal_nearly(a: f64, b: f64) -> bool {
    let diff = (a - b).abs();
    diff <= 1e-9 || diff <= 1e-9 * a.abs().max(b.abs())
}

/// Stable coins priced at 1 in legal value.
pub fn is_stable_coin(code: &str) -> bool {
    matches!(code, "USDT" | "USD" | "USDC" | "BUSD" | "TUSD" | "FDUSD" | "DAI")
}

pub fn fmt_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}
