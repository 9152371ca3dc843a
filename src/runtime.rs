//! Per-run context: synthetic clock, price cache and run mode

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::exchange::{BookTicker, Exchange};
use crate::types::{is_stable_coin, split_symbol, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    Backtest,
    Live,
    /// Tooling runs that never trade
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEnv {
    Prod,
    DryRun,
}

/// Millisecond clock. Backtests drive it bar by bar; live runs read the
/// wall clock unless a value has been pinned.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    ms: Arc<AtomicI64>,
    real: bool,
}

impl Clock {
    pub fn simulated(start_ms: i64) -> Self {
        Self {
            ms: Arc::new(AtomicI64::new(start_ms)),
            real: false,
        }
    }

    pub fn real() -> Self {
        Self {
            ms: Arc::new(AtomicI64::new(0)),
            real: true,
        }
    }

    pub fn now_ms(&self) -> i64 {
        let v = self.ms.load(Ordering::SeqCst);
        if self.real && v == 0 {
            Utc::now().timestamp_millis()
        } else {
            v
        }
    }

    /// Raw pinned value, for restoring after [`Clock::set`]
    pub fn raw(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn is_real(&self) -> bool {
        self.real
    }
}

/// Latest known prices. Written by the bar loop, read everywhere.
#[derive(Debug, Default)]
pub struct PriceCache {
    bars: RwLock<HashMap<String, f64>>,
    books: RwLock<HashMap<String, (BookTicker, i64)>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bar close. Stable-quoted pairs also price their base coin.
    pub fn set_bar_price(&self, symbol: &str, price: f64) {
        if !price.is_finite() {
            return;
        }
        let mut bars = self.bars.write().unwrap_or_else(|e| e.into_inner());
        bars.insert(symbol.to_string(), price);
        let parts = split_symbol(symbol);
        if !parts.quote.is_empty() && is_stable_coin(&parts.quote) {
            bars.insert(parts.base, price);
        }
    }

    pub fn set_book(&self, symbol: &str, book: BookTicker, at_ms: i64) {
        let mut books = self.books.write().unwrap_or_else(|e| e.into_inner());
        books.insert(symbol.to_string(), (book, at_ms));
    }

    pub fn book(&self, symbol: &str) -> Option<(BookTicker, i64)> {
        let books = self.books.read().unwrap_or_else(|e| e.into_inner());
        books.get(symbol).copied()
    }

    /// Price of a pair or coin; stable coins are 1.
    pub fn get(&self, code: &str) -> Option<f64> {
        if is_stable_coin(code) {
            return Some(1.0);
        }
        let bars = self.bars.read().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = bars.get(code) {
            return Some(*p);
        }
        if let Some((book, _)) = self.book(code) {
            if book.ask > 0.0 && book.bid > 0.0 {
                return Some((book.ask + book.bid) / 2.0);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.bars.read().map(|b| b.is_empty()).unwrap_or(true)
    }

    /// Whether a limit at `price` would rest in the book
    pub fn is_maker(&self, symbol: &str, side: Side, price: f64) -> bool {
        match self.book(symbol) {
            Some((book, _)) => match side {
                Side::Buy => price < book.ask,
                Side::Sell => price > book.bid,
            },
            None => false,
        }
    }

    pub fn clear(&self) {
        self.bars.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.books.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Everything shared by one run.
pub struct Ctx {
    pub config: Arc<Config>,
    pub exchange: Arc<dyn Exchange>,
    pub clock: Clock,
    pub prices: PriceCache,
    pub run_mode: RunMode,
    pub run_env: RunEnv,
    pub task_id: i64,
}

impl Ctx {
    pub fn backtest(config: Arc<Config>, exchange: Arc<dyn Exchange>, start_ms: i64) -> Self {
        Self {
            config,
            exchange,
            clock: Clock::simulated(start_ms),
            prices: PriceCache::new(),
            run_mode: RunMode::Backtest,
            run_env: RunEnv::DryRun,
            task_id: -1,
        }
    }

    pub fn live(config: Arc<Config>, exchange: Arc<dyn Exchange>, task_id: i64) -> Self {
        let run_env = if config.is_prod() { RunEnv::Prod } else { RunEnv::DryRun };
        Self {
            config,
            exchange,
            clock: Clock::real(),
            prices: PriceCache::new(),
            run_mode: RunMode::Live,
            run_env,
            task_id,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_live(&self) -> bool {
        self.run_mode == RunMode::Live
    }

    /// Real money: live mode in the production environment
    pub fn env_real(&self) -> bool {
        self.run_mode == RunMode::Live && self.run_env == RunEnv::Prod
    }

    pub fn is_contract(&self) -> bool {
        self.config.is_contract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_pin_and_restore() {
        let clock = Clock::simulated(1000);
        assert_eq!(clock.now_ms(), 1000);
        let prev = clock.raw();
        clock.set(5000);
        assert_eq!(clock.now_ms(), 5000);
        clock.set(prev);
        assert_eq!(clock.now_ms(), 1000);

        let real = Clock::real();
        assert!(real.now_ms() > 1_600_000_000_000);
    }

    #[test]
    fn test_price_cache_coins() {
        let prices = PriceCache::new();
        prices.set_bar_price("BTC/USDT", 100.0);
        assert_eq!(prices.get("BTC/USDT"), Some(100.0));
        assert_eq!(prices.get("BTC"), Some(100.0));
        assert_eq!(prices.get("USDT"), Some(1.0));
        assert_eq!(prices.get("ETH"), None);
        prices.set_bar_price("ETH/USDT", f64::NAN);
        assert_eq!(prices.get("ETH/USDT"), None);
    }

    #[test]
    fn test_is_maker() {
        let prices = PriceCache::new();
        prices.set_book("BTC/USDT", BookTicker { ask: 101.0, bid: 99.0 }, 0);
        assert!(prices.is_maker("BTC/USDT", Side::Buy, 100.0));
        assert!(!prices.is_maker("BTC/USDT", Side::Buy, 102.0));
        assert!(prices.is_maker("BTC/USDT", Side::Sell, 100.0));
    }
}
