//! In-process exchange used for backtests and tests
//!
//! Markets are registered explicitly or derived from the symbol text.
//! Orders placed through [`Exchange::create_order`] fill against the last
//! price set with [`SimExchange::set_price`].

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use super::*;
use crate::errors::{ErrKind, TradeError};
use crate::types::split_symbol;

#[derive(Debug, Default)]
struct SimState {
    markets: HashMap<String, Market>,
    prices: HashMap<String, f64>,
    books: HashMap<String, BookTicker>,
    orders: Vec<ExchangeOrder>,
    balances: BTreeMap<String, Asset>,
    incomes: Vec<Income>,
}

pub struct SimExchange {
    state: Mutex<SimState>,
    maker_fee: f64,
    taker_fee: f64,
    maint_margin_rate: f64,
    /// Derive markets for unknown symbols instead of failing
    auto_markets: bool,
    next_id: AtomicI64,
    /// Number of upcoming network calls that fail with `NetTimeout`
    fail_next: AtomicUsize,
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new(0.001, 0.001)
    }
}

impl SimExchange {
    pub fn new(maker_fee: f64, taker_fee: f64) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            maker_fee,
            taker_fee,
            maint_margin_rate: 0.004,
            auto_markets: true,
            next_id: AtomicI64::new(1),
            fail_next: AtomicUsize::new(0),
        }
    }

    pub fn with_market(self, market: Market) -> Self {
        self.lock().markets.insert(market.symbol.clone(), market);
        self
    }

    pub fn with_maint_margin_rate(mut self, rate: f64) -> Self {
        self.maint_margin_rate = rate;
        self
    }

    pub fn strict_markets(mut self) -> Self {
        self.auto_markets = false;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build a market from the symbol text: `X/Y` is spot, `X/Y:Z` a contract.
    pub fn derive_market(&self, symbol: &str) -> Market {
        let parts = split_symbol(symbol);
        Market {
            id: symbol.replace(['/', ':', '-'], ""),
            symbol: symbol.to_string(),
            base: parts.base,
            quote: parts.quote,
            settle: parts.settle,
            contract: symbol.contains(':'),
            price_prec: 8,
            amount_prec: 8,
            min_amount: 0.0,
            min_cost: 0.0,
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            maint_margin_rate: self.maint_margin_rate,
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_book(&self, symbol: &str, ask: f64, bid: f64) {
        self.lock().books.insert(symbol.to_string(), BookTicker { ask, bid });
    }

    pub fn set_balance(&self, code: &str, free: f64, used: f64) {
        self.lock().balances.insert(
            code.to_string(),
            Asset {
                code: code.to_string(),
                free,
                used,
                upol: 0.0,
                total: free + used,
            },
        );
    }

    pub fn add_income(&self, income: Income) {
        self.lock().incomes.push(income);
    }

    /// Make the next `n` network calls fail with a timeout.
    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn placed_orders(&self) -> Vec<ExchangeOrder> {
        self.lock().orders.clone()
    }

    fn net_call(&self, what: &str) -> Result<()> {
        let left = self.fail_next.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_next.store(left - 1, Ordering::SeqCst);
            return Err(TradeError::new(ErrKind::NetTimeout, format!("{} timed out", what)));
        }
        Ok(())
    }

    fn round(val: f64, dp: u32, strategy: RoundingStrategy) -> Result<f64> {
        let dec = Decimal::from_f64(val)
            .ok_or_else(|| TradeError::param(format!("cannot round non-finite value {}", val)))?;
        dec.round_dp_with_strategy(dp, strategy)
            .to_f64()
            .ok_or_else(|| TradeError::internal(format!("decimal overflow rounding {}", val)))
    }
}

impl Exchange for SimExchange {
    fn name(&self) -> &str {
        "sim"
    }

    fn get_market(&self, symbol: &str) -> Result<Market> {
        if let Some(m) = self.lock().markets.get(symbol) {
            return Ok(m.clone());
        }
        if self.auto_markets && symbol.contains('/') {
            return Ok(self.derive_market(symbol));
        }
        Err(TradeError::new(
            ErrKind::InvalidSymbol,
            format!("unknown symbol: {}", symbol),
        ))
    }

    fn prec_price(&self, symbol: &str, price: f64) -> Result<f64> {
        let market = self.get_market(symbol)?;
        Self::round(price, market.price_prec, RoundingStrategy::MidpointAwayFromZero)
    }

    fn prec_amount(&self, symbol: &str, amount: f64) -> Result<f64> {
        let market = self.get_market(symbol)?;
        Self::round(amount, market.amount_prec, RoundingStrategy::ToZero)
    }

    fn calc_maint_margin(&self, symbol: &str, notional: f64) -> Result<f64> {
        let market = self.get_market(symbol)?;
        Ok(notional.abs() * market.maint_margin_rate)
    }

    fn calculate_fee(
        &self,
        symbol: &str,
        _order_type: OrderType,
        _side: Side,
        amount: f64,
        price: f64,
        is_maker: bool,
    ) -> Result<Fee> {
        let market = self.get_market(symbol)?;
        let rate = if is_maker { market.maker_fee } else { market.taker_fee };
        let currency = if market.contract {
            market.settle
        } else {
            market.quote
        };
        Ok(Fee {
            cost: amount * price * rate,
            currency,
        })
    }

    fn fetch_last_prices(&self, symbols: &[String]) -> Result<Vec<LastPrice>> {
        self.net_call("fetch_last_prices")?;
        let state = self.lock();
        Ok(state
            .prices
            .iter()
            .filter(|(s, _)| symbols.is_empty() || symbols.contains(s))
            .map(|(s, p)| LastPrice {
                symbol: s.clone(),
                price: *p,
                time: 0,
            })
            .collect())
    }

    fn fetch_balance(&self, _account: &str) -> Result<Balances> {
        self.net_call("fetch_balance")?;
        Ok(Balances {
            time: 0,
            assets: self.lock().balances.clone(),
        })
    }

    fn fetch_positions(&self, _symbols: &[String], _account: &str) -> Result<Vec<Position>> {
        self.net_call("fetch_positions")?;
        Ok(Vec::new())
    }

    fn fetch_orders(&self, symbol: &str, since: i64, limit: usize, _account: &str) -> Result<Vec<ExchangeOrder>> {
        self.net_call("fetch_orders")?;
        let state = self.lock();
        Ok(state
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.timestamp >= since)
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect())
    }

    fn fetch_book_tickers(&self) -> Result<HashMap<String, BookTicker>> {
        self.net_call("fetch_book_tickers")?;
        Ok(self.lock().books.clone())
    }

    fn create_order(&self, req: &CreateOrderReq) -> Result<ExchangeOrder> {
        self.net_call("create_order")?;
        let market = self.get_market(&req.symbol)?;
        let mut state = self.lock();
        let last = state.prices.get(&req.symbol).copied().unwrap_or(req.price);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Market orders and marketable limits fill at once, others rest.
        let marketable = match (req.order_type, req.side) {
            (OrderType::Market, _) => true,
            (OrderType::Limit, Side::Buy) => req.price >= last,
            (OrderType::Limit, Side::Sell) => req.price <= last,
        };
        let fill_price = if req.order_type == OrderType::Market { last } else { req.price };
        let (filled, average, status, fee) = if marketable && fill_price > 0.0 && req.stop_price == 0.0 {
            let rate = if req.order_type == OrderType::Market { market.taker_fee } else { market.maker_fee };
            let currency = if market.contract { market.settle.clone() } else { market.quote.clone() };
            (
                req.amount,
                fill_price,
                "closed",
                Some(Fee {
                    cost: req.amount * fill_price * rate,
                    currency,
                }),
            )
        } else {
            (0.0, 0.0, "open", None)
        };
        let od = ExchangeOrder {
            id: id.to_string(),
            client_id: req.client_id.clone(),
            symbol: req.symbol.clone(),
            order_type: req.order_type,
            side: req.side,
            price: req.price,
            average,
            amount: req.amount,
            filled,
            status: status.to_string(),
            fee,
            timestamp: 0,
        };
        debug!(symbol = %req.symbol, side = %req.side, amount = req.amount, status, "sim order placed");
        state.orders.push(od.clone());
        Ok(od)
    }

    fn cancel_order(&self, order_id: &str, symbol: &str, _account: &str) -> Result<ExchangeOrder> {
        self.net_call("cancel_order")?;
        let mut state = self.lock();
        let od = state
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.symbol == symbol)
            .ok_or_else(|| TradeError::param(format!("order {} not found", order_id)))?;
        if od.status == "open" {
            od.status = "canceled".to_string();
        }
        Ok(od.clone())
    }

    fn fetch_income_history(
        &self,
        kind: &str,
        symbol: &str,
        since: i64,
        limit: usize,
        _account: &str,
    ) -> Result<Vec<Income>> {
        self.net_call("fetch_income_history")?;
        let state = self.lock();
        Ok(state
            .incomes
            .iter()
            .filter(|i| (kind.is_empty() || i.kind == kind) && (symbol.is_empty() || i.symbol == symbol) && i.time >= since)
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_derived_market() {
        let ex = SimExchange::default();
        let m = ex.get_market("BTC/USDT:USDT").unwrap();
        assert!(m.contract);
        assert_eq!(m.settle, "USDT");
        let m = ex.get_market("ETH/USDT").unwrap();
        assert!(!m.contract);
        assert_eq!(m.base, "ETH");
    }

    #[test]
    fn test_strict_markets_reject_unknown() {
        let ex = SimExchange::default().strict_markets();
        let err = ex.get_market("BTC/USDT").unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidSymbol);
    }

    #[test]
    fn test_precision_rounding() {
        let mut m = SimExchange::default().derive_market("BTC/USDT");
        m.price_prec = 2;
        m.amount_prec = 3;
        let ex = SimExchange::default().with_market(m);
        assert_eq!(ex.prec_price("BTC/USDT", 98.806).unwrap(), 98.81);
        assert_eq!(ex.prec_amount("BTC/USDT", 0.12399).unwrap(), 0.123);
        assert_eq!(Decimal::from_f64(0.123).unwrap(), dec!(0.123));
    }

    #[test]
    fn test_fee_and_maint_margin() {
        let ex = SimExchange::new(0.0002, 0.0005);
        let fee = ex
            .calculate_fee("BTC/USDT", OrderType::Limit, Side::Buy, 2.0, 100.0, true)
            .unwrap();
        assert!((fee.cost - 0.04).abs() < 1e-12);
        assert_eq!(fee.currency, "USDT");
        assert!((ex.calc_maint_margin("BTC/USDT:USDT", 1000.0).unwrap() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_create_order_fills_market_and_fails_on_timeout() {
        let ex = SimExchange::default();
        ex.set_price("BTC/USDT", 100.0);
        ex.fail_next_calls(1);
        let req = CreateOrderReq {
            symbol: "BTC/USDT".into(),
            order_type: OrderType::Market,
            side: Side::Buy,
            amount: 0.5,
            price: 0.0,
            account: "default".into(),
            position_side: String::new(),
            client_id: "c1".into(),
            stop_price: 0.0,
        };
        assert_eq!(ex.create_order(&req).unwrap_err().kind, ErrKind::NetTimeout);
        let od = ex.create_order(&req).unwrap();
        assert_eq!(od.status, "closed");
        assert_eq!(od.average, 100.0);
        assert_eq!(od.filled, 0.5);
    }
}
