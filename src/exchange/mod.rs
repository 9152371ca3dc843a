//! Exchange abstraction
//!
//! The core talks to an exchange only through [`Exchange`]. The local
//! simulator needs precision, market, margin and fee helpers; the live
//! order path additionally places orders and pulls balances and fills.
//! [`sim::SimExchange`] is the in-process implementation used by backtests.

pub mod sim;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::errors::Result;
use crate::types::{OrderType, Side};

pub use sim::SimExchange;

/// Market metadata for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub settle: String,
    pub contract: bool,
    /// Decimal places for prices
    pub price_prec: u32,
    /// Decimal places for amounts
    pub amount_prec: u32,
    pub min_amount: f64,
    pub min_cost: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub maint_margin_rate: f64,
}

impl Market {
    pub fn pip(&self) -> f64 {
        10f64.powi(-(self.price_prec as i32))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Fee {
    pub cost: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastPrice {
    pub symbol: String,
    pub price: f64,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BookTicker {
    pub ask: f64,
    pub bid: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Asset {
    pub code: String,
    pub free: f64,
    pub used: f64,
    pub upol: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Balances {
    pub time: i64,
    pub assets: BTreeMap<String, Asset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub short: bool,
    pub contracts: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
}

/// Order record as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub client_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub price: f64,
    pub average: f64,
    pub amount: f64,
    pub filled: f64,
    /// `open`, `closed`, `canceled`
    pub status: String,
    pub fee: Option<Fee>,
    pub timestamp: i64,
}

impl ExchangeOrder {
    pub fn is_done(&self) -> bool {
        self.status == "closed" || self.status == "canceled"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Income {
    pub symbol: String,
    pub kind: String,
    pub asset: String,
    pub amount: f64,
    pub time: i64,
}

/// Arguments of [`Exchange::create_order`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderReq {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub account: String,
    /// `long` / `short` for hedge-mode contracts, empty otherwise
    pub position_side: String,
    pub client_id: String,
    /// Trigger price for stop orders, 0 for plain orders
    pub stop_price: f64,
}

/// Everything the trading core needs from an exchange.
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn get_market(&self, symbol: &str) -> Result<Market>;

    fn price_one_pip(&self, symbol: &str) -> Result<f64> {
        Ok(self.get_market(symbol)?.pip())
    }

    fn prec_price(&self, symbol: &str, price: f64) -> Result<f64>;

    fn prec_amount(&self, symbol: &str, amount: f64) -> Result<f64>;

    /// Round a quote-currency cost
    fn prec_cost(&self, symbol: &str, cost: f64) -> Result<f64> {
        self.prec_price(symbol, cost)
    }

    fn calc_maint_margin(&self, symbol: &str, notional: f64) -> Result<f64>;

    fn calculate_fee(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        amount: f64,
        price: f64,
        is_maker: bool,
    ) -> Result<Fee>;

    fn fetch_last_prices(&self, symbols: &[String]) -> Result<Vec<LastPrice>>;

    fn fetch_balance(&self, account: &str) -> Result<Balances>;

    fn fetch_positions(&self, symbols: &[String], account: &str) -> Result<Vec<Position>>;

    fn fetch_orders(&self, symbol: &str, since: i64, limit: usize, account: &str) -> Result<Vec<ExchangeOrder>>;

    /// Best ask/bid per symbol (`bookTicker`)
    fn fetch_book_tickers(&self) -> Result<HashMap<String, BookTicker>>;

    fn create_order(&self, req: &CreateOrderReq) -> Result<ExchangeOrder>;

    fn cancel_order(&self, order_id: &str, symbol: &str, account: &str) -> Result<ExchangeOrder>;

    fn fetch_income_history(
        &self,
        kind: &str,
        symbol: &str,
        since: i64,
        limit: usize,
        account: &str,
    ) -> Result<Vec<Income>>;
}
