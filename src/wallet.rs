//! Multi-coin wallet with margin accounting
//!
//! Each coin has four buckets: `available`, `pendings` (locked while an
//! order is being placed), `frozens` (margin or short proceeds held for an
//! open order) and the unrealized PnL of open contract positions. Bucket
//! maps are keyed by order key so reservations can be moved when an order
//! is split.
//!
//! In the live production environment balances come from the exchange, so
//! the confirm/exit bookkeeping below is skipped; reservations still apply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::errors::{ErrKind, Result, TradeError};
use crate::exchange::Balances;
use crate::orders::InOutOrder;
use crate::runtime::{Ctx, PriceCache};
use crate::types::{fmt_ms, split_symbol};

/// Bucket key standing for the whole exchange-reported amount
const ALL_KEY: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ItemWallet {
    pub coin: String,
    pub available: f64,
    pub pendings: BTreeMap<String, f64>,
    pub frozens: BTreeMap<String, f64>,
    /// Unrealized PnL of open contracts settled in this coin, refreshed each bar
    pub unrealized_pol: f64,
    /// Part of the unrealized PnL already lent as margin to other orders
    pub used_upol: f64,
    /// Withdrawn from trading, excluded from `available`
    pub withdraw: f64,
}

impl ItemWallet {
    pub fn new(coin: &str) -> Self {
        Self {
            coin: coin.to_string(),
            ..Default::default()
        }
    }

    fn bucket_sum(map: &BTreeMap<String, f64>) -> f64 {
        match map.get(ALL_KEY) {
            Some(v) => *v,
            None => map.values().sum(),
        }
    }

    pub fn used(&self) -> f64 {
        Self::bucket_sum(&self.pendings) + Self::bucket_sum(&self.frozens)
    }

    /// available + pendings + frozens (+ unrealized PnL)
    pub fn total(&self, with_upol: bool) -> f64 {
        let mut val = self.available + self.used();
        if with_upol {
            val += self.unrealized_pol;
        }
        val
    }

    /// Set the margin held for one order.
    ///
    /// Free unrealized profit is used first, then `available`. Shrinking
    /// margin releases the excess back to `available`.
    pub fn set_margin(&mut self, od_key: &str, amount: f64) -> Result<()> {
        let old_amt = self.frozens.get(od_key).copied().unwrap_or(0.0);
        let mut amount = amount;
        let ava_upol = self.unrealized_pol - self.used_upol;
        let mut upol_cost = 0.0;
        if ava_upol > 0.0 {
            self.used_upol += amount;
            if self.used_upol <= self.unrealized_pol {
                self.frozens.remove(od_key);
                upol_cost = amount;
                amount = 0.0;
            } else {
                let rest = self.used_upol - self.unrealized_pol;
                upol_cost = amount - rest;
                amount = rest;
                self.used_upol = self.unrealized_pol;
            }
        }
        let add_val = amount - old_amt;
        if add_val > 0.0 && self.available < add_val {
            self.used_upol -= upol_cost;
            return Err(TradeError::new(
                ErrKind::LowFunds,
                format!(
                    "available {} insufficient, frozen require: {:.5}, {}",
                    self.coin, add_val, od_key
                ),
            ));
        }
        self.available -= add_val;
        self.frozens.insert(od_key.to_string(), amount);
        Ok(())
    }

    /// Set the frozen amount to a fixed value, syncing the difference from
    /// `available` or from this order's pending bucket.
    pub fn set_frozen(&mut self, od_key: &str, amount: f64, with_available: bool) -> Result<()> {
        let old_amt = self.frozens.get(od_key).copied().unwrap_or(0.0);
        let add_val = amount - old_amt;
        if with_available {
            if add_val > 0.0 && self.available < add_val {
                return Err(TradeError::new(
                    ErrKind::LowFunds,
                    format!("available {} insufficient, frozen require: {:.5}, {}", self.coin, add_val, od_key),
                ));
            }
            self.available -= add_val;
        } else {
            let pend = self.pendings.get(od_key).copied().unwrap_or(0.0);
            if add_val > 0.0 && pend < add_val {
                return Err(TradeError::new(
                    ErrKind::LowSrcAmount,
                    format!("pending {} insufficient, frozen require: {:.5}, {}", self.coin, add_val, od_key),
                ));
            }
            self.pendings.insert(od_key.to_string(), pend - add_val);
        }
        self.frozens.insert(od_key.to_string(), amount);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.available = 0.0;
        self.unrealized_pol = 0.0;
        self.used_upol = 0.0;
        self.pendings.clear();
        self.frozens.clear();
    }
}

/// All coin wallets of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Wallets {
    pub account: String,
    pub items: BTreeMap<String, ItemWallet>,
    pub margin_add_rate: f64,
    pub min_open_rate: f64,
    /// Balances are owned by the exchange
    pub env_real: bool,
}

impl Wallets {
    pub fn new(account: &str, margin_add_rate: f64, min_open_rate: f64) -> Self {
        Self {
            account: account.to_string(),
            items: BTreeMap::new(),
            margin_add_rate,
            min_open_rate,
            env_real: false,
        }
    }

    /// Replace balances of the given coins
    pub fn set_wallets(&mut self, data: &BTreeMap<String, f64>) {
        for (coin, amt) in data {
            let item = self.get_mut(coin);
            item.reset();
            item.available = *amt;
        }
    }

    pub fn get(&self, coin: &str) -> Option<&ItemWallet> {
        self.items.get(coin)
    }

    /// Wallet of a coin, created on first use
    pub fn get_mut(&mut self, coin: &str) -> &mut ItemWallet {
        self.items
            .entry(coin.to_string())
            .or_insert_with(|| ItemWallet::new(coin))
    }

    pub fn dump_avas(&self) -> BTreeMap<String, f64> {
        self.items.iter().map(|(k, v)| (k.clone(), v.available)).collect()
    }

    /// Sum of all buckets per coin
    pub fn totals(&self, with_upol: bool) -> BTreeMap<String, f64> {
        self.items.iter().map(|(k, v)| (k.clone(), v.total(with_upol))).collect()
    }

    /// Move `amount` from `available` to `pendings[od_key]`.
    ///
    /// Takes what is available when at least `min_rate` of the request can
    /// be covered; `negative` allows the balance to go below zero.
    pub fn cost_ava(&mut self, od_key: &str, coin: &str, amount: f64, negative: bool, min_rate: f64) -> Result<f64> {
        let min_rate = if min_rate == 0.0 { self.min_open_rate } else { min_rate };
        let item = self.get_mut(coin);
        let src = item.available;
        let real_cost = if src >= amount || negative {
            amount
        } else if amount > 0.0 && src / amount > min_rate {
            src
        } else {
            return Err(TradeError::new(
                ErrKind::LowFunds,
                format!("wallet {} balance {:.5} < {:.5}", coin, src, amount),
            ));
        };
        debug!(key = od_key, coin, ava = item.available, cost = real_cost, "cost_ava");
        item.available -= real_cost;
        item.pendings.insert(od_key.to_string(), real_cost);
        Ok(real_cost)
    }

    /// Release `frozens[od_key]` to available, then lock `amount` into pending.
    /// Not used for contracts.
    pub fn cost_frozen(&mut self, od_key: &str, coin: &str, amount: f64) -> f64 {
        let Some(item) = self.items.get_mut(coin) else {
            return 0.0;
        };
        let frozen = item.frozens.remove(od_key).unwrap_or(0.0);
        debug!(key = od_key, coin, ava = item.available, add = frozen - amount, "cost_frozen");
        item.available += frozen - amount;
        let mut real_cost = amount;
        if item.available < 0.0 {
            real_cost += item.available;
            item.available = 0.0;
        }
        item.pendings.insert(od_key.to_string(), real_cost);
        real_cost
    }

    /// Settle `pendings[od_key]` of `src`, crediting `tgt_amt` of `tgt`.
    /// Whatever remains of the pending goes back to `src.available`.
    pub fn confirm_pending(
        &mut self,
        od_key: &str,
        src: &str,
        src_amt: f64,
        tgt: &str,
        tgt_amt: f64,
        to_frozen: bool,
    ) -> bool {
        let Some(src_item) = self.items.get_mut(src) else {
            return false;
        };
        let Some(pending) = src_item.pendings.remove(od_key) else {
            return false;
        };
        let left = pending - src_amt;
        debug!(key = od_key, from = src, ava = src_item.available, left, "confirm_pending");
        src_item.available += left;
        let tgt_item = self.get_mut(tgt);
        if to_frozen {
            tgt_item.frozens.insert(od_key.to_string(), tgt_amt);
        } else {
            tgt_item.available += tgt_amt;
        }
        true
    }

    /// Release a reservation back to `available`, adding `add_amt`.
    pub fn cancel(&mut self, od_key: &str, coin: &str, add_amt: f64, from_pending: bool) {
        let Some(item) = self.items.get_mut(coin) else {
            return;
        };
        let src = if from_pending {
            item.pendings.remove(od_key)
        } else {
            item.frozens.remove(od_key)
        };
        let amt = src.unwrap_or(0.0) + add_amt;
        item.available += amt;
        debug!(
            key = od_key,
            coin,
            from = if from_pending { "pending" } else { "frozen" },
            amt,
            ava = item.available,
            "cancel to ava"
        );
    }

    /// Move `rate` of the reservations under `src_key` to `tgt_key`.
    pub fn cut_part(&mut self, src_key: &str, tgt_key: &str, coin: &str, rate: f64) {
        let Some(item) = self.items.get_mut(coin) else {
            return;
        };
        for map in [&mut item.pendings, &mut item.frozens] {
            if let Some(val) = map.get(src_key).copied() {
                let cut = val * rate;
                *map.entry(tgt_key.to_string()).or_insert(0.0) += cut;
                map.insert(src_key.to_string(), val - cut);
            }
        }
    }

    pub fn amount_by_legal(&self, coin: &str, legal: f64, prices: &PriceCache) -> Result<f64> {
        match prices.get(coin) {
            Some(p) if p > 0.0 => Ok(legal / p),
            _ => Err(TradeError::param(format!("no price for {}", coin))),
        }
    }

    /// Reserve funds for an entry. Returns the legal cost locked.
    pub fn enter_od(&mut self, od: &mut InOutOrder, ctx: &Ctx) -> Result<f64> {
        let key = od.key();
        let market = ctx.exchange.get_market(&od.symbol)?;
        let mut legal_cost = if od.enter.amount != 0.0 {
            let price = if od.enter.average > 0.0 {
                od.enter.average
            } else {
                ctx.prices
                    .get(&od.symbol)
                    .ok_or_else(|| TradeError::param(format!("no price for {}", od.symbol)))?
            };
            od.enter.amount * price
        } else {
            od.info.legal_cost
        };
        if !legal_cost.is_finite() || legal_cost <= 0.0 {
            return Err(TradeError::param(format!("invalid legal cost {} for {}", legal_cost, key)));
        }
        if market.contract || !od.short {
            if legal_cost < ctx.config.min_stake_amount {
                warn!(key = %key, cost = legal_cost, min = ctx.config.min_stake_amount, "cost below min stake");
            }
            if market.contract {
                legal_cost /= od.leverage.max(1.0);
            }
            let quote_cost = self.amount_by_legal(&market.quote, legal_cost, &ctx.prices)?;
            let quote_cost = self.cost_ava(&key, &market.quote, quote_cost, false, 0.0)?;
            let mut margin = quote_cost;
            if market.contract {
                margin *= od.leverage.max(1.0);
            }
            od.quote_cost = ctx.exchange.prec_cost(&od.symbol, margin)?;
            od.dirty_main = true;
        } else {
            let base_cost = self.amount_by_legal(&market.base, legal_cost, &ctx.prices)?;
            let base_cost = self.cost_ava(&key, &market.base, base_cost, true, 0.0)?;
            od.enter.amount = base_cost;
            od.dirty_enter = true;
        }
        Ok(legal_cost)
    }

    pub fn confirm_od_enter(&mut self, od: &InOutOrder, price: f64, ctx: &Ctx) -> Result<()> {
        if self.env_real {
            return Ok(());
        }
        let market = ctx.exchange.get_market(&od.symbol)?;
        let key = od.key();
        let sub = &od.enter;
        let mut quote_amount = price * sub.amount;
        let fee = sub.fee;
        if market.contract {
            quote_amount /= od.leverage.max(1.0);
            let got = quote_amount - fee;
            self.confirm_pending(&key, &market.quote, quote_amount, &market.quote, got, true);
        } else if od.short {
            let got = quote_amount - fee;
            self.confirm_pending(&key, &market.base, sub.amount, &market.quote, got, true);
        } else {
            let base_fee = if sub.fee_type == market.base {
                fee
            } else if price > 0.0 {
                fee / price
            } else {
                0.0
            };
            self.confirm_pending(&key, &market.quote, quote_amount, &market.base, sub.amount - base_fee, false);
        }
        Ok(())
    }

    /// Lock holdings for an exit of `base_amount`.
    pub fn exit_od(&mut self, od: &InOutOrder, base_amount: f64, ctx: &Ctx) -> Result<()> {
        if self.env_real {
            return Ok(());
        }
        let market = ctx.exchange.get_market(&od.symbol)?;
        if market.contract {
            return Ok(());
        }
        let key = od.key();
        if od.short {
            self.cancel(&key, &market.base, 0.0, true);
            return Ok(());
        }
        let mut base_amount = base_amount;
        let ava = self.get_mut(&market.base).available;
        let near = base_amount > 0.0 && (ava / base_amount - 1.0).abs() <= 0.01;
        if (ava > 0.0 && ava < base_amount) || near {
            base_amount = ava;
            self.cancel(&key, &market.quote, 0.0, true);
        }
        if base_amount > 0.0 {
            if let Err(err) = self.cost_ava(&key, &market.base, base_amount, false, 0.01) {
                error!(key = %key, %err, "exit order fail");
            }
        }
        Ok(())
    }

    pub fn confirm_od_exit(&mut self, od: &InOutOrder, exit_price: f64, ctx: &Ctx) -> Result<()> {
        if self.env_real {
            return Ok(());
        }
        let market = ctx.exchange.get_market(&od.symbol)?;
        let key = od.key();
        let (exit_amount, fee) = match &od.exit {
            Some(e) => (e.amount, e.fee),
            None => return Err(TradeError::internal(format!("confirm exit without exit leg: {}", key))),
        };
        if market.contract {
            self.cancel(&key, &market.quote, od.profit + od.enter.fee, false);
        } else if od.short {
            let org = od.enter.filled;
            if org > 0.0 {
                self.cost_frozen(&key, &market.quote, org * exit_price);
            }
            if exit_price < od.enter.price {
                self.cancel(&key, &market.quote, 0.0, false);
            }
            let quote_amount = exit_price * org + fee;
            self.confirm_pending(&key, &market.quote, quote_amount, &market.base, org, false);
        } else {
            let sold = self
                .get(&market.base)
                .and_then(|w| w.pendings.get(&key).copied())
                .unwrap_or(exit_amount);
            let quote_amount = exit_price * sold - fee;
            self.confirm_pending(&key, &market.base, sold, &market.quote, quote_amount, false);
        }
        Ok(())
    }

    /// Refresh unrealized PnL and margins for contract orders settled in `currency`.
    ///
    /// Fails with `Liquidation` (after zeroing the wallet) when losses exceed
    /// 99% of the wallet.
    pub fn update_ods(&mut self, ods: &[InOutOrder], currency: &str, ctx: &Ctx) -> Result<()> {
        if ods.is_empty() {
            for item in self.items.values_mut() {
                item.unrealized_pol = 0.0;
                item.used_upol = 0.0;
            }
            return Ok(());
        }
        let margin_add_rate = self.margin_add_rate;
        let tot_profit: f64 = ods.iter().map(|od| od.profit).sum();
        let item = self.get_mut(currency);
        item.unrealized_pol = tot_profit;
        item.used_upol = 0.0;
        if tot_profit < 0.0 {
            let total = item.total(false);
            let ratio = if total > 0.0 { tot_profit.abs() / total } else { f64::INFINITY };
            if ratio > 0.99 {
                item.reset();
                return Err(TradeError::new(ErrKind::Liquidation, "Account Wallet Liquidation"));
            }
        }
        for od in ods {
            if od.enter.filled == 0.0 {
                continue;
            }
            let Some(cur_price) = ctx.prices.get(&od.symbol) else {
                continue;
            };
            let quote_value = od.enter.filled * cur_price;
            let mut cur_margin = quote_value / od.leverage.max(1.0);
            let key = od.key();
            let is_good = (cur_price - od.enter.average) * od.dirt();
            if is_good < 0.0 && od.profit < 0.0 {
                let min_margin = ctx.exchange.calc_maint_margin(&od.symbol, quote_value)?;
                if od.profit.abs() >= (cur_margin - min_margin) * margin_add_rate {
                    debug!(key = %key, profit = od.profit, margin = cur_margin, "loss add margin");
                    cur_margin -= od.profit;
                }
            }
            if let Err(err) = self.get_mut(currency).set_margin(&key, cur_margin) {
                debug!(key = %key, %err, "cash lack, add margin fail");
            }
        }
        Ok(())
    }

    /// `(coin, legal value, price)` for each priced coin
    fn calc_legal<F>(&self, item_amt: F, symbols: Option<&[String]>, prices: &PriceCache) -> Vec<(String, f64, f64)>
    where
        F: Fn(&ItemWallet) -> f64,
    {
        let mut res = Vec::new();
        let mut skips = Vec::new();
        for (coin, item) in self.items.iter() {
            if let Some(list) = symbols {
                if !list.iter().any(|s| s == coin) {
                    continue;
                }
            }
            match prices.get(coin) {
                Some(price) => res.push((coin.clone(), item_amt(item) * price, price)),
                None => skips.push(coin.as_str()),
            }
        }
        if !skips.is_empty() {
            debug!(pairs = %skips.join(","), "skip coins without price in wallet legal value");
        }
        res
    }

    pub fn ava_legal(&self, symbols: Option<&[String]>, prices: &PriceCache) -> f64 {
        self.calc_legal(|x| x.available, symbols, prices).iter().map(|x| x.1).sum()
    }

    pub fn total_legal(&self, symbols: Option<&[String]>, with_upol: bool, prices: &PriceCache) -> f64 {
        self.calc_legal(|x| x.total(with_upol), symbols, prices).iter().map(|x| x.1).sum()
    }

    pub fn unrealized_pol_legal(&self, symbols: Option<&[String]>, prices: &PriceCache) -> f64 {
        self.calc_legal(|x| x.unrealized_pol, symbols, prices).iter().map(|x| x.1).sum()
    }

    pub fn withdraw_legal_total(&self, symbols: Option<&[String]>, prices: &PriceCache) -> f64 {
        self.calc_legal(|x| x.withdraw, symbols, prices).iter().map(|x| x.1).sum()
    }

    /// Move `amount` of legal value out of `available`, proportionally across coins.
    pub fn withdraw_legal(&mut self, amount: f64, symbols: Option<&[String]>, prices: &PriceCache) {
        let rows = self.calc_legal(|x| x.available, symbols, prices);
        let total: f64 = rows.iter().map(|x| x.1).sum();
        if total <= 0.0 {
            return;
        }
        for (coin, legal, price) in rows {
            let draw = legal / total * amount / price;
            if let Some(item) = self.items.get_mut(&coin) {
                let draw = draw.min(item.available);
                item.withdraw += draw;
                item.available -= draw;
            }
        }
    }

    /// Per-order stake derived from `stake_pct` of total legal value, rounded to tens.
    pub fn stake_pct_amount(&self, stake_pct: f64, leverage: f64, contract: bool, prices: &PriceCache) -> f64 {
        let mut legal = self.total_legal(None, true, prices);
        if contract && leverage > 1.0 {
            legal *= leverage;
        }
        (legal * stake_pct / 1000.0).round() * 10.0
    }

    /// Sync from an exchange balance snapshot (live).
    pub fn update_by_balances(&mut self, balances: &Balances, contract: bool) {
        let mut msgs = Vec::new();
        for (coin, asset) in balances.assets.iter() {
            if asset.total == 0.0 {
                continue;
            }
            let item = self.get_mut(coin);
            item.available = asset.free;
            item.unrealized_pol = asset.upol;
            item.pendings.clear();
            item.frozens.clear();
            if contract {
                item.pendings.insert(ALL_KEY.to_string(), asset.used);
            } else {
                item.frozens.insert(ALL_KEY.to_string(), asset.used);
            }
            msgs.push(format!("{}: {:.5}/{:.5}/{:.5}", coin, asset.free, asset.used, asset.upol));
        }
        if !msgs.is_empty() {
            info!(account = %self.account, at = %fmt_ms(balances.time), "update balances {}", msgs.join("  "));
        }
    }

    /// Coins involved in a symbol: (base, quote)
    pub fn pair_coins(symbol: &str) -> (String, String) {
        let parts = split_symbol(symbol);
        (parts.base, parts.quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::SimExchange;
    use crate::orders::{InOutStatus, OdStatus};
    use crate::types::OrderType;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn wallets(usdt: f64) -> Wallets {
        let mut w = Wallets::new("default", 0.66, 0.5);
        let mut init = BTreeMap::new();
        init.insert("USDT".to_string(), usdt);
        w.set_wallets(&init);
        w
    }

    fn ctx(contract: bool) -> Ctx {
        let mut cfg = Config::default();
        cfg.run_timeframes = vec!["1h".into()];
        if contract {
            cfg.market_type = crate::config::MarketType::Linear;
        }
        Ctx::backtest(Arc::new(cfg), Arc::new(SimExchange::default()), 0)
    }

    #[test]
    fn test_cost_ava_then_cancel_conserves() {
        let mut w = wallets(100.0);
        let before = w.totals(false);
        let got = w.cost_ava("k1", "USDT", 30.0, false, 0.0).unwrap();
        assert_relative_eq!(got, 30.0);
        assert_relative_eq!(w.get("USDT").unwrap().available, 70.0);
        w.cancel("k1", "USDT", 0.0, true);
        assert_eq!(w.totals(false), before);
    }

    #[test]
    fn test_cost_ava_min_rate() {
        let mut w = wallets(60.0);
        // 60/100 > 0.5 takes what is there
        assert_relative_eq!(w.cost_ava("k1", "USDT", 100.0, false, 0.0).unwrap(), 60.0);
        let err = w.cost_ava("k2", "USDT", 100.0, false, 0.0).unwrap_err();
        assert_eq!(err.kind, ErrKind::LowFunds);
    }

    #[test]
    fn test_set_margin_uses_upol_then_available() {
        let mut item = ItemWallet::new("USDT");
        item.available = 100.0;
        item.unrealized_pol = 5.0;
        item.set_margin("k", 8.0).unwrap();
        assert_relative_eq!(item.used_upol, 5.0);
        assert_relative_eq!(item.frozens["k"], 3.0);
        assert_relative_eq!(item.available, 97.0);
        // shrink releases
        item.unrealized_pol = 0.0;
        item.used_upol = 0.0;
        item.set_margin("k", 1.0).unwrap();
        assert_relative_eq!(item.available, 99.0);
        let err = item.set_margin("k", 500.0).unwrap_err();
        assert_eq!(err.kind, ErrKind::LowFunds);
        assert_relative_eq!(item.frozens["k"], 1.0);
    }

    #[test]
    fn test_set_frozen_from_pending() {
        let mut item = ItemWallet::new("USDT");
        item.pendings.insert("k".into(), 5.0);
        assert_eq!(item.set_frozen("k", 8.0, false).unwrap_err().kind, ErrKind::LowSrcAmount);
        item.set_frozen("k", 4.0, false).unwrap();
        assert_relative_eq!(item.pendings["k"], 1.0);
        assert_relative_eq!(item.frozens["k"], 4.0);
    }

    #[test]
    fn test_cut_part_preserves_sums() {
        let mut w = wallets(100.0);
        w.cost_ava("old", "USDT", 40.0, false, 0.0).unwrap();
        w.get_mut("USDT").frozens.insert("old".into(), 10.0);
        let before = w.totals(false);
        w.cut_part("old", "new", "USDT", 0.7);
        let item = w.get("USDT").unwrap();
        assert_relative_eq!(item.pendings["new"], 28.0);
        assert_relative_eq!(item.pendings["old"], 12.0);
        assert_relative_eq!(item.frozens["new"], 7.0);
        assert_relative_eq!(w.totals(false)["USDT"], before["USDT"]);
    }

    fn long_order(amount: f64, price: f64, leverage: f64, short: bool, symbol: &str) -> InOutOrder {
        let mut od = InOutOrder::new(-1, symbol, 1, "1h", "t", short, "e", 0, OrderType::Market);
        od.init_price = price;
        od.enter.amount = amount;
        od.enter.average = price;
        od.leverage = leverage;
        od
    }

    fn fill(od: &mut InOutOrder, price: f64) {
        od.enter.filled = od.enter.amount;
        od.enter.average = price;
        od.enter.status = OdStatus::Closed;
        od.status = InOutStatus::FullEnter;
    }

    #[test]
    fn test_spot_long_round_trip() {
        let ctx = ctx(false);
        ctx.prices.set_bar_price("BTC/USDT", 100.0);
        let mut w = wallets(1000.0);
        let mut od = long_order(0.1, 100.0, 1.0, false, "BTC/USDT");
        let legal = w.enter_od(&mut od, &ctx).unwrap();
        assert_relative_eq!(legal, 10.0);
        assert_relative_eq!(w.get("USDT").unwrap().available, 990.0);
        fill(&mut od, 100.0);
        w.confirm_od_enter(&od, 100.0, &ctx).unwrap();
        assert_relative_eq!(w.get("BTC").unwrap().available, 0.1);
        od.set_exit(3_600_000, "x", None, 0.0);
        w.exit_od(&od, 0.1, &ctx).unwrap();
        if let Some(e) = od.exit.as_mut() {
            e.filled = 0.1;
            e.average = 110.0;
        }
        w.confirm_od_exit(&od, 110.0, &ctx).unwrap();
        assert_relative_eq!(w.get("USDT").unwrap().available, 1001.0);
        assert_relative_eq!(w.get("BTC").unwrap().available, 0.0);
    }

    #[test]
    fn test_contract_liquidation() {
        let ctx = ctx(true);
        let sym = "BTC/USDT:USDT";
        ctx.prices.set_bar_price(sym, 100.0);
        let mut w = wallets(100.0);
        let mut od = long_order(1.0, 100.0, 10.0, true, sym);
        w.enter_od(&mut od, &ctx).unwrap();
        fill(&mut od, 100.0);
        w.confirm_od_enter(&od, 100.0, &ctx).unwrap();
        assert_relative_eq!(w.get("USDT").unwrap().total(false), 100.0);

        ctx.prices.set_bar_price(sym, 150.0);
        od.update_profits(150.0);
        assert_relative_eq!(od.profit, -50.0);
        w.update_ods(&[od.clone()], "USDT", &ctx).unwrap();
        assert_relative_eq!(w.get("USDT").unwrap().unrealized_pol, -50.0);

        ctx.prices.set_bar_price(sym, 250.0);
        od.update_profits(250.0);
        let err = w.update_ods(&[od.clone()], "USDT", &ctx).unwrap_err();
        assert_eq!(err.kind, ErrKind::Liquidation);
        assert_eq!(w.get("USDT").unwrap().total(true), 0.0);
    }

    #[test]
    fn test_withdraw_legal() {
        let prices = PriceCache::new();
        let mut w = wallets(1000.0);
        w.withdraw_legal(200.0, None, &prices);
        let item = w.get("USDT").unwrap();
        assert_relative_eq!(item.available, 800.0);
        assert_relative_eq!(item.withdraw, 200.0);
        assert_relative_eq!(w.withdraw_legal_total(None, &prices), 200.0);
    }

    #[test]
    fn test_stake_pct_amount() {
        let prices = PriceCache::new();
        let w = wallets(1234.0);
        assert_relative_eq!(w.stake_pct_amount(5.0, 1.0, false, &prices), 60.0);
    }
}
