//! Local fill paths: bar simulation for backtests and book-ticker fills
//! for dry runs.

use tracing::{error, info, warn};

use super::OrderMgr;
use crate::engine::{lock_od, ExecMode, OdChange, OrderRef};
use crate::errors::{ErrKind, Result, TradeError};
use crate::exchange::BookTicker;
use crate::orders::{ExOrder, ExitTrigger, InOutOrder, InOutStatus, OdStatus, TriggerKind};
use crate::simulator::{get_exc_price, sim_market_price, sim_market_rate};
use crate::types::{exit_tag, split_symbol, tf_to_ms, Kline, OrderType, Side, MSG_STOP_ENTER_BARS};

/// Limit orders filled this soon after creation count as taker fills.
const LIMIT_AS_MARKET_MS: i64 = 60_000;
/// Book tickers older than this are fetched again.
const BOOK_CACHE_MS: i64 = 1_500;
/// Entries are blocked this long after a cleanup.
const NO_ENTER_AFTER_STOP_MS: i64 = 72 * 3_600_000;

/// Result of trying to fill an entry leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterFill {
    Filled,
    /// Closed without a position
    Dropped,
    /// Closed because the wallet could not pay
    LowFunds,
}

impl OrderMgr<'_> {
    // ========================================================================
    // Bar simulation
    // ========================================================================

    /// Fill orders of `symbol`/`tf` against a finished bar, expire stale limit
    /// entries and move finished orders to history.
    pub fn fill_pending_orders(&self, symbol: &str, tf: &str, bar: &Kline) -> Result<usize> {
        if self.eng.mode != ExecMode::Local {
            return Ok(0);
        }
        let mut num = 0;
        for od_ref in self.acc.open_orders() {
            {
                let od = lock_od(&od_ref);
                if od.symbol != symbol || od.timeframe != tf || od.status.is_done() {
                    continue;
                }
            }
            match self.fill_order(&od_ref, bar) {
                Ok(true) => num += 1,
                Ok(false) => {}
                Err(err) if err.kind.is_fatal() => {
                    self.eng.sweep_done(self.acc);
                    return Err(err);
                }
                Err(err) => error!(account = %self.acc.name, symbol, %err, "fill order fail"),
            }
        }
        self.expire_limit_entries(symbol, tf)?;
        self.eng.sweep_done(self.acc);
        Ok(num)
    }

    fn fill_order(&self, od_ref: &OrderRef, bar: &Kline) -> Result<bool> {
        let mut od = lock_od(od_ref);
        if od.status.is_done() {
            return Ok(false);
        }
        let exit_open = od.is_exiting() && od.exit.as_ref().map(|e| !e.is_closed()).unwrap_or(false);
        let sub = match (exit_open, od.exit.as_ref()) {
            (true, Some(exit)) => exit.clone(),
            _ if !od.enter.is_closed() => od.enter.clone(),
            _ => return self.try_fill_triggers(&mut od, bar, 0.0),
        };
        let tf_ms = tf_to_ms(&od.timeframe);
        let Some((price, fill_ms, rate)) = self.sim_fill(&sub, bar, tf_ms) else {
            return Ok(false);
        };
        let maker = sub.order_type.is_limit();
        if exit_open {
            self.fill_pending_exit(&mut od, price, fill_ms, maker)?;
            return Ok(true);
        }
        match self.fill_pending_enter(&mut od, price, fill_ms, maker)? {
            EnterFill::Filled => {
                self.try_fill_triggers(&mut od, bar, rate)?;
                Ok(true)
            }
            EnterFill::LowFunds => {
                drop(od);
                self.on_low_funds();
                Ok(false)
            }
            EnterFill::Dropped => Ok(false),
        }
    }

    /// Price, time and bar rate at which `sub` fills inside `bar`.
    fn sim_fill(&self, sub: &ExOrder, bar: &Kline, tf_ms: i64) -> Option<(f64, i64, f64)> {
        let tf = tf_ms as f64;
        if tf <= 0.0 {
            return None;
        }
        if !sub.order_type.is_limit() || sub.price <= 0.0 {
            let net_ms = (self.eng.ctx.config.bt_net_cost * 1000.0) as i64;
            let fill_ms = (sub.create_at + net_ms).max(bar.time);
            if fill_ms > bar.time + tf_ms {
                return None;
            }
            let rate = (fill_ms - bar.time) as f64 / tf;
            return Some((sim_market_price(bar, rate), fill_ms, rate));
        }
        let is_buy = sub.side == Side::Buy;
        let price = sub.price;
        if (is_buy && price < bar.low) || (!is_buy && price > bar.high) {
            return None;
        }
        let min_rate = ((sub.create_at - bar.time) as f64 / tf).max(0.0);
        if min_rate >= 1.0 {
            return None;
        }
        if min_rate == 0.0 && ((is_buy && price >= bar.open) || (!is_buy && price <= bar.open)) {
            return Some((bar.open, bar.time, 0.0));
        }
        let rate = sim_market_rate(bar, price, is_buy, false, min_rate);
        if rate < min_rate {
            return None;
        }
        Some((price, bar.time + (rate * tf) as i64, rate))
    }

    /// Reserve funds and mark the entry leg filled at `price`.
    pub fn fill_pending_enter(&self, od: &mut InOutOrder, price: f64, fill_ms: i64, maker: bool) -> Result<EnterFill> {
        let ctx = &self.eng.ctx;
        let ex = ctx.exchange.as_ref();
        let reserved = self.acc.lock_wallets().enter_od(od, ctx);
        if let Err(err) = reserved {
            if !err.is(ErrKind::LowFunds) {
                return Err(err);
            }
            warn!(account = %self.acc.name, order = %od.key(), %err, "low funds, drop entry");
            od.local_exit(ex, fill_ms, exit_tag::FORCE_EXIT, price, None, &err.msg, None)?;
            self.eng.save_od(od);
            self.eng.fire(&self.acc.name, od, OdChange::ExitFill);
            return Ok(EnterFill::LowFunds);
        }
        let price = ex.prec_price(&od.symbol, price)?;
        if od.enter.amount == 0.0 {
            let amount = if price > 0.0 {
                ex.prec_amount(&od.symbol, od.quote_cost / price)?
            } else {
                0.0
            };
            if amount == 0.0 {
                self.acc.misc().zero_amts += 1;
                od.local_exit(ex, fill_ms, exit_tag::FATAL_ERR, price, None, "amount is zero", None)?;
                let key = od.key();
                let (base, quote) = crate::wallet::Wallets::pair_coins(&od.symbol);
                {
                    let mut wallets = self.acc.lock_wallets();
                    wallets.cancel(&key, &quote, 0.0, true);
                    wallets.cancel(&key, &base, 0.0, true);
                }
                self.eng.save_od(od);
                self.eng.fire(&self.acc.name, od, OdChange::ExitFill);
                return Ok(EnterFill::Dropped);
            }
            od.enter.amount = amount;
        }
        if od.init_price == 0.0 {
            od.init_price = price;
        }
        let enter = &mut od.enter;
        if enter.price <= 0.0 || !enter.order_type.is_limit() {
            enter.price = price;
        }
        enter.average = price;
        enter.filled = enter.amount;
        enter.status = OdStatus::Closed;
        enter.update_at = fill_ms;
        if enter.order_type.is_limit() && fill_ms - enter.create_at < LIMIT_AS_MARKET_MS {
            enter.order_type = OrderType::Market;
        }
        od.dirty_enter = true;
        od.update_fee(ex, price, true, maker)?;
        od.status = InOutStatus::FullEnter;
        od.dirty_main = true;
        self.acc.lock_wallets().confirm_od_enter(od, price, ctx)?;
        od.update_profits(price);
        self.eng.save_od(od);
        self.eng.fire(&self.acc.name, od, OdChange::EnterFill);
        Ok(EnterFill::Filled)
    }

    /// Mark the exit leg filled at `price` and settle the wallet.
    pub fn fill_pending_exit(&self, od: &mut InOutOrder, price: f64, fill_ms: i64, maker: bool) -> Result<()> {
        let ctx = &self.eng.ctx;
        let ex = ctx.exchange.as_ref();
        let hold = od.enter.filled;
        self.acc.lock_wallets().exit_od(od, hold, ctx)?;
        let price = ex.prec_price(&od.symbol, price)?;
        let Some(exit) = od.exit.as_mut() else {
            return Err(TradeError::internal(format!("no exit leg to fill: {}", od.key())));
        };
        if exit.price <= 0.0 || !exit.order_type.is_limit() {
            exit.price = price;
        }
        if exit.amount == 0.0 {
            exit.amount = hold;
        }
        exit.average = price;
        exit.filled = exit.amount;
        exit.status = OdStatus::Closed;
        exit.update_at = fill_ms;
        if exit.order_type.is_limit() && fill_ms - exit.create_at < LIMIT_AS_MARKET_MS {
            exit.order_type = OrderType::Market;
        }
        od.dirty_exit = true;
        od.update_fee(ex, price, false, maker)?;
        od.status = InOutStatus::FullExit;
        od.update_profits(price);
        self.acc.lock_wallets().confirm_od_exit(od, price, ctx)?;
        self.eng.save_od(od);
        self.eng.fire(&self.acc.name, od, OdChange::ExitFill);
        self.after_exit(od);
        Ok(())
    }

    /// Exit through a stop loss or take profit touched inside `bar`.
    ///
    /// `after` is the bar rate from which the path may touch the trigger,
    /// i.e. the entry fill rate for orders entered within this bar.
    pub fn try_fill_triggers(&self, od: &mut InOutOrder, bar: &Kline, after: f64) -> Result<bool> {
        if od.status < InOutStatus::FullEnter || od.status.is_done() || od.is_exiting() {
            return Ok(false);
        }
        let short = od.short;
        let is_buy = short;
        let mut hits: Vec<(TriggerKind, ExitTrigger, f64, bool)> = Vec::new();
        for kind in [TriggerKind::StopLoss, TriggerKind::TakeProfit] {
            let Some(state) = od.trigger(kind) else {
                continue;
            };
            if !state.is_active() || state.hit {
                continue;
            }
            let trig = state.trigger.clone();
            let p = trig.price;
            let (hit, gap) = match (kind, short) {
                (TriggerKind::StopLoss, false) => (bar.low <= p, bar.open <= p),
                (TriggerKind::StopLoss, true) => (bar.high >= p, bar.open >= p),
                (TriggerKind::TakeProfit, false) => (bar.high >= p, bar.open >= p),
                (TriggerKind::TakeProfit, true) => (bar.low <= p, bar.open <= p),
            };
            if !hit {
                continue;
            }
            let gap = gap && after <= 0.0;
            let touch = if gap { 0.0 } else { sim_market_rate(bar, p, is_buy, true, after) };
            if touch < after {
                continue;
            }
            hits.push((kind, trig, touch, gap));
        }
        let Some((kind, trig, touch, gap)) = hits.into_iter().min_by(|a, b| a.2.total_cmp(&b.2)) else {
            return Ok(false);
        };
        let tf_ms = tf_to_ms(&od.timeframe);
        let (price, rate, od_type) = if gap {
            (bar.open, 0.0, OrderType::Market)
        } else {
            let mut fill = get_exc_price(short, bar, trig.price, trig.limit, after, tf_ms / 1000);
            if kind == TriggerKind::TakeProfit && fill == 0.0 && trig.limit > 0.0 {
                fill = trig.limit;
            }
            if fill < 0.0 {
                return Ok(false);
            }
            if fill > 0.0 {
                let rate = sim_market_rate(bar, fill, is_buy, true, touch);
                (fill, rate, OrderType::Limit)
            } else {
                (sim_market_price(bar, touch), touch, OrderType::Market)
            }
        };
        let mut tag = if trig.tag.is_empty() {
            match kind {
                TriggerKind::StopLoss => exit_tag::STOP_LOSS.to_string(),
                TriggerKind::TakeProfit => exit_tag::TAKE_PROFIT.to_string(),
            }
        } else {
            trig.tag.clone()
        };
        if tag == exit_tag::STOP_LOSS && od.calc_profit(price).unwrap_or(-1.0) >= 0.0 {
            tag = exit_tag::SL_TAKE.to_string();
        }
        let exit_at = bar.time + (rate * tf_ms as f64) as i64;
        if trig.is_partial() {
            let mut part = self.cut_order(od, trig.rate, 0.0);
            od.set_exit_trigger(kind, None);
            self.eng.save_od(od);
            if let Some(state) = part.trigger_mut(kind) {
                state.hit = true;
            }
            self.eng.save_od(&mut part);
            self.eng.fire(&self.acc.name, &part, OdChange::New);
            self.exit_by_trigger(&mut part, &tag, price, exit_at, od_type)?;
            self.eng.add_hist(part);
        } else {
            if let Some(state) = od.trigger_mut(kind) {
                state.hit = true;
            }
            self.exit_by_trigger(od, &tag, price, exit_at, od_type)?;
        }
        Ok(true)
    }

    fn exit_by_trigger(&self, od: &mut InOutOrder, tag: &str, price: f64, exit_at: i64, od_type: OrderType) -> Result<()> {
        let ctx = &self.eng.ctx;
        let hold = od.enter.filled;
        self.acc.lock_wallets().exit_od(od, hold, ctx)?;
        od.local_exit(ctx.exchange.as_ref(), exit_at, tag, price, None, "", Some(od_type))?;
        self.acc.lock_wallets().confirm_od_exit(od, price, ctx)?;
        od.dirty_info = true;
        self.eng.save_od(od);
        self.eng.fire(&self.acc.name, od, OdChange::ExitFill);
        self.after_exit(od);
        Ok(())
    }

    /// Force-exit limit entries still waiting past their deadline.
    fn expire_limit_entries(&self, symbol: &str, tf: &str) -> Result<()> {
        let now = self.eng.now_ms();
        for od_ref in self.acc.open_orders() {
            let mut od = lock_od(&od_ref);
            let stop_after = od.info.stop_after;
            if od.symbol != symbol
                || od.timeframe != tf
                || od.status != InOutStatus::Init
                || od.enter.price <= 0.0
                || !od.enter.order_type.is_limit()
                || stop_after <= 0
                || stop_after > now
            {
                continue;
            }
            let price = od.init_price;
            self.close_local(&mut od, exit_tag::FORCE_EXIT, price, MSG_STOP_ENTER_BARS, None, stop_after)?;
        }
        Ok(())
    }

    /// Stop the run when nothing is held and the wallet is under the minimum stake.
    fn on_low_funds(&self) {
        let ctx = &self.eng.ctx;
        let holding = self
            .acc
            .open_snapshots(|o| o.status >= InOutStatus::PartEnter && !o.status.is_done())
            .len();
        if holding > 0 {
            return;
        }
        let legal = self.acc.lock_wallets().total_legal(None, false, &ctx.prices);
        if legal < ctx.config.min_stake_amount {
            warn!(account = %self.acc.name, legal, "wallet below min stake with no position, stop");
            self.eng.set_bot_running(false);
        }
    }

    // ========================================================================
    // Per-bar marking
    // ========================================================================

    /// Mark open orders of `symbol` to the bar close and, for contracts,
    /// refresh margins. A liquidation closes every order of the settle coin.
    pub fn update_by_bar(&self, symbol: &str, bar: &Kline) -> Result<()> {
        let ctx = &self.eng.ctx;
        if ctx.env_real() {
            return Ok(());
        }
        for od_ref in self.acc.open_orders() {
            let mut od = lock_od(&od_ref);
            if od.symbol == symbol && od.status < InOutStatus::FullExit {
                od.update_profits(bar.close);
            }
        }
        if !ctx.is_contract() {
            return Ok(());
        }
        let ods = self
            .acc
            .open_snapshots(|o| o.enter.filled > 0.0 && !o.status.is_done());
        let mut coins: Vec<String> = ods.iter().map(|o| split_symbol(&o.symbol).settle).collect();
        coins.sort();
        coins.dedup();
        for coin in coins {
            let group: Vec<InOutOrder> = ods
                .iter()
                .filter(|o| split_symbol(&o.symbol).settle == coin)
                .cloned()
                .collect();
            let res = self.acc.lock_wallets().update_ods(&group, &coin, ctx);
            match res {
                Ok(()) => {}
                Err(err) if err.is(ErrKind::Liquidation) => self.on_liquidation(&coin)?,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn on_liquidation(&self, coin: &str) -> Result<()> {
        let ctx = &self.eng.ctx;
        let now = ctx.now_ms();
        warn!(account = %self.acc.name, coin, at = now, "wallet liquidated");
        for od_ref in self.acc.open_orders() {
            let mut od = lock_od(&od_ref);
            if od.status.is_done() || split_symbol(&od.symbol).settle != coin {
                continue;
            }
            let spot = ctx.prices.get(&od.symbol);
            od.local_exit(ctx.exchange.as_ref(), now, exit_tag::LIQUIDATION, 0.0, spot, "", None)?;
            self.eng.save_od(&mut od);
            self.eng.fire(&self.acc.name, &od, OdChange::ExitFill);
        }
        let mut wallets = self.acc.lock_wallets();
        wallets.get_mut(coin).reset();
        if ctx.config.charge_on_bomb {
            let amount = ctx.config.wallet_amounts.get(coin).copied().unwrap_or(0.0);
            wallets.get_mut(coin).available = amount;
            let legal = amount * ctx.prices.get(coin).unwrap_or(1.0);
            drop(wallets);
            self.acc.misc().total_invest += legal;
            info!(account = %self.acc.name, coin, amount, "wallet refilled after liquidation");
        } else {
            drop(wallets);
            self.eng.set_bot_running(false);
        }
        self.eng.sweep_done(self.acc);
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close everything at bot stop and block new entries for a while.
    pub fn cleanup(&self) -> Result<()> {
        let ctx = &self.eng.ctx;
        let now = ctx.now_ms();
        for od_ref in self.acc.open_orders() {
            let mut od = lock_od(&od_ref);
            if od.status.is_done() {
                continue;
            }
            let spot = ctx.prices.get(&od.symbol);
            let exit_open = od.is_exiting() && od.exit.as_ref().map(|e| !e.is_closed()).unwrap_or(false);
            if exit_open && od.enter.filled > 0.0 && self.eng.mode != ExecMode::Live {
                let price = od.fallback_price(spot);
                self.fill_pending_exit(&mut od, price, now, false)?;
            } else if self.eng.mode == ExecMode::Live {
                drop(od);
                let req = crate::strategies::ExitReq::new(exit_tag::BOT_STOP).forced();
                self.exit_order(&od_ref, &req, 1.0)?;
                continue;
            } else {
                self.close_local(&mut od, exit_tag::BOT_STOP, 0.0, "", None, now)?;
            }
            if od.exit_at > now {
                od.exit_at = now;
                od.dirty_main = true;
                self.eng.save_od(&mut od);
            }
        }
        self.acc.set_no_enter_until(now + NO_ENTER_AFTER_STOP_MS);
        let zero_amts = std::mem::take(&mut self.acc.misc().zero_amts);
        if zero_amts > 0 {
            warn!(account = %self.acc.name, num = zero_amts, "entries dropped for zero amount");
        }
        {
            let mut wallets = self.acc.lock_wallets();
            for item in wallets.items.values_mut() {
                item.unrealized_pol = 0.0;
                item.used_upol = 0.0;
            }
        }
        self.eng.sweep_done(self.acc);
        self.eng.retain_filled_hist();
        Ok(())
    }

    /// A pair left the universe: close its local orders or queue live exits.
    pub fn on_env_end(&self, symbol: &str, tf: &str) -> Result<usize> {
        let now = self.eng.now_ms();
        let mut num = 0;
        for od_ref in self.acc.open_orders() {
            let mut od = lock_od(&od_ref);
            if od.symbol != symbol || od.timeframe != tf || od.status.is_done() {
                continue;
            }
            num += 1;
            if self.eng.mode == ExecMode::Live {
                drop(od);
                let req = crate::strategies::ExitReq::new(exit_tag::ENV_END).forced();
                self.exit_order(&od_ref, &req, 1.0)?;
            } else {
                self.close_local(&mut od, exit_tag::ENV_END, 0.0, "", None, now)?;
            }
        }
        self.eng.sweep_done(self.acc);
        Ok(num)
    }

    // ========================================================================
    // Book-ticker fills
    // ========================================================================

    fn book_for(&self, symbol: &str) -> Result<Option<BookTicker>> {
        let ctx = &self.eng.ctx;
        let now = ctx.now_ms();
        if let Some((book, at)) = ctx.prices.book(symbol) {
            if now - at <= BOOK_CACHE_MS {
                return Ok(Some(book));
            }
        }
        let books = ctx.exchange.fetch_book_tickers()?;
        for (sym, book) in books.iter() {
            ctx.prices.set_book(sym, *book, now);
        }
        Ok(books.get(symbol).copied())
    }

    /// Fill the active leg against the best bid/ask. Limit orders fill only
    /// when the book crosses them.
    pub fn fill_by_book(&self, od_ref: &OrderRef) -> Result<bool> {
        let ctx = &self.eng.ctx;
        let now = ctx.now_ms();
        let mut od = lock_od(od_ref);
        if od.status.is_done() {
            return Ok(false);
        }
        let exit_open = od.is_exiting() && od.exit.as_ref().map(|e| !e.is_closed()).unwrap_or(false);
        let sub = match (exit_open, od.exit.as_ref()) {
            (true, Some(exit)) => exit.clone(),
            _ if !od.enter.is_closed() => od.enter.clone(),
            _ => return Ok(false),
        };
        let Some(book) = self.book_for(&od.symbol)? else {
            return Ok(false);
        };
        let is_buy = sub.side == Side::Buy;
        let best = if is_buy { book.ask } else { book.bid };
        if best <= 0.0 {
            return Ok(false);
        }
        let limited = sub.order_type.is_limit() && sub.price > 0.0;
        if limited && ((is_buy && sub.price < best) || (!is_buy && sub.price > best)) {
            return Ok(false);
        }
        let maker = limited && ctx.prices.is_maker(&od.symbol, sub.side, sub.price);
        if exit_open {
            self.fill_pending_exit(&mut od, best, now, maker)?;
        } else if self.fill_pending_enter(&mut od, best, now, maker)? == EnterFill::LowFunds {
            drop(od);
            self.on_low_funds();
            return Ok(false);
        }
        Ok(true)
    }

    /// Retry waiting limit entries of `symbol` after a book update.
    pub fn check_book_triggers(&self, symbol: &str) -> Result<usize> {
        let mut num = 0;
        for od_ref in self.acc.take_triggers(symbol) {
            if self.fill_by_book(&od_ref)? {
                num += 1;
                continue;
            }
            let (id, done) = {
                let od = lock_od(&od_ref);
                (od.id, od.status.is_done())
            };
            if !done {
                self.acc.add_trigger(symbol, id, od_ref);
            }
        }
        if num > 0 {
            self.eng.sweep_done(self.acc);
        }
        Ok(num)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine_with, env_at, long_req, H};
    use super::*;
    use crate::config::MarketType;
    use crate::engine::Engine;
    use crate::orders::ExitTrigger;
    use crate::strategies::ExitReq;
    use approx::assert_relative_eq;

    fn bar(time: i64, o: f64, h: f64, l: f64, c: f64) -> Kline {
        Kline::new(time, o, h, l, c, 10.0)
    }

    fn open_long(eng: &Engine, cost: f64) -> OrderRef {
        let mgr = OrderMgr::new(eng, "default").unwrap();
        mgr.enter_order(&env_at(100.0, 0), &long_req(cost), false).unwrap().unwrap()
    }

    fn set_bar(eng: &Engine, b: &Kline) {
        eng.ctx.prices.set_bar_price("BTC/USDT", b.close);
        eng.ctx.clock.set(b.time + H);
    }

    #[test]
    fn test_market_entry_fills_after_open() {
        let eng = engine_with(|_| {});
        let od = open_long(&eng, 100.0);
        let b = bar(H, 100.0, 110.0, 95.0, 108.0);
        set_bar(&eng, &b);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        assert_eq!(mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap(), 1);
        let od = lock_od(&od);
        assert_eq!(od.status, InOutStatus::FullEnter);
        let expect = sim_market_price(&b, 3.0 / 3600.0);
        assert_relative_eq!(od.enter.average, expect, epsilon = 1e-6);
        assert_eq!(od.enter.update_at, H + 3000);
        assert_relative_eq!(od.enter.filled, 100.0 / expect, epsilon = 1e-6);
        let w = mgr.acc.lock_wallets();
        assert_relative_eq!(w.get("USDT").unwrap().available, 900.0, epsilon = 1e-6);
    }

    #[test]
    fn test_limit_entry_times_out() {
        let eng = engine_with(|c| c.stop_enter_bars = 3);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let req = long_req(100.0).with_limit(90.0);
        mgr.enter_order(&env_at(100.0, 0), &req, false).unwrap();
        for i in 1..=3 {
            let b = bar(i * H, 100.0, 101.0, 95.0, 100.0);
            set_bar(&eng, &b);
            mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        }
        assert_eq!(mgr.acc.open_count(), 0);
        let hist = eng.hist_orders();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].exit_tag, exit_tag::FORCE_EXIT);
        assert_eq!(hist[0].info.status_msg, MSG_STOP_ENTER_BARS);
        assert_eq!(hist[0].exit_at, H + 3 * H);
        let w = mgr.acc.lock_wallets();
        assert_relative_eq!(w.get("USDT").unwrap().available, 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_limit_entry_fills_on_touch() {
        let eng = engine_with(|_| {});
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let req = long_req(100.0).with_limit(96.0);
        let od = mgr.enter_order(&env_at(100.0, 0), &req, false).unwrap().unwrap();
        let b = bar(H, 100.0, 101.0, 95.0, 99.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        let od = lock_od(&od);
        assert_eq!(od.status, InOutStatus::FullEnter);
        assert_eq!(od.enter.average, 96.0);
        let rate = sim_market_rate(&b, 96.0, true, false, 0.0);
        assert_eq!(od.enter.update_at, H + (rate * H as f64) as i64);
    }

    #[test]
    fn test_stop_loss_inside_entry_bar() {
        let eng = engine_with(|_| {});
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let req = long_req(100.0).with_stop_loss(94.0, 0.0);
        mgr.enter_order(&env_at(100.0, 0), &req, false).unwrap();
        let b = bar(H, 100.0, 101.0, 93.0, 95.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        let hist = eng.hist_orders();
        assert_eq!(hist.len(), 1);
        let od = &hist[0];
        assert_eq!(od.exit_tag, exit_tag::STOP_LOSS);
        let rate = sim_market_rate(&b, 94.0, false, true, 3.0 / 3600.0);
        assert_eq!(od.exit_at, H + (rate * H as f64) as i64);
        assert!(od.profit < 0.0);
    }

    #[test]
    fn test_partial_take_profit_splits() {
        let eng = engine_with(|_| {});
        let od = open_long(&eng, 100.0);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let b = bar(H, 100.0, 101.0, 99.0, 100.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        let filled = lock_od(&od).enter.filled;
        lock_od(&od).set_take_profit(Some(ExitTrigger::new(105.0).with_rate(0.5)));
        let b = bar(2 * H, 100.0, 106.0, 99.0, 104.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        let hist = eng.hist_orders();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].exit_tag, exit_tag::TAKE_PROFIT);
        assert_relative_eq!(hist[0].enter.filled, filled * 0.5, epsilon = 1e-9);
        let od = lock_od(&od);
        assert_relative_eq!(od.enter.filled, filled * 0.5, epsilon = 1e-9);
        assert!(od.take_profit().is_none());
        assert_eq!(od.status, InOutStatus::FullEnter);
    }

    #[test]
    fn test_partial_exit_request_conserves_amount() {
        let eng = engine_with(|_| {});
        let od = open_long(&eng, 100.0);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let b = bar(H, 100.0, 101.0, 99.0, 100.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        let total = lock_od(&od).enter.filled;
        let res = mgr.exit_open_orders(&[], &ExitReq::new("half").with_rate(0.5).forced()).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(mgr.acc.open_count(), 2);
        let sum: f64 = mgr.acc.open_snapshots(|_| true).iter().map(|o| o.enter.filled).sum();
        assert_relative_eq!(sum, total, epsilon = 1e-9);
    }

    fn kinds_of(evs: &[crate::engine::OdEvent], id: i64) -> Vec<OdChange> {
        evs.iter().filter(|ev| ev.order.id == id).map(|ev| ev.kind).collect()
    }

    #[test]
    fn test_trigger_part_announced_before_exit() {
        let eng = engine_with(|_| {});
        let od = open_long(&eng, 100.0);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let b = bar(H, 100.0, 101.0, 99.0, 100.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        lock_od(&od).set_stop_loss(Some(ExitTrigger::new(95.0).with_rate(0.4)));
        eng.take_events();
        let b = bar(2 * H, 100.0, 101.0, 94.0, 96.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        let hist = eng.hist_orders();
        assert_eq!(hist.len(), 1);
        let part_id = hist[0].id;
        assert_ne!(part_id, lock_od(&od).id);
        let evs = eng.take_events();
        assert_eq!(kinds_of(&evs, part_id), vec![OdChange::New, OdChange::ExitFill]);
    }

    #[test]
    fn test_exit_part_announced() {
        let eng = engine_with(|_| {});
        let od = open_long(&eng, 100.0);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let b = bar(H, 100.0, 101.0, 99.0, 100.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        eng.take_events();
        let res = mgr.exit_open_orders(&[], &ExitReq::new("half").with_rate(0.5).forced()).unwrap();
        let part_id = lock_od(&res[0]).id;
        assert_ne!(part_id, lock_od(&od).id);
        let evs = eng.take_events();
        assert_eq!(kinds_of(&evs, part_id), vec![OdChange::New, OdChange::Exit]);
    }

    #[test]
    fn test_cleanup_closes_everything() {
        let eng = engine_with(|_| {});
        open_long(&eng, 100.0);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let b = bar(H, 100.0, 101.0, 99.0, 100.0);
        set_bar(&eng, &b);
        mgr.fill_pending_orders("BTC/USDT", "1h", &b).unwrap();
        mgr.cleanup().unwrap();
        assert_eq!(mgr.acc.open_count(), 0);
        let hist = eng.hist_orders();
        assert_eq!(hist[0].exit_tag, exit_tag::BOT_STOP);
        assert!(mgr.acc.no_enter_until() > eng.now_ms());
    }

    #[test]
    fn test_liquidation_stops_without_refill() {
        let eng = engine_with(|c| {
            c.market_type = MarketType::Linear;
            c.leverage = 10.0;
            c.wallet_amounts.clear();
            c.wallet_amounts.insert("USDT".into(), 100.0);
        });
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let mut env = BarEnvHelper::contract(100.0);
        let od = mgr
            .enter_order(&env.env, &long_req(900.0), false)
            .unwrap()
            .unwrap();
        env.next(&eng, bar(H, 100.0, 100.5, 99.5, 100.0));
        mgr.fill_pending_orders(&env.env.symbol, "1h", &env.last).unwrap();
        assert_eq!(lock_od(&od).status, InOutStatus::FullEnter);
        env.next(&eng, bar(2 * H, 100.0, 100.0, 60.0, 60.0));
        mgr.update_by_bar(&env.env.symbol, &env.last).unwrap();
        assert!(!eng.bot_running());
        assert_eq!(mgr.acc.open_count(), 0);
        assert_eq!(eng.hist_orders()[0].exit_tag, exit_tag::LIQUIDATION);
    }

    struct BarEnvHelper {
        env: crate::scheduler::env::BarEnv,
        last: Kline,
    }

    impl BarEnvHelper {
        fn contract(price: f64) -> Self {
            let mut env = crate::scheduler::env::BarEnv::new("BTC/USDT:USDT", "1h", 1, 50);
            let last = bar(0, price, price, price, price);
            env.push(last).unwrap();
            Self { env, last }
        }

        fn next(&mut self, eng: &Engine, b: Kline) {
            self.env.push(b).unwrap();
            self.last = b;
            eng.ctx.prices.set_bar_price(&self.env.symbol, b.close);
            eng.ctx.clock.set(b.time + H);
        }
    }
}
