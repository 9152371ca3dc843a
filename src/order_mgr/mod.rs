//! Order manager
//!
//! Turns strategy requests into [`InOutOrder`]s, gates new entries, matches
//! exit requests against open orders and routes orders to a fill path:
//! - `local`: simulated against bars (backtests)
//! - `live`: queued for the exchange worker
//!
//! A [`OrderMgr`] is a cheap view over one account of an [`Engine`].

pub mod live;
pub mod local;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LowCostAction;
use crate::engine::{lock_od, AccountState, Engine, ExecMode, OdChange, OrderRef};
use crate::errors::{ErrKind, FailOpen, Result, TradeError};
use crate::orders::{ExitTrigger, InOutOrder, TriggerKind};
use crate::runtime::RunMode;
use crate::scheduler::env::BarEnv;
use crate::strategies::{EnterReq, ExitReq};
use crate::types::{exit_tag, OrderType, AMT_DUST};
use crate::wallet::Wallets;

use self::live::OdAction;

/// Exit rates at or above this close the whole order.
const FULL_EXIT_RATE: f64 = 0.99;
/// Exit allocations below this share of an order are ignored.
const EXIT_DUST_RATE: f64 = 0.01;
/// Live bars older than this share of their timeframe reject entries.
const MAX_BAR_DELAY_RATE: f64 = 0.8;

/// Pending change to an open order's working prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    LimitEnter,
    LimitExit,
    StopLoss,
    TakeProfit,
}

impl EditAction {
    fn live_action(&self) -> OdAction {
        match self {
            EditAction::LimitEnter => OdAction::LimitEnter,
            EditAction::LimitExit => OdAction::LimitExit,
            EditAction::StopLoss => OdAction::StopLoss,
            EditAction::TakeProfit => OdAction::TakeProfit,
        }
    }
}

#[derive(Clone)]
pub struct OdEdit {
    pub od: OrderRef,
    pub action: EditAction,
}

pub struct OrderMgr<'a> {
    pub eng: &'a Engine,
    pub acc: &'a Arc<AccountState>,
}

impl<'a> OrderMgr<'a> {
    pub fn new(eng: &'a Engine, account: &str) -> Result<Self> {
        Ok(Self {
            eng,
            acc: eng.account(account)?,
        })
    }

    fn account(&self) -> &str {
        &self.acc.name
    }

    // ========================================================================
    // Entry gate
    // ========================================================================

    /// Drop entries that may not open now, counting each rejection.
    pub fn allow_order_enter(&self, env: &BarEnv, enters: Vec<EnterReq>) -> Vec<EnterReq> {
        if enters.is_empty() {
            return enters;
        }
        let ctx = &self.eng.ctx;
        let now = ctx.now_ms();
        let num = enters.len();
        if self.eng.pair_banned_until(&env.symbol) > now {
            self.acc.add_fail_opens(FailOpen::PairBanned, num);
            return Vec::new();
        }
        if ctx.run_mode == RunMode::Other {
            return Vec::new();
        }
        if self.acc.no_enter_until() > now {
            self.acc.add_fail_opens(FailOpen::NoEntry, num);
            return Vec::new();
        }
        if ctx.is_live() && env.tf_ms > 0 {
            let delay = (now - env.time_stop) as f64 / env.tf_ms as f64;
            if delay > MAX_BAR_DELAY_RATE {
                warn!(symbol = %env.symbol, tf = %env.timeframe, delay, "bar too late, skip entries");
                self.acc.add_fail_opens(FailOpen::BarTooLate, num);
                return Vec::new();
            }
        }
        let cfg = &ctx.config;
        let max_open = cfg.account_max_open_orders(self.account());
        let open_ods = self.acc.open_snapshots(|_| true);
        let mut misc = self.acc.misc();
        if misc.simul.bar_ms != env.time_stop {
            misc.simul = Default::default();
            misc.simul.bar_ms = env.time_stop;
        }
        let mut open_num = open_ods.len();
        let mut res = Vec::with_capacity(num);
        for req in enters {
            if max_open > 0 && open_num >= max_open {
                self.acc.add_fail_open(FailOpen::NumLimit);
                continue;
            }
            if cfg.max_simul_open > 0 && misc.simul.total >= cfg.max_simul_open {
                self.acc.add_fail_open(FailOpen::NumLimit);
                continue;
            }
            if let Some(pol) = cfg.policy(&req.strat_name) {
                if pol.max_open > 0 {
                    let num = open_ods.iter().filter(|od| od.strategy == req.strat_name).count()
                        + res.iter().filter(|r: &&EnterReq| r.strat_name == req.strat_name).count();
                    if num >= pol.max_open {
                        self.acc.add_fail_open(FailOpen::NumLimitPol);
                        continue;
                    }
                }
                if pol.max_simul_open > 0 {
                    let num = misc.simul.by_policy.get(&req.strat_name).copied().unwrap_or(0);
                    if num >= pol.max_simul_open {
                        self.acc.add_fail_open(FailOpen::NumLimitPol);
                        continue;
                    }
                }
            }
            misc.simul.total += 1;
            *misc.simul.by_policy.entry(req.strat_name.clone()).or_insert(0) += 1;
            open_num += 1;
            res.push(req);
        }
        res
    }

    // ========================================================================
    // Per-bar entry point
    // ========================================================================

    /// Apply one bar's requests: exits first, then entries, then edits.
    pub fn process_orders(
        &self,
        env: &BarEnv,
        enters: Vec<EnterReq>,
        exits: Vec<ExitReq>,
        edits: Vec<OdEdit>,
    ) -> Result<(Vec<OrderRef>, Vec<OrderRef>)> {
        let mut new_exits = Vec::new();
        for req in exits.iter() {
            match self.exit_open_orders(&[env.symbol.clone()], req) {
                Ok(ods) => new_exits.extend(ods),
                Err(err) => warn!(symbol = %env.symbol, tag = %req.tag, %err, "exit orders fail"),
            }
        }
        let mut new_enters = Vec::new();
        for req in self.allow_order_enter(env, enters) {
            match self.enter_order(env, &req, false) {
                Ok(Some(od)) => new_enters.push(od),
                Ok(None) => {}
                Err(err) => warn!(symbol = %env.symbol, tag = %req.tag, %err, "enter order fail"),
            }
        }
        for edit in edits {
            self.edit_order(edit);
        }
        Ok((new_enters, new_exits))
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Build and register an entry. With `do_check` the entry gate runs first
    /// and `None` is returned when it rejects.
    pub fn enter_order(&self, env: &BarEnv, req: &EnterReq, do_check: bool) -> Result<Option<OrderRef>> {
        let ctx = &self.eng.ctx;
        let cfg = &ctx.config;
        let contract = ctx.is_contract();
        if req.short && !contract {
            return Err(TradeError::new(
                ErrKind::Unsupported,
                format!("short is not supported in spot: {} {}", env.symbol, req.tag),
            ));
        }
        if do_check && self.allow_order_enter(env, vec![req.clone()]).is_empty() {
            return Ok(None);
        }
        let price = env.close();
        let leverage = if req.leverage > 0.0 {
            req.leverage
        } else if contract {
            cfg.account_leverage(self.account())
        } else {
            1.0
        };
        let now = ctx.now_ms();
        let od_type = match req.order_type {
            Some(t) => t,
            None if req.limit > 0.0 => OrderType::Limit,
            None => cfg.order_type,
        };
        let mut od = InOutOrder::new(
            ctx.task_id,
            &env.symbol,
            env.sid,
            &env.timeframe,
            &req.strat_name,
            req.short,
            &req.tag,
            now,
            od_type,
        );
        od.leverage = leverage;
        od.init_price = price;
        if od_type.is_limit() && req.limit > 0.0 {
            od.enter.price = req.limit;
            od.init_price = req.limit;
        }
        od.enter.amount = req.amount;

        let mut legal_cost = req.legal_cost;
        if req.amount > 0.0 {
            let at = if od.enter.price > 0.0 { od.enter.price } else { price };
            legal_cost = req.amount * at;
        }
        let min_cost = cfg.min_stake_amount;
        if legal_cost < min_cost {
            let rate = if min_cost > 0.0 { legal_cost / min_cost } else { 1.0 };
            let keep = match cfg.low_cost_action {
                LowCostAction::KeepBig => rate > 0.4,
                LowCostAction::KeepAll => true,
                LowCostAction::Reject => false,
            };
            if !keep {
                self.acc.add_fail_open(FailOpen::CostTooLess);
                return Err(TradeError::new(
                    ErrKind::InvalidCost,
                    format!("legal cost {:.4} under min stake {}: {}", legal_cost, min_cost, od.key()),
                ));
            }
            legal_cost = min_cost * 1.1;
            if od.enter.amount > 0.0 {
                let at = if od.enter.price > 0.0 { od.enter.price } else { price };
                od.enter.amount = legal_cost / at;
            }
        }
        // Legal cost is notional; the wallet books `legal / leverage` as margin on fill.
        od.info.legal_cost = legal_cost;
        od.quote_cost = legal_cost;
        od.info.client_id = req.client_id.clone();
        od.info.extra = req.infos.clone();
        od.dirty_info = true;

        if req.stop_loss > 0.0 {
            od.set_stop_loss(Some(
                ExitTrigger::new(req.stop_loss)
                    .with_limit(req.sl_limit)
                    .with_rate(req.stop_loss_rate)
                    .with_tag(&req.stop_loss_tag),
            ));
        }
        if req.take_profit > 0.0 {
            od.set_take_profit(Some(
                ExitTrigger::new(req.take_profit)
                    .with_limit(req.tp_limit)
                    .with_rate(req.take_profit_rate)
                    .with_tag(&req.take_profit_tag),
            ));
        }
        if od_type.is_limit() && od.enter.price > 0.0 {
            let bars = if req.stop_bars > 0 { req.stop_bars } else { cfg.stop_enter_bars };
            if bars > 0 {
                od.info.stop_after = now + bars * env.tf_ms;
            }
        }
        if req.log {
            info!(account = self.account(), order = %od.key(), cost = legal_cost, "enter order");
        }
        let od_ref = self.eng.register_open(self.acc, od);
        {
            let od = lock_od(&od_ref);
            self.eng.fire(self.account(), &od, OdChange::New);
        }
        match self.eng.mode {
            ExecMode::Live => self.queue(&od_ref, OdAction::Enter),
            ExecMode::LocalLive => {
                if !self.fill_by_book(&od_ref)? {
                    let id = lock_od(&od_ref).id;
                    self.acc.add_trigger(&env.symbol, id, od_ref.clone());
                }
            }
            ExecMode::Local => {}
        }
        Ok(Some(od_ref))
    }

    // ========================================================================
    // Exits
    // ========================================================================

    /// Exit open orders matching `req`, splitting orders when only part of
    /// their amount is requested.
    pub fn exit_open_orders(&self, pairs: &[String], req: &ExitReq) -> Result<Vec<OrderRef>> {
        if req.exit_rate > 1.0 {
            return Err(TradeError::param(format!("exit rate should be in (0, 1], got {}", req.exit_rate)));
        }
        let now = self.eng.now_ms();
        let mut matched: Vec<(OrderRef, f64, f64, f64)> = Vec::new();
        for od_ref in self.acc.open_orders() {
            let od = lock_od(&od_ref);
            if req.order_id > 0 {
                if od.id != req.order_id {
                    continue;
                }
            } else {
                if !pairs.is_empty() && !pairs.contains(&od.symbol) {
                    continue;
                }
                if !req.strat_name.is_empty() && od.strategy != req.strat_name {
                    continue;
                }
                if !req.dirt.matches(od.short) {
                    continue;
                }
                if !req.enter_tag.is_empty() && od.enter_tag != req.enter_tag {
                    continue;
                }
                if od.is_exiting() || (!req.force && !od.can_close(now)) {
                    continue;
                }
                if req.unfill_only && od.enter.filled > 0.0 {
                    continue;
                }
                if req.filled_only && od.enter.filled == 0.0 {
                    continue;
                }
            }
            if od.is_exiting() {
                continue;
            }
            let left = od.enter.amount - od.exit.as_ref().map(|e| e.amount).unwrap_or(0.0);
            let (unfilled, enter_amt) = (od.unfilled_cost(), od.enter.amount);
            drop(od);
            matched.push((od_ref, unfilled, left, enter_amt));
        }
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        matched.sort_by(|a, b| b.1.total_cmp(&a.1));
        let exit_rate = if req.exit_rate > 0.0 { req.exit_rate } else { 1.0 };
        let mut remain = if req.amount > 0.0 {
            req.amount
        } else {
            matched.iter().map(|m| m.2).sum::<f64>() * exit_rate
        };
        let mut res = Vec::new();
        for (od_ref, _, _, enter_amt) in matched {
            if remain <= AMT_DUST || enter_amt <= 0.0 {
                // Unsized entries carry no amount yet; close them whole.
                if enter_amt <= 0.0 {
                    if let Some(od) = self.exit_order(&od_ref, req, 1.0)? {
                        res.push(od);
                    }
                }
                continue;
            }
            let rate = (remain / enter_amt).min(1.0);
            if rate < EXIT_DUST_RATE {
                continue;
            }
            remain -= rate * enter_amt;
            if let Some(od) = self.exit_order(&od_ref, req, rate)? {
                res.push(od);
            }
        }
        Ok(res)
    }

    /// Exit `rate` of one order. Returns the order actually exiting, which is
    /// a new part when `rate` is below 0.99.
    pub fn exit_order(&self, od_ref: &OrderRef, req: &ExitReq, rate: f64) -> Result<Option<OrderRef>> {
        let target = {
            let mut od = lock_od(od_ref);
            if od.is_exiting() || od.status.is_done() {
                return Ok(None);
            }
            if req.order_id > 0 && !req.dirt.matches(od.short) {
                return Err(TradeError::param(format!("exit dirt mismatch for {}", od.key())));
            }
            // A limit beyond the current price in the profit direction rests as take profit.
            if req.limit > 0.0 && od.enter.filled > 0.0 && rate >= FULL_EXIT_RATE {
                let cur = self.eng.ctx.prices.get(&od.symbol).unwrap_or(od.init_price);
                if (req.limit - cur) * od.dirt() > 0.0 {
                    let tag = if req.tag.is_empty() { exit_tag::TAKE_PROFIT } else { &req.tag };
                    od.set_take_profit(Some(ExitTrigger::new(req.limit).with_tag(tag)));
                    self.eng.save_od(&mut od);
                    drop(od);
                    if self.eng.mode == ExecMode::Live {
                        self.queue(od_ref, OdAction::TakeProfit);
                    }
                    return Ok(Some(od_ref.clone()));
                }
            }
            if rate < FULL_EXIT_RATE {
                let part = self.cut_order(&mut od, rate, 0.0);
                self.eng.save_od(&mut od);
                drop(od);
                let part_ref = self.eng.register_open(self.acc, part);
                self.eng.fire(self.account(), &lock_od(&part_ref), OdChange::New);
                part_ref
            } else {
                drop(od);
                od_ref.clone()
            }
        };
        self.exit_full(&target, req)?;
        Ok(Some(target))
    }

    fn exit_full(&self, od_ref: &OrderRef, req: &ExitReq) -> Result<()> {
        let ctx = &self.eng.ctx;
        let now = ctx.now_ms();
        let mut od = lock_od(od_ref);
        if od.enter.filled == 0.0 {
            let tag = if req.tag.is_empty() { exit_tag::CANCEL } else { &req.tag };
            let price = od.init_price;
            self.close_local(&mut od, tag, price, "", None, now)?;
            if self.eng.mode == ExecMode::Live && !od.enter.order_id.is_empty() {
                drop(od);
                self.queue(od_ref, OdAction::Exit);
            }
            return Ok(());
        }
        od.set_exit(now, &req.tag, req.order_type, req.limit);
        if req.log {
            info!(account = self.account(), order = %od.key(), tag = %od.exit_tag, "exit order");
        }
        self.eng.save_od(&mut od);
        self.eng.fire(self.account(), &od, OdChange::Exit);
        drop(od);
        match self.eng.mode {
            ExecMode::Live => self.queue(od_ref, OdAction::Exit),
            ExecMode::LocalLive => {
                self.fill_by_book(od_ref)?;
            }
            ExecMode::Local => {}
        }
        Ok(())
    }

    /// Split `enter_rate` of an order into a new part and move the matching
    /// wallet reservations. The caller holds the order lock.
    pub fn cut_order(&self, od: &mut InOutOrder, enter_rate: f64, exit_rate: f64) -> InOutOrder {
        let enter_amt = od.enter.amount * enter_rate;
        let exit_amt = od.exit.as_ref().map(|e| e.amount * exit_rate).unwrap_or(0.0);
        let part = od.cut_part(enter_amt, exit_amt);
        let (base, quote) = Wallets::pair_coins(&od.symbol);
        let (src, tgt) = (part.key(), od.key());
        let mut wallets = self.acc.lock_wallets();
        for coin in [base, quote] {
            wallets.cut_part(&src, &tgt, &coin, 1.0 - enter_rate);
        }
        debug!(order = %tgt, part = %src, rate = enter_rate, "cut order");
        part
    }

    /// Close an order in memory, settling the wallet, and publish the exit.
    pub fn close_local(
        &self,
        od: &mut InOutOrder,
        tag: &str,
        price: f64,
        msg: &str,
        od_type: Option<OrderType>,
        exit_at: i64,
    ) -> Result<bool> {
        let ctx = &self.eng.ctx;
        let ex = ctx.exchange.as_ref();
        let spot = ctx.prices.get(&od.symbol);
        if od.status.is_done() {
            return Ok(false);
        }
        if od.enter.filled > 0.0 {
            let hold = od.enter.filled;
            self.acc.lock_wallets().exit_od(od, hold, ctx)?;
            od.local_exit(ex, exit_at, tag, price, spot, msg, od_type)?;
            let exit_price = od.exit.as_ref().map(|e| e.average).unwrap_or(price);
            self.acc.lock_wallets().confirm_od_exit(od, exit_price, ctx)?;
        } else {
            od.local_exit(ex, exit_at, tag, price, spot, msg, od_type)?;
            let key = od.key();
            let (base, quote) = Wallets::pair_coins(&od.symbol);
            let mut wallets = self.acc.lock_wallets();
            wallets.cancel(&key, &quote, 0.0, true);
            wallets.cancel(&key, &base, 0.0, true);
        }
        self.eng.save_od(od);
        self.eng.fire(self.account(), od, OdChange::ExitFill);
        self.after_exit(od);
        Ok(true)
    }

    /// Bookkeeping after an order is fully closed.
    pub(crate) fn after_exit(&self, od: &InOutOrder) {
        let ctx = &self.eng.ctx;
        let cfg = &ctx.config;
        if od.enter.filled > 0.0 {
            if let Some(perf_cfg) = cfg.strat_perf.as_ref() {
                let mut rates: Vec<f64> = self
                    .eng
                    .hist_orders()
                    .iter()
                    .filter(|h| {
                        h.enter.filled > 0.0
                            && h.strategy == od.strategy
                            && h.symbol == od.symbol
                            && h.timeframe == od.timeframe
                    })
                    .map(|h| h.profit_rate)
                    .collect();
                rates.push(od.profit_rate);
                self.acc
                    .perfs()
                    .update_job(perf_cfg, &od.strategy, &od.symbol, &od.timeframe, &rates);
            }
        }
        if cfg.stake_pct > 0.0 {
            let leverage = cfg.account_leverage(self.account());
            let amt = self
                .acc
                .lock_wallets()
                .stake_pct_amount(cfg.stake_pct, leverage, ctx.is_contract(), &ctx.prices);
            let mut misc = self.acc.misc();
            let old = misc.stake_pct_amt;
            if old <= 0.0 || ((amt - old) / old).abs() >= 0.2 {
                misc.stake_pct_amt = amt;
            }
        }
        if cfg.draw_balance_over > 0.0 {
            let mut wallets = self.acc.lock_wallets();
            let total = wallets.total_legal(None, false, &ctx.prices);
            if total > cfg.draw_balance_over {
                wallets.withdraw_legal(total - cfg.draw_balance_over, None, &ctx.prices);
            }
        }
    }

    // ========================================================================
    // Edits and relays
    // ========================================================================

    /// Working price changes are applied in memory already; only live runs
    /// need the exchange side updated.
    pub fn edit_order(&self, edit: OdEdit) {
        if self.eng.mode == ExecMode::Live {
            self.queue(&edit.od, edit.action.live_action());
        }
    }

    /// Take over orders replayed by a relay run.
    ///
    /// Orders already known by key are skipped. The rest are re-registered
    /// under this account with wallet reservations for their holdings.
    /// Callers pass only orders that have a job to own them.
    pub fn relay_orders(&self, ods: Vec<InOutOrder>) -> Result<Vec<OrderRef>> {
        let ctx = &self.eng.ctx;
        let known: Vec<String> = self.acc.open_snapshots(|_| true).iter().map(|o| o.key_align()).collect();
        let mut res = Vec::new();
        for mut od in ods {
            if od.status.is_done() || known.contains(&od.key_align()) {
                continue;
            }
            od.id = 0;
            od.task_id = ctx.task_id;
            od.dirty_main = true;
            od.dirty_enter = true;
            od.dirty_exit = od.exit.is_some();
            od.dirty_info = true;
            if od.enter.filled > 0.0 {
                let mut wallets = self.acc.lock_wallets();
                if let Err(err) = wallets.enter_od(&mut od, ctx) {
                    warn!(order = %od.key(), %err, "relay order skipped");
                    continue;
                }
                let price = od.enter.average;
                wallets.confirm_od_enter(&od, price, ctx)?;
            }
            info!(account = self.account(), order = %od.key(), "relay order taken over");
            let od_ref = self.eng.register_open(self.acc, od);
            let snap = lock_od(&od_ref).clone();
            self.eng.fire(self.account(), &snap, OdChange::New);
            res.push(od_ref);
        }
        Ok(res)
    }

    /// Push a task to the live worker; dropped with an error log when the
    /// queue is missing or full.
    pub(crate) fn queue(&self, od_ref: &OrderRef, action: OdAction) {
        let Some(tx) = self.eng.live_sender() else {
            warn!(account = self.account(), ?action, "live queue not started");
            return;
        };
        let task = live::OrderTask {
            account: self.account().to_string(),
            od: od_ref.clone(),
            action,
        };
        if let Err(err) = tx.try_send(task) {
            tracing::error!(account = self.account(), ?action, %err, "queue order task fail");
        }
    }

    pub(crate) fn trigger_kind(action: EditAction) -> Option<TriggerKind> {
        match action {
            EditAction::StopLoss => Some(TriggerKind::StopLoss),
            EditAction::TakeProfit => Some(TriggerKind::TakeProfit),
            _ => None,
        }
    }
}
