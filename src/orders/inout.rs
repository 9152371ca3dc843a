//! The InOutOrder aggregate: one logical trade with its enter and exit legs

use serde::{Deserialize, Serialize};

use super::ex_order::{ExOrder, OdStatus};
use super::trigger::{ExitTrigger, OrderInfo, TriggerState};
use crate::errors::Result;
use crate::exchange::Exchange;
use crate::types::{exit_tag, nan_inf_to, tf_to_ms, OrderType, Side};

/// Main order status. Monotonic except for `Delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum InOutStatus {
    #[default]
    Init = 0,
    PartEnter = 1,
    FullEnter = 2,
    PartExit = 3,
    FullExit = 4,
    Delete = 5,
}

impl InOutStatus {
    pub fn from_i64(val: i64) -> InOutStatus {
        match val {
            1 => InOutStatus::PartEnter,
            2 => InOutStatus::FullEnter,
            3 => InOutStatus::PartExit,
            4 => InOutStatus::FullExit,
            5 => InOutStatus::Delete,
            _ => InOutStatus::Init,
        }
    }

    pub fn is_done(&self) -> bool {
        *self >= InOutStatus::FullExit
    }
}

/// Which trigger of an order to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::StopLoss => "stop_loss",
            TriggerKind::TakeProfit => "take_profit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InOutOrder {
    pub id: i64,
    pub task_id: i64,
    pub symbol: String,
    pub sid: i32,
    pub timeframe: String,
    pub short: bool,
    pub status: InOutStatus,
    pub enter_tag: String,
    pub init_price: f64,
    pub quote_cost: f64,
    pub exit_tag: String,
    pub leverage: f64,
    pub enter_at: i64,
    pub exit_at: i64,
    pub strategy: String,
    pub stg_ver: i32,
    pub max_pft_rate: f64,
    pub max_draw_down: f64,
    pub profit_rate: f64,
    pub profit: f64,
    pub info: OrderInfo,
    pub enter: ExOrder,
    pub exit: Option<ExOrder>,
    #[serde(skip)]
    pub dirty_main: bool,
    #[serde(skip)]
    pub dirty_enter: bool,
    #[serde(skip)]
    pub dirty_exit: bool,
    #[serde(skip)]
    pub dirty_info: bool,
}

impl InOutOrder {
    /// Fresh entry-side order with an `Init` enter leg.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: i64,
        symbol: &str,
        sid: i32,
        timeframe: &str,
        strategy: &str,
        short: bool,
        enter_tag: &str,
        enter_at: i64,
        order_type: OrderType,
    ) -> Self {
        let side = if short { Side::Sell } else { Side::Buy };
        let mut enter = ExOrder::new(symbol, true, side, order_type, enter_at);
        enter.task_id = task_id;
        Self {
            id: 0,
            task_id,
            symbol: symbol.to_string(),
            sid,
            timeframe: timeframe.to_string(),
            short,
            status: InOutStatus::Init,
            enter_tag: enter_tag.to_string(),
            init_price: 0.0,
            quote_cost: 0.0,
            exit_tag: String::new(),
            leverage: 1.0,
            enter_at,
            exit_at: 0,
            strategy: strategy.to_string(),
            stg_ver: 0,
            max_pft_rate: 0.0,
            max_draw_down: 0.0,
            profit_rate: 0.0,
            profit: 0.0,
            info: OrderInfo::default(),
            enter,
            exit: None,
            dirty_main: true,
            dirty_enter: true,
            dirty_exit: false,
            dirty_info: false,
        }
    }

    fn key_at(&self, stamp: i64) -> String {
        let side = if self.short { "short" } else { "long" };
        format!(
            "{}|{}|{}|{}|{}",
            self.symbol, self.strategy, side, self.enter_tag, stamp
        )
    }

    /// `symbol|strategy|side|enter_tag|enter_at`
    pub fn key(&self) -> String {
        self.key_at(self.enter_at)
    }

    /// Key with enter time rounded to the timeframe, used to match replayed orders.
    pub fn key_align(&self) -> String {
        let tf_ms = tf_to_ms(&self.timeframe);
        if tf_ms <= 0 {
            return self.key();
        }
        let stamp = ((self.enter_at as f64) / (tf_ms as f64)).round() as i64 * tf_ms;
        self.key_at(stamp)
    }

    pub fn dirt(&self) -> f64 {
        if self.short {
            -1.0
        } else {
            1.0
        }
    }

    pub fn exit_side(&self) -> Side {
        if self.short {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn is_exiting(&self) -> bool {
        !self.exit_tag.is_empty()
    }

    pub fn enter_cost(&self) -> f64 {
        if self.enter.filled == 0.0 {
            return 0.0;
        }
        let price = if self.enter.average > 0.0 {
            self.enter.average
        } else if self.enter.price > 0.0 {
            self.enter.price
        } else {
            self.init_price
        };
        nan_inf_to(self.enter.filled * price, 0.0)
    }

    pub fn hold_cost(&self) -> f64 {
        let mut cost = self.enter_cost();
        if let Some(exit) = &self.exit {
            if exit.filled > 0.0 {
                cost -= exit.filled * exit.average;
            }
        }
        cost
    }

    pub fn hold_amount(&self) -> f64 {
        let mut amt = self.enter.filled;
        if amt == 0.0 {
            return 0.0;
        }
        if let Some(exit) = &self.exit {
            amt -= exit.filled;
        }
        amt
    }

    /// Unfilled entry notional used to rank exit candidates
    pub fn unfilled_cost(&self) -> f64 {
        let price = if self.enter.price > 0.0 {
            self.enter.price
        } else {
            self.init_price
        };
        (self.enter.amount - self.enter.filled) * price
    }

    pub fn real_enter_ms(&self) -> i64 {
        if self.enter.update_at > 0 {
            self.enter.update_at
        } else if self.enter.create_at > 0 {
            self.enter.create_at
        } else {
            self.enter_at
        }
    }

    pub fn real_exit_ms(&self) -> i64 {
        match &self.exit {
            Some(exit) if exit.update_at > 0 => exit.update_at,
            Some(exit) if exit.create_at > 0 => exit.create_at,
            _ => self.exit_at,
        }
    }

    pub fn set_enter_limit(&mut self, price: f64) -> Result<bool> {
        if self.status >= InOutStatus::FullEnter || self.enter.is_closed() {
            return Err(crate::errors::TradeError::new(
                crate::errors::ErrKind::RunTime,
                format!("cannot set entry limit for entered order: {}", self.key()),
            ));
        }
        if self.enter.price != price {
            self.enter.price = price;
            self.dirty_enter = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Profit before fees; `None` while nothing has been filled.
    pub fn calc_profit(&self, price: f64) -> Option<f64> {
        if self.status == InOutStatus::Init || self.enter.average == 0.0 || self.enter.filled == 0.0 {
            return None;
        }
        let mut price = price;
        if price == 0.0 {
            if let Some(exit) = &self.exit {
                if exit.average > 0.0 {
                    price = exit.average;
                } else if exit.price > 0.0 {
                    price = exit.price;
                }
            }
            if price == 0.0 && self.enter.price > 0.0 {
                price = self.enter.price;
            }
        }
        let val = self.enter.filled * (price - self.enter.average);
        Some(if self.short { -val } else { val })
    }

    /// Refresh profit, profit rate and the running max/drawdown at `price`.
    /// Rates are nominal and exclude leverage.
    pub fn update_profits(&mut self, price: f64) {
        let Some(val) = self.calc_profit(price) else {
            return;
        };
        let enter_fee = nan_inf_to(self.enter.fee, 0.0);
        let exit_fee = self.exit.as_ref().map(|e| nan_inf_to(e.fee, 0.0)).unwrap_or(0.0);
        self.profit = val - enter_fee - exit_fee;
        let ent_price = if self.enter.average > 0.0 {
            self.enter.average
        } else if self.enter.price > 0.0 {
            self.enter.price
        } else {
            self.init_price
        };
        let ent_val = ent_price * self.enter.filled;
        self.profit_rate = if ent_val != 0.0 { self.profit / ent_val } else { 0.0 };
        if self.profit_rate > self.max_pft_rate {
            self.max_pft_rate = self.profit_rate;
        } else if self.max_pft_rate > 0.0 {
            self.max_draw_down = (self.max_pft_rate - self.profit_rate) / self.max_pft_rate;
        } else {
            self.max_draw_down = -self.profit_rate;
        }
        self.dirty_main = true;
    }

    /// Compute the fee of one leg. Must run after `filled` is set.
    pub fn update_fee(&mut self, ex: &dyn Exchange, price: f64, for_enter: bool, maker: bool) -> Result<()> {
        let symbol = self.symbol.clone();
        let sub = if for_enter {
            &mut self.enter
        } else {
            match self.exit.as_mut() {
                Some(e) => e,
                None => return Ok(()),
            }
        };
        let maker = maker && sub.order_type != OrderType::Market;
        let fee = ex.calculate_fee(&symbol, sub.order_type, sub.side, sub.filled, price, maker)?;
        sub.fee = fee.cost;
        sub.fee_type = fee.currency;
        if for_enter {
            self.dirty_enter = true;
        } else {
            self.dirty_exit = true;
        }
        Ok(())
    }

    /// Orders may be closed once most of one bar has passed since entry.
    pub fn can_close(&self, now_ms: i64) -> bool {
        if !self.exit_tag.is_empty() {
            return false;
        }
        if self.timeframe == "ws" {
            return true;
        }
        let tf_ms = tf_to_ms(&self.timeframe);
        (now_ms - self.real_enter_ms()) as f64 > tf_ms as f64 * 0.9
    }

    /// Record the exit intent and create or amend the exit leg.
    pub fn set_exit(&mut self, exit_at: i64, tag: &str, order_type: Option<OrderType>, limit: f64) {
        if self.exit_at == 0 {
            self.exit_tag = if tag.is_empty() {
                exit_tag::UNKNOWN.to_string()
            } else {
                tag.to_string()
            };
            self.exit_at = exit_at;
            self.dirty_main = true;
        }
        match self.exit.as_mut() {
            None => {
                let mut exit = ExOrder::new(
                    &self.symbol,
                    false,
                    self.exit_side(),
                    order_type.unwrap_or_default(),
                    exit_at,
                );
                exit.task_id = self.task_id;
                exit.inout_id = self.id;
                exit.price = limit;
                exit.amount = self.enter.filled;
                self.exit = Some(exit);
                self.dirty_exit = true;
            }
            Some(exit) => {
                if let Some(t) = order_type {
                    exit.order_type = t;
                    self.dirty_exit = true;
                }
                if limit > 0.0 {
                    exit.price = limit;
                    self.dirty_exit = true;
                }
            }
        }
    }

    /// Price used when closing without an explicit one.
    pub fn fallback_price(&self, spot: Option<f64>) -> f64 {
        match spot {
            Some(p) if p > 0.0 => p,
            _ if self.enter.average > 0.0 => self.enter.average,
            _ if self.enter.price > 0.0 => self.enter.price,
            _ => self.init_price,
        }
    }

    /// Close the order in memory immediately. Wallet updates and saving are the caller's job.
    ///
    /// Returns false when the order was already closed; a second call changes nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn local_exit(
        &mut self,
        ex: &dyn Exchange,
        exit_at: i64,
        tag: &str,
        price: f64,
        spot: Option<f64>,
        msg: &str,
        od_type: Option<OrderType>,
    ) -> Result<bool> {
        if self.status.is_done() {
            return Ok(false);
        }
        let price = if price == 0.0 || !price.is_finite() {
            self.fallback_price(spot)
        } else {
            price
        };
        if self.enter.status < OdStatus::Closed {
            self.enter.status = OdStatus::Closed;
            self.update_fee(ex, price, true, true)?;
            self.dirty_enter = true;
        }
        self.set_exit(exit_at, tag, Some(od_type.unwrap_or(OrderType::Market)), price);
        let filled = self.enter.filled;
        if let Some(exit) = self.exit.as_mut() {
            exit.status = OdStatus::Closed;
            exit.filled = filled;
            exit.average = exit.price;
            exit.update_at = exit_at;
        }
        self.status = InOutStatus::FullExit;
        self.update_fee(ex, price, false, true)?;
        self.update_profits(price);
        self.dirty_main = true;
        self.dirty_exit = true;
        if !msg.is_empty() {
            self.info.status_msg = msg.to_string();
            self.dirty_info = true;
        }
        Ok(true)
    }

    /// Split off a new order holding `enter_amt` of the entry (and `exit_amt` of the exit).
    ///
    /// The part keeps the current key; this order's `enter_at` moves forward 1ms.
    pub fn cut_part(&mut self, enter_amt: f64, exit_amt: f64) -> InOutOrder {
        let enter_rate = if self.enter.amount > 0.0 {
            enter_amt / self.enter.amount
        } else {
            0.0
        };
        let mut exit_rate = match &self.exit {
            Some(exit) if exit_amt > 0.0 && exit.amount > 0.0 => exit_amt / exit.amount,
            _ => 0.0,
        };
        let part_enter = self.enter.cut_part(enter_rate, true);
        let mut part = InOutOrder {
            id: 0,
            task_id: self.task_id,
            symbol: self.symbol.clone(),
            sid: self.sid,
            timeframe: self.timeframe.clone(),
            short: self.short,
            status: self.status,
            enter_tag: self.enter_tag.clone(),
            init_price: self.init_price,
            quote_cost: self.quote_cost * enter_rate,
            exit_tag: String::new(),
            leverage: self.leverage,
            enter_at: self.enter_at,
            exit_at: 0,
            strategy: self.strategy.clone(),
            stg_ver: self.stg_ver,
            max_pft_rate: self.max_pft_rate,
            max_draw_down: self.max_draw_down,
            profit_rate: self.profit_rate,
            profit: 0.0,
            info: self.info.clone(),
            enter: part_enter,
            exit: None,
            dirty_main: true,
            dirty_enter: true,
            dirty_exit: false,
            dirty_info: true,
        };
        self.enter_at += 1;
        self.quote_cost -= part.quote_cost;
        self.dirty_main = true;
        self.dirty_enter = true;
        if self.enter.status == OdStatus::Init && self.status > InOutStatus::Init {
            self.status = InOutStatus::Init;
        }
        if exit_rate == 0.0 {
            if let Some(exit) = &self.exit {
                if exit.amount > self.enter.amount && exit.amount > 0.0 {
                    exit_rate = (exit.amount - self.enter.amount) / exit.amount;
                }
            }
        }
        match self.exit.as_mut() {
            Some(exit) if exit_rate > 0.0 => {
                self.dirty_exit = true;
                part.dirty_exit = true;
                part.exit_at = self.exit_at;
                part.exit_tag = self.exit_tag.clone();
                part.exit = Some(exit.cut_part(exit_rate, true));
                if part.status < InOutStatus::FullEnter {
                    part.status = InOutStatus::FullEnter;
                }
            }
            _ => {
                if part.status > InOutStatus::FullEnter {
                    part.status = InOutStatus::FullEnter;
                }
            }
        }
        if part.enter.status == OdStatus::Closed && part.status < InOutStatus::FullEnter {
            part.status = InOutStatus::FullEnter;
        }
        part
    }

    pub fn trigger(&self, kind: TriggerKind) -> Option<&TriggerState> {
        match kind {
            TriggerKind::StopLoss => self.info.stop_loss.as_ref(),
            TriggerKind::TakeProfit => self.info.take_profit.as_ref(),
        }
    }

    pub fn trigger_mut(&mut self, kind: TriggerKind) -> Option<&mut TriggerState> {
        match kind {
            TriggerKind::StopLoss => self.info.stop_loss.as_mut(),
            TriggerKind::TakeProfit => self.info.take_profit.as_mut(),
        }
    }

    pub fn stop_loss(&self) -> Option<&TriggerState> {
        self.trigger(TriggerKind::StopLoss).filter(|t| t.is_active())
    }

    pub fn take_profit(&self) -> Option<&TriggerState> {
        self.trigger(TriggerKind::TakeProfit).filter(|t| t.is_active())
    }

    /// Set or clear a trigger. Returns true when the trigger values changed.
    pub fn set_exit_trigger(&mut self, kind: TriggerKind, args: Option<ExitTrigger>) -> bool {
        let slot = match kind {
            TriggerKind::StopLoss => &mut self.info.stop_loss,
            TriggerKind::TakeProfit => &mut self.info.take_profit,
        };
        let args = match args {
            Some(a) if a.price != 0.0 => a,
            _ => {
                let had = slot.as_ref().map(|s| s.is_active()).unwrap_or(false);
                match slot.as_mut() {
                    Some(st) if !st.order_id.is_empty() => st.trigger = ExitTrigger::default(),
                    _ => *slot = None,
                }
                if had {
                    self.dirty_info = true;
                }
                return had;
            }
        };
        let range = (self.init_price - args.exit_price()).abs();
        let st = slot.get_or_insert_with(TriggerState::default);
        let changed = st.trigger.price != args.price
            || st.trigger.limit != args.limit
            || st.trigger.rate != args.rate
            || st.trigger.tag != args.tag;
        st.range = range;
        st.trigger = args;
        if changed {
            self.dirty_info = true;
        }
        changed
    }

    pub fn set_stop_loss(&mut self, args: Option<ExitTrigger>) -> bool {
        self.set_exit_trigger(TriggerKind::StopLoss, args)
    }

    pub fn set_take_profit(&mut self, args: Option<ExitTrigger>) -> bool {
        self.set_exit_trigger(TriggerKind::TakeProfit, args)
    }

    pub fn client_id(&self, bot_name: &str) -> String {
        format!("{}_{}_{}", bot_name, self.id, self.info.client_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_main || self.dirty_enter || self.dirty_exit || self.dirty_info
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_main = false;
        self.dirty_enter = false;
        self.dirty_exit = false;
        self.dirty_info = false;
    }

    /// JSON text of the info blob, empty when nothing is set
    pub fn info_text(&self) -> Result<String> {
        if self.info.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_json::to_string(&self.info)?)
    }

    pub fn nan_inf_to(&mut self, def: f64) {
        self.init_price = nan_inf_to(self.init_price, def);
        self.quote_cost = nan_inf_to(self.quote_cost, def);
        self.leverage = nan_inf_to(self.leverage, def);
        self.max_pft_rate = nan_inf_to(self.max_pft_rate, def);
        self.max_draw_down = nan_inf_to(self.max_draw_down, def);
        self.profit_rate = nan_inf_to(self.profit_rate, def);
        self.profit = nan_inf_to(self.profit, def);
        self.info.legal_cost = nan_inf_to(self.info.legal_cost, def);
        self.enter.nan_inf_to(def);
        if let Some(exit) = self.exit.as_mut() {
            exit.nan_inf_to(def);
        }
    }

    /// Short human summary used in logs
    pub fn brief(&self) -> String {
        format!(
            "{}#{} {} {:?} {:.6}@{:.6}",
            self.symbol,
            self.id,
            if self.short { "short" } else { "long" },
            self.status,
            self.enter.amount,
            self.enter.average.max(self.enter.price).max(self.init_price)
        )
    }
}
