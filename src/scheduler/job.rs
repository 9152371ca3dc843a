//! Per (account, pair, timeframe, strategy) execution context

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::engine::{lock_od, OrderRef};
use crate::errors::{EntryReject, ErrKind, FailOpen, Result, TradeError};
use crate::orders::{ExitTrigger, InOutOrder, InOutStatus, TriggerKind};
use crate::strategies::{EnterReq, ExitReq, Strategy};
use crate::types::{equal_nearly, exit_tag, Dirt, ExSymbol, Kline, OrderType, AMT_DUST};

pub struct StratJob {
    pub strat: Arc<dyn Strategy>,
    /// Policy id stamped on the job's orders
    pub strat_id: String,
    pub symbol: ExSymbol,
    pub timeframe: String,
    pub account: String,
    pub entrys: Vec<EnterReq>,
    pub exits: Vec<ExitReq>,
    pub long_ods: Vec<OrderRef>,
    pub short_ods: Vec<OrderRef>,
    /// Most favourable price seen per order id
    pub tp_maxs: HashMap<i64, f64>,
    /// Unfinished orders, including requests of this bar
    pub order_num: usize,
    pub entered_num: usize,
    pub check_ms: i64,
    pub last_bar_ms: i64,
    /// 0 unlimited, -1 forbidden
    pub max_open_long: i32,
    pub max_open_short: i32,
    pub close_long: bool,
    pub close_short: bool,
    pub exg_stop_loss: bool,
    pub long_sl_price: f64,
    pub short_sl_price: f64,
    pub exg_take_profit: bool,
    pub long_tp_price: f64,
    pub short_tp_price: f64,
    pub is_warmup: bool,
    /// Base stake before strategy and score multipliers
    pub stake_amt: f64,
    /// Job score multiplier
    pub cost_rate: f64,
    /// Latest finished bar
    pub bar: Option<Kline>,
    /// Mean volume of the last five bars
    pub avg_vol: f64,
    pub cfg: Arc<Config>,
    more: Option<Box<dyn Any + Send + Sync>>,
}

impl StratJob {
    pub fn new(
        strat: Arc<dyn Strategy>,
        strat_id: &str,
        symbol: ExSymbol,
        timeframe: &str,
        account: &str,
        cfg: Arc<Config>,
    ) -> Self {
        let max_open_long = strat.each_max_long();
        let max_open_short = strat.each_max_short();
        Self {
            strat,
            strat_id: strat_id.to_string(),
            symbol,
            timeframe: timeframe.to_string(),
            account: account.to_string(),
            entrys: Vec::new(),
            exits: Vec::new(),
            long_ods: Vec::new(),
            short_ods: Vec::new(),
            tp_maxs: HashMap::new(),
            order_num: 0,
            entered_num: 0,
            check_ms: 0,
            last_bar_ms: 0,
            max_open_long,
            max_open_short,
            close_long: true,
            close_short: true,
            exg_stop_loss: true,
            long_sl_price: 0.0,
            short_sl_price: 0.0,
            exg_take_profit: true,
            long_tp_price: 0.0,
            short_tp_price: 0.0,
            is_warmup: false,
            stake_amt: cfg.stake_amount,
            cost_rate: 1.0,
            bar: None,
            avg_vol: 0.0,
            cfg,
            more: None,
        }
    }

    pub fn pair(&self) -> &str {
        &self.symbol.symbol
    }

    /// Strategy-owned state, created on first access or when the stored type differs.
    pub fn state_or_insert_with<T, F>(&mut self, init: F) -> Option<&mut T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let fresh = !matches!(&self.more, Some(b) if b.is::<T>());
        if fresh {
            self.more = Some(Box::new(init()));
        }
        self.more.as_mut().and_then(|b| b.downcast_mut::<T>())
    }

    /// Reset per-bar state and rebuild the order lists from `ods`.
    pub fn init_bar(&mut self, bar: &Kline, avg_vol: f64, ods: Vec<OrderRef>) {
        self.reset_orders(ods);
        self.bar = Some(*bar);
        self.avg_vol = avg_vol;
        self.last_bar_ms = bar.time;
    }

    /// Clear pending requests and rebuild the order lists from `ods`.
    pub fn reset_orders(&mut self, ods: Vec<OrderRef>) {
        self.entrys.clear();
        self.exits.clear();
        self.long_ods.clear();
        self.short_ods.clear();
        self.entered_num = 0;
        for od_ref in ods {
            let (short, status) = {
                let od = lock_od(&od_ref);
                (od.short, od.status)
            };
            if status >= InOutStatus::PartEnter && status < InOutStatus::FullExit {
                self.entered_num += 1;
            }
            if short {
                self.short_ods.push(od_ref);
            } else {
                self.long_ods.push(od_ref);
            }
        }
        self.order_num = self.long_ods.len() + self.short_ods.len();
    }

    pub fn price(&self) -> f64 {
        self.bar.map(|b| b.close).unwrap_or(f64::NAN)
    }

    /// Legal cost of one default entry
    pub fn stake_amount(&self) -> f64 {
        let mut amount = self.stake_amt;
        let rate = self.strat.stake_rate();
        if rate > 0.0 {
            amount *= rate;
        }
        amount * self.cost_rate
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Validate and queue an entry for this bar.
    pub fn open_order(&mut self, mut req: EnterReq) -> std::result::Result<(), EntryReject> {
        let pair = self.symbol.symbol.clone();
        if req.tag.is_empty() {
            return Err(EntryReject::new(FailOpen::BadDirtOrLimit, ErrKind::InvalidParam, "tag is required"));
        }
        if req.strat_name.is_empty() {
            req.strat_name = self.strat_id.clone();
        }
        let (max_open, cur_num) = if req.short {
            (self.max_open_short, self.short_ods.len())
        } else {
            (self.max_open_long, self.long_ods.len())
        };
        if max_open < 0 || (max_open > 0 && cur_num >= max_open as usize) {
            return Err(EntryReject::new(
                FailOpen::BadDirtOrLimit,
                ErrKind::InvalidParam,
                format!("{} open {:?} disabled", pair, Dirt::of(req.short)),
            ));
        }
        let dirt = if req.short { -1.0 } else { 1.0 };
        let mut enter_price = self.price();
        if req.limit > 0.0 && (req.limit - enter_price) * dirt < 0.0 {
            enter_price = req.limit;
        }
        let nums = [enter_price, req.limit, req.legal_cost, req.amount, req.stop_loss, req.take_profit];
        if nums.iter().any(|v| !v.is_finite()) || enter_price <= 0.0 {
            return Err(EntryReject::new(
                FailOpen::NanNum,
                ErrKind::InvalidParam,
                format!("{} invalid number in entry request", pair),
            ));
        }
        if req.amount == 0.0 && req.legal_cost == 0.0 {
            if req.cost_rate == 0.0 {
                req.cost_rate = 1.0;
            }
            req.legal_cost = self.stake_amount() * req.cost_rate;
            let req_amt = req.legal_cost / enter_price;
            if self.avg_vol > 0.0 && req_amt / self.avg_vol > self.cfg.open_vol_rate {
                req.legal_cost = self.avg_vol * self.cfg.open_vol_rate * enter_price;
            }
        }
        // stop loss
        let mut sl_price = if req.short { self.short_sl_price } else { self.long_sl_price };
        if sl_price == 0.0 {
            if req.stop_loss_val > 0.0 {
                sl_price = enter_price - req.stop_loss_val * dirt;
            } else if req.stop_loss > 0.0 {
                sl_price = req.stop_loss;
            } else if let Some(ratio) = self.default_stop_ratio() {
                sl_price = enter_price * (1.0 - ratio * dirt);
            }
        }
        req.stop_loss_val = 0.0;
        req.stop_loss = 0.0;
        if sl_price > 0.0 && self.exg_stop_loss {
            if (sl_price - enter_price) * dirt >= 0.0 {
                return Err(EntryReject::new(
                    FailOpen::BadStopLoss,
                    ErrKind::InvalidParam,
                    format!(
                        "{} stop loss {} must be {} {}",
                        pair,
                        sl_price,
                        if req.short { ">" } else { "<" },
                        enter_price
                    ),
                ));
            }
            req.stop_loss = sl_price;
        }
        // take profit
        let mut tp_price = if req.short { self.short_tp_price } else { self.long_tp_price };
        if tp_price == 0.0 {
            if req.take_profit_val > 0.0 {
                tp_price = enter_price + req.take_profit_val * dirt;
            } else {
                tp_price = req.take_profit;
            }
        }
        req.take_profit_val = 0.0;
        req.take_profit = 0.0;
        if tp_price > 0.0 && self.exg_take_profit {
            if (tp_price - enter_price) * dirt <= 0.0 {
                return Err(EntryReject::new(
                    FailOpen::BadTakeProfit,
                    ErrKind::InvalidParam,
                    format!(
                        "{} take profit {} must be {} {}",
                        pair,
                        tp_price,
                        if req.short { "<" } else { ">" },
                        enter_price
                    ),
                ));
            }
            req.take_profit = tp_price;
        }
        if req.limit > 0.0 && req.order_type.is_none() {
            req.order_type = Some(OrderType::Limit);
        }
        if req.limit > 0.0 && req.order_type.map(|t| t.is_limit()).unwrap_or(false) && req.stop_bars == 0 {
            req.stop_bars = self.strat.stop_enter_bars();
        }
        self.entrys.push(req);
        self.order_num += 1;
        Ok(())
    }

    fn default_stop_ratio(&self) -> Option<f64> {
        self.strat
            .stop_loss()
            .or_else(|| self.cfg.policy(&self.strat_id).and_then(|p| p.stop_loss))
            .filter(|r| *r > 0.0)
    }

    /// Validate and queue an exit for this bar.
    pub fn close_orders(&mut self, mut req: ExitReq) -> Result<()> {
        if self.order_count(req.dirt) == 0 {
            return Ok(());
        }
        if req.tag.is_empty() {
            return Err(TradeError::param("exit tag is required"));
        }
        if req.strat_name.is_empty() {
            req.strat_name = self.strat_id.clone();
        }
        let both = req.dirt == Dirt::Both;
        if (!self.close_short && (both || req.dirt == Dirt::Short))
            || (!self.close_long && (both || req.dirt == Dirt::Long))
        {
            warn!(strategy = %self.strat_id, pair = %self.pair(), tag = %req.tag, "close order disabled");
            return Err(TradeError::param("close order disabled"));
        }
        if req.exit_rate > 1.0 {
            return Err(TradeError::param(format!("exit rate should be in (0, 1], got {}", req.exit_rate)));
        } else if req.exit_rate == 0.0 {
            req.exit_rate = 1.0;
        }
        if req.limit > 0.0 && req.order_type.is_none() {
            req.order_type = Some(OrderType::Limit);
        }
        if req.limit > 0.0 && both {
            if !req.order_type.map(|t| t.is_limit()).unwrap_or(false) {
                return Err(TradeError::param("exit limit is invalid for market orders"));
            }
            match (self.long_ods.is_empty(), self.short_ods.is_empty()) {
                (false, false) => return Err(TradeError::param("exit dirt is required for limit exits")),
                (false, true) => req.dirt = Dirt::Long,
                (true, false) => req.dirt = Dirt::Short,
                (true, true) => {}
            }
        }
        self.exits.push(req);
        Ok(())
    }

    // ========================================================================
    // Positions
    // ========================================================================

    pub fn orders(&self, dirt: Dirt) -> Vec<OrderRef> {
        match dirt {
            Dirt::Long => self.long_ods.clone(),
            Dirt::Short => self.short_ods.clone(),
            Dirt::Both => self.short_ods.iter().chain(self.long_ods.iter()).cloned().collect(),
        }
    }

    pub fn order_count(&self, dirt: Dirt) -> usize {
        match dirt {
            Dirt::Long => self.long_ods.len(),
            Dirt::Short => self.short_ods.len(),
            Dirt::Both => self.long_ods.len() + self.short_ods.len(),
        }
    }

    /// Held cost as a multiple of the default stake
    pub fn position(&self, dirt: Dirt, enter_tag: &str) -> f64 {
        let total: f64 = self
            .orders(dirt)
            .iter()
            .map(|r| lock_od(r))
            .filter(|od| enter_tag.is_empty() || od.enter_tag == enter_tag)
            .map(|od| od.hold_cost())
            .sum();
        let stake = self.stake_amount();
        if stake > 0.0 {
            total / stake
        } else {
            0.0
        }
    }

    /// Set a trigger on every entered order of one side.
    ///
    /// A partial `rate` is spread over orders in sequence until the
    /// requested share of the position is covered.
    pub fn set_all_exit_trigger(&mut self, dirt: Dirt, kind: TriggerKind, args: Option<ExitTrigger>) -> Result<()> {
        if self.order_count(dirt) == 0 {
            return Ok(());
        }
        if dirt == Dirt::Both && !self.long_ods.is_empty() && !self.short_ods.is_empty() {
            return Err(TradeError::param(format!(
                "{} set {} needs a side when both long and short are open",
                self.strat_id,
                kind.as_str()
            )));
        }
        let set_all = match &args {
            None => true,
            Some(a) => a.rate <= 0.0 || a.rate >= 1.0,
        };
        let mut entered = Vec::new();
        let mut position = 0.0;
        for od_ref in self.orders(dirt) {
            let mut od = lock_od(&od_ref);
            if od.status < InOutStatus::PartEnter || od.status > InOutStatus::PartExit {
                continue;
            }
            if set_all {
                od.set_exit_trigger(kind, args.clone());
            } else {
                position += od.hold_amount();
                drop(od);
                entered.push(od_ref);
            }
        }
        let Some(args) = args else {
            return Ok(());
        };
        if set_all || entered.is_empty() {
            return Ok(());
        }
        let mut left = position * args.rate;
        for od_ref in entered {
            let mut od = lock_od(&od_ref);
            let size = od.hold_amount();
            if size < AMT_DUST {
                continue;
            }
            if left < AMT_DUST {
                od.set_exit_trigger(kind, None);
            } else if left >= size + AMT_DUST {
                od.set_exit_trigger(
                    kind,
                    Some(ExitTrigger::new(args.price).with_limit(args.limit).with_tag(&args.tag)),
                );
                left -= size;
            } else {
                od.set_exit_trigger(
                    kind,
                    Some(
                        ExitTrigger::new(args.price)
                            .with_limit(args.limit)
                            .with_rate(left / size)
                            .with_tag(&args.tag),
                    ),
                );
                left = 0.0;
            }
        }
        Ok(())
    }

    pub fn set_all_stop_loss(&mut self, dirt: Dirt, args: Option<ExitTrigger>) -> Result<()> {
        self.set_all_exit_trigger(dirt, TriggerKind::StopLoss, args)
    }

    pub fn set_all_take_profit(&mut self, dirt: Dirt, args: Option<ExitTrigger>) -> Result<()> {
        self.set_all_exit_trigger(dirt, TriggerKind::TakeProfit, args)
    }

    // ========================================================================
    // Custom exits
    // ========================================================================

    /// `(giveback ratio, entry price, max favourable change)` for an order.
    fn max_tp(&mut self, od: &InOutOrder) -> (f64, f64, f64) {
        let ent_price = if od.enter.average > 0.0 { od.enter.average } else { od.init_price };
        let Some(bar) = self.bar else {
            return (0.0, ent_price, 0.0);
        };
        let prev = self.tp_maxs.get(&od.id).copied().unwrap_or(od.init_price);
        let ext = if od.short { prev.min(bar.low) } else { prev.max(bar.high) };
        self.tp_maxs.insert(od.id, ext);
        let max_val = (ext - ent_price).abs();
        let max_chg = if ent_price > 0.0 { max_val / ent_price } else { 0.0 };
        if equal_nearly(max_val, 0.0) {
            return (0.0, ent_price, max_chg);
        }
        ((ext - bar.close).abs() / max_val, ent_price, max_chg)
    }

    /// Trailing stop price for an order, 0 when inactive.
    pub fn drawdown_exit_price(&mut self, od: &InOutOrder) -> f64 {
        let (_, ent_price, max_chg) = self.max_tp(od);
        let strat = self.strat.clone();
        let mut rate = strat.get_drawdown_exit_rate(self, od, max_chg);
        if rate < 0.0 {
            rate = crate::strategies::calc_drawdown_exit_rate(max_chg);
        }
        if equal_nearly(rate, 0.0) {
            return 0.0;
        }
        ent_price * (1.0 + max_chg * (1.0 - rate) * od.dirt())
    }

    fn drawdown_exit(&mut self, od_ref: &OrderRef) -> Option<ExitReq> {
        let snap = lock_od(od_ref).clone();
        let stop = self.drawdown_exit_price(&snap);
        if stop == 0.0 {
            return None;
        }
        if (stop - self.price()) * snap.dirt() >= 0.0 {
            return Some(ExitReq::new("take").with_order(snap.id));
        }
        let mut od = lock_od(od_ref);
        od.set_stop_loss(Some(ExitTrigger::new(stop).with_tag(exit_tag::DRAW_DOWN)));
        None
    }

    /// Run `on_check_exit` and the trailing exit for every open order.
    pub fn check_custom_exits(&mut self) -> Vec<ExitReq> {
        let mut res = Vec::new();
        let strat = self.strat.clone();
        for od_ref in self.orders(Dirt::Both) {
            let snap = lock_od(&od_ref).clone();
            if snap.status.is_done() || snap.is_exiting() {
                continue;
            }
            let mut req = strat.on_check_exit(self, &snap).map(|r| r.with_order(snap.id));
            if req.is_none() && strat.draw_down_exit() && snap.status >= InOutStatus::FullEnter {
                req = self.drawdown_exit(&od_ref);
            }
            if let Some(req) = req {
                match self.close_orders(req.clone()) {
                    Ok(()) => res.push(req),
                    Err(err) => warn!(pair = %self.pair(), %err, "custom exit rejected"),
                }
            }
        }
        res
    }

    /// Allow or forbid new entries, keeping existing orders tracked.
    pub fn set_forbid(&mut self, forbid: bool) {
        if forbid {
            self.max_open_long = -1;
            self.max_open_short = -1;
        } else {
            self.max_open_long = self.strat.each_max_long();
            self.max_open_short = self.strat.each_max_short();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::new_order_ref;
    use crate::orders::OdStatus;
    use crate::scheduler::env::BarEnv;

    pub(crate) struct Noop;

    impl Strategy for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn on_bar(&self, _job: &mut StratJob, _env: &BarEnv) {}
    }

    pub(crate) fn job() -> StratJob {
        let cfg = Arc::new(Config::default());
        let sym = ExSymbol::new(1, "sim", "spot", "BTC/USDT");
        let mut job = StratJob::new(Arc::new(Noop), "noop", sym, "1h", "default", cfg);
        job.init_bar(&Kline::new(0, 100.0, 110.0, 95.0, 100.0, 1000.0), 1000.0, Vec::new());
        job
    }

    fn entered(short: bool, amount: f64) -> OrderRef {
        let mut od = InOutOrder::new(-1, "BTC/USDT", 1, "1h", "noop", short, "t", 0, OrderType::Market);
        od.init_price = 100.0;
        od.enter.amount = amount;
        od.enter.filled = amount;
        od.enter.average = 100.0;
        od.enter.status = OdStatus::Closed;
        od.status = InOutStatus::FullEnter;
        new_order_ref(od)
    }

    #[test]
    fn test_open_order_defaults_cost() {
        let mut job = job();
        job.open_order(EnterReq::long("x")).unwrap();
        assert_eq!(job.entrys.len(), 1);
        assert_eq!(job.entrys[0].legal_cost, 15.0);
        assert_eq!(job.entrys[0].strat_name, "noop");
        assert_eq!(job.order_num, 1);
    }

    #[test]
    fn test_open_order_volume_cap() {
        let mut job = job();
        job.avg_vol = 0.1;
        job.open_order(EnterReq::long("x")).unwrap();
        // 0.1 * 1.0 * 100
        assert!((job.entrys[0].legal_cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_loss_side_checked() {
        let mut job = job();
        let err = job.open_order(EnterReq::long("x").with_stop_loss(100.0, 0.0)).unwrap_err();
        assert_eq!(err.tag, FailOpen::BadStopLoss);
        assert_eq!(err.err.kind, ErrKind::InvalidParam);
        let err = job.open_order(EnterReq::short("x").with_stop_loss(90.0, 0.0)).unwrap_err();
        assert_eq!(err.tag, FailOpen::BadStopLoss);
        job.open_order(EnterReq::long("x").with_stop_loss(95.0, 0.0)).unwrap();
        assert_eq!(job.entrys[0].stop_loss, 95.0);
    }

    #[test]
    fn test_take_profit_side_checked() {
        let mut job = job();
        let err = job.open_order(EnterReq::long("x").with_take_profit(90.0, 0.0)).unwrap_err();
        assert_eq!(err.tag, FailOpen::BadTakeProfit);
    }

    #[test]
    fn test_nan_rejected() {
        let mut job = job();
        let err = job.open_order(EnterReq::long("x").with_cost(f64::NAN)).unwrap_err();
        assert_eq!(err.tag, FailOpen::NanNum);
    }

    #[test]
    fn test_forbidden_side() {
        let mut job = job();
        job.set_forbid(true);
        let err = job.open_order(EnterReq::long("x")).unwrap_err();
        assert_eq!(err.tag, FailOpen::BadDirtOrLimit);
    }

    #[test]
    fn test_limit_entry_gets_limit_type() {
        let mut job = job();
        job.open_order(EnterReq::long("x").with_limit(90.0)).unwrap();
        assert_eq!(job.entrys[0].order_type, Some(OrderType::Limit));
    }

    #[test]
    fn test_close_orders_rate_rules() {
        let mut job = job();
        assert!(job.close_orders(ExitReq::new("x")).is_ok());
        assert!(job.exits.is_empty());
        let bar = Kline::new(3_600_000, 100.0, 101.0, 99.0, 100.0, 1.0);
        job.init_bar(&bar, 0.0, vec![entered(false, 1.0)]);
        let err = job.close_orders(ExitReq::new("x").with_rate(1.5)).unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidParam);
        job.close_orders(ExitReq::new("x")).unwrap();
        assert_eq!(job.exits[0].exit_rate, 1.0);
        job.close_orders(ExitReq::new("x").with_limit(120.0)).unwrap();
        assert_eq!(job.exits[1].dirt, Dirt::Long);
    }

    #[test]
    fn test_set_all_partial_stop_loss() {
        let mut job = job();
        let bar = Kline::new(3_600_000, 100.0, 101.0, 99.0, 100.0, 1.0);
        let a = entered(false, 1.0);
        let b = entered(false, 1.0);
        job.init_bar(&bar, 0.0, vec![a.clone(), b.clone()]);
        job.set_all_stop_loss(Dirt::Long, Some(ExitTrigger::new(90.0).with_rate(0.75)))
            .unwrap();
        assert_eq!(lock_od(&a).stop_loss().unwrap().trigger.rate, 0.0);
        assert!((lock_od(&b).stop_loss().unwrap().trigger.rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_state_slot() {
        let mut job = job();
        *job.state_or_insert_with(|| 1usize).unwrap() += 2;
        assert_eq!(*job.state_or_insert_with(|| 0usize).unwrap(), 3);
        assert_eq!(*job.state_or_insert_with(|| 7i64).unwrap(), 7);
    }
}
