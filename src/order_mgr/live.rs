//! Live order worker
//!
//! Orders created on the bar thread are queued as [`OrderTask`]s and
//! submitted by a single tokio task. Exchange calls run on the blocking
//! pool, are rate limited and retried on network timeouts. No order or
//! wallet lock is held across an await point.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::OrderMgr;
use crate::engine::{lock_od, AccountState, Engine, OdChange, OrderRef};
use crate::errors::{ErrKind, Result, TradeError};
use crate::exchange::{CreateOrderReq, Exchange, ExchangeOrder};
use crate::orders::{InOutStatus, OdStatus, TriggerKind};
use crate::rate_limiter::RateLimiter;
use crate::types::{exit_tag, OrderType, AMT_DUST};

pub const DEFAULT_QUEUE_CAP: usize = 1000;
const MAX_NET_RETRY: u32 = 3;
const RETRY_BASE_MS: u64 = 500;

/// What the worker should do with an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdAction {
    Enter,
    Exit,
    /// Replace the resting entry at its new limit
    LimitEnter,
    /// Replace the resting exit at its new limit
    LimitExit,
    StopLoss,
    TakeProfit,
}

pub struct OrderTask {
    pub account: String,
    pub od: OrderRef,
    pub action: OdAction,
}

pub struct LiveWorker {
    handle: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

impl LiveWorker {
    /// Finish queued tasks, then stop.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(err) = self.handle.await {
            error!(%err, "live order worker panicked");
        }
    }
}

/// Start the worker and attach its queue to `eng`.
pub fn start_live_worker(eng: Arc<Engine>, cap: usize, limiter: RateLimiter) -> Result<LiveWorker> {
    let (tx, mut rx) = mpsc::channel::<OrderTask>(cap.max(1));
    eng.set_live_sender(tx)?;
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        info!("live order worker started");
        loop {
            tokio::select! {
                biased;
                task = rx.recv() => match task {
                    Some(task) => run_task(&eng, &limiter, task).await,
                    None => break,
                },
                _ = &mut stop_rx => {
                    while let Ok(task) = rx.try_recv() {
                        run_task(&eng, &limiter, task).await;
                    }
                    break;
                }
            }
        }
        info!("live order worker stopped");
    });
    Ok(LiveWorker { handle, stop_tx })
}

async fn run_task(eng: &Arc<Engine>, limiter: &RateLimiter, task: OrderTask) {
    let action = task.action;
    let account = task.account.clone();
    if let Err(err) = handle_task(eng, limiter, task).await {
        error!(account = %account, ?action, %err, "order task fail");
    }
}

/// Run one exchange call on the blocking pool, retrying timeouts.
async fn call_exchange<T, F>(eng: &Arc<Engine>, limiter: &RateLimiter, what: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn(&dyn Exchange) -> Result<T> + Send + Clone + 'static,
{
    let mut attempt = 0;
    loop {
        limiter.acquire().await?;
        let ex = eng.ctx.exchange.clone();
        let call = f.clone();
        let res = tokio::task::spawn_blocking(move || call(ex.as_ref()))
            .await
            .map_err(|e| TradeError::new(ErrKind::RunTime, format!("{} join: {}", what, e)))?;
        match res {
            Err(err) if err.is(ErrKind::NetTimeout) && attempt < MAX_NET_RETRY => {
                attempt += 1;
                warn!(what, attempt, %err, "exchange call timed out, retry");
                sleep(Duration::from_millis(RETRY_BASE_MS * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

async fn handle_task(eng: &Arc<Engine>, limiter: &RateLimiter, task: OrderTask) -> Result<()> {
    let acc = eng.account(&task.account)?.clone();
    match task.action {
        OdAction::Enter | OdAction::Exit => {
            let enter = task.action == OdAction::Enter;
            submit_leg(eng, limiter, &acc, &task.od, enter).await?;
        }
        OdAction::LimitEnter | OdAction::LimitExit => {
            let enter = task.action == OdAction::LimitEnter;
            let (order_id, symbol) = {
                let od = lock_od(&task.od);
                let id = if enter {
                    od.enter.order_id.clone()
                } else {
                    od.exit.as_ref().map(|e| e.order_id.clone()).unwrap_or_default()
                };
                (id, od.symbol.clone())
            };
            if !order_id.is_empty() {
                let account = task.account.clone();
                let res = call_exchange(eng, limiter, "cancel_order", move |ex| {
                    ex.cancel_order(&order_id, &symbol, &account)
                })
                .await?;
                if apply_exchange_order(eng, &acc, &task.od, enter, &res)? {
                    eng.sweep_done(&acc);
                    return Ok(());
                }
                clear_order_id(&task.od, enter);
            }
            submit_leg(eng, limiter, &acc, &task.od, enter).await?;
        }
        OdAction::StopLoss | OdAction::TakeProfit => {
            let kind = if task.action == OdAction::StopLoss {
                TriggerKind::StopLoss
            } else {
                TriggerKind::TakeProfit
            };
            submit_trigger(eng, limiter, &task.account, &task.od, kind).await?;
        }
    }
    eng.sweep_done(&acc);
    Ok(())
}

fn clear_order_id(od_ref: &OrderRef, enter: bool) {
    let mut od = lock_od(od_ref);
    if enter {
        od.enter.order_id.clear();
        od.dirty_enter = true;
    } else if let Some(exit) = od.exit.as_mut() {
        exit.order_id.clear();
        od.dirty_exit = true;
    }
}

/// Build the request for one leg, reserving wallet funds on entry.
fn prepare_leg(eng: &Engine, acc: &Arc<AccountState>, od_ref: &OrderRef, enter: bool) -> Result<Option<CreateOrderReq>> {
    let ctx = &eng.ctx;
    let ex = ctx.exchange.as_ref();
    let mut od = lock_od(od_ref);
    if od.status.is_done() {
        return Ok(None);
    }
    let position_side = if ctx.is_contract() {
        if od.short { "SHORT" } else { "LONG" }.to_string()
    } else {
        String::new()
    };
    let client_id = od.client_id(&ctx.config.name);
    if enter {
        if od.enter.is_closed() || !od.enter.order_id.is_empty() {
            return Ok(None);
        }
        let reserved = acc.lock_wallets().enter_od(&mut od, ctx);
        if let Err(err) = reserved {
            let mgr = OrderMgr { eng, acc };
            let msg = err.to_string();
            mgr.close_local(&mut od, exit_tag::FORCE_EXIT, 0.0, &msg, None, ctx.now_ms())?;
            warn!(order = %od.key(), %err, "entry dropped before submit");
            return Ok(None);
        }
        if od.enter.amount == 0.0 {
            let price = if od.enter.price > 0.0 {
                od.enter.price
            } else {
                ctx.prices.get(&od.symbol).unwrap_or(od.init_price)
            };
            if price <= 0.0 {
                return Err(TradeError::param(format!("no price to size {}", od.key())));
            }
            od.enter.amount = ex.prec_amount(&od.symbol, od.quote_cost / price)?;
            od.dirty_enter = true;
        }
        let sub = &od.enter;
        return Ok(Some(CreateOrderReq {
            symbol: od.symbol.clone(),
            order_type: sub.order_type,
            side: sub.side,
            amount: sub.amount,
            price: if sub.order_type.is_limit() { sub.price } else { 0.0 },
            account: acc.name.clone(),
            position_side,
            client_id,
            stop_price: 0.0,
        }));
    }
    let hold = od.hold_amount();
    let Some(exit) = od.exit.as_ref() else {
        return Ok(None);
    };
    if exit.is_closed() || !exit.order_id.is_empty() || hold <= AMT_DUST {
        return Ok(None);
    }
    let req = CreateOrderReq {
        symbol: od.symbol.clone(),
        order_type: exit.order_type,
        side: exit.side,
        amount: ex.prec_amount(&od.symbol, hold)?,
        price: if exit.order_type.is_limit() { exit.price } else { 0.0 },
        account: acc.name.clone(),
        position_side,
        client_id: format!("{}_x", client_id),
        stop_price: 0.0,
    };
    acc.lock_wallets().exit_od(&od, hold, ctx)?;
    Ok(Some(req))
}

async fn submit_leg(eng: &Arc<Engine>, limiter: &RateLimiter, acc: &Arc<AccountState>, od_ref: &OrderRef, enter: bool) -> Result<()> {
    let Some(req) = prepare_leg(eng, acc, od_ref, enter)? else {
        return Ok(());
    };
    debug!(symbol = %req.symbol, side = %req.side, amount = req.amount, "submit order");
    let res = call_exchange(eng, limiter, "create_order", move |ex| ex.create_order(&req)).await;
    match res {
        Ok(res) => {
            apply_exchange_order(eng, acc, od_ref, enter, &res)?;
        }
        Err(err) => {
            let mut od = lock_od(od_ref);
            od.info.status_msg = err.to_string();
            od.dirty_info = true;
            eng.save_od(&mut od);
            return Err(err);
        }
    }
    Ok(())
}

async fn submit_trigger(eng: &Arc<Engine>, limiter: &RateLimiter, account: &str, od_ref: &OrderRef, kind: TriggerKind) -> Result<()> {
    let (old_id, req, symbol) = {
        let od = lock_od(od_ref);
        let Some(state) = od.trigger(kind) else {
            return Ok(());
        };
        let req = if state.is_active() && od.hold_amount() > AMT_DUST && !od.status.is_done() {
            let trig = &state.trigger;
            Some(CreateOrderReq {
                symbol: od.symbol.clone(),
                order_type: if trig.limit > 0.0 { OrderType::Limit } else { OrderType::Market },
                side: od.exit_side(),
                amount: od.hold_amount(),
                price: trig.limit,
                account: account.to_string(),
                position_side: String::new(),
                client_id: format!("{}_{}", od.client_id(&eng.ctx.config.name), kind.as_str()),
                stop_price: trig.price,
            })
        } else {
            None
        };
        (state.order_id.clone(), req, od.symbol.clone())
    };
    if !old_id.is_empty() {
        let acc_name = account.to_string();
        call_exchange(eng, limiter, "cancel_order", move |ex| ex.cancel_order(&old_id, &symbol, &acc_name)).await?;
    }
    let new_id = match req {
        Some(req) => call_exchange(eng, limiter, "create_order", move |ex| ex.create_order(&req)).await?.id,
        None => String::new(),
    };
    let mut od = lock_od(od_ref);
    if let Some(state) = od.trigger_mut(kind) {
        state.order_id = new_id;
        state.save_old();
    }
    od.dirty_info = true;
    eng.save_od(&mut od);
    Ok(())
}

/// Copy an exchange report onto one leg and advance the order.
///
/// Returns true when the leg is closed afterwards.
pub fn apply_exchange_order(
    eng: &Engine,
    acc: &Arc<AccountState>,
    od_ref: &OrderRef,
    enter: bool,
    res: &ExchangeOrder,
) -> Result<bool> {
    let ctx = &eng.ctx;
    let now = ctx.now_ms();
    let mgr = OrderMgr { eng, acc };
    let mut od = lock_od(od_ref);
    let key = od.key();
    let sub = if enter {
        &mut od.enter
    } else {
        match od.exit.as_mut() {
            Some(e) => e,
            None => return Err(TradeError::internal(format!("exchange report without exit leg: {}", key))),
        }
    };
    if !res.id.is_empty() {
        sub.order_id = res.id.clone();
    }
    if sub.amount == 0.0 {
        sub.amount = res.amount;
    }
    sub.filled = res.filled;
    if res.average > 0.0 {
        sub.average = res.average;
    }
    if sub.price == 0.0 {
        sub.price = if res.price > 0.0 { res.price } else { res.average };
    }
    if let Some(fee) = res.fee.as_ref() {
        sub.fee = fee.cost;
        sub.fee_type = fee.currency.clone();
    }
    sub.update_at = res.timestamp.max(now);
    let full = sub.filled > 0.0 && sub.filled >= sub.amount - AMT_DUST;
    sub.status = if full || res.is_done() {
        OdStatus::Closed
    } else if sub.filled > 0.0 {
        OdStatus::PartOK
    } else {
        OdStatus::Init
    };
    let (status, filled, average) = (sub.status, sub.filled, sub.average);
    if enter {
        od.dirty_enter = true;
        match status {
            OdStatus::Closed if filled > 0.0 => {
                od.enter.amount = filled;
                od.status = InOutStatus::FullEnter;
                od.dirty_main = true;
                acc.lock_wallets().confirm_od_enter(&od, average, ctx)?;
                od.update_profits(average);
                eng.save_od(&mut od);
                eng.fire(&acc.name, &od, OdChange::EnterFill);
            }
            OdStatus::Closed => {
                mgr.close_local(&mut od, exit_tag::CANCEL, 0.0, "entry canceled by exchange", None, now)?;
            }
            OdStatus::PartOK if od.status == InOutStatus::Init => {
                od.status = InOutStatus::PartEnter;
                od.dirty_main = true;
                eng.save_od(&mut od);
                eng.fire(&acc.name, &od, OdChange::Enter);
            }
            _ => eng.save_od(&mut od),
        }
    } else {
        od.dirty_exit = true;
        match status {
            OdStatus::Closed if filled > 0.0 => {
                od.status = InOutStatus::FullExit;
                od.dirty_main = true;
                od.update_profits(average);
                acc.lock_wallets().confirm_od_exit(&od, average, ctx)?;
                eng.save_od(&mut od);
                eng.fire(&acc.name, &od, OdChange::ExitFill);
                mgr.after_exit(&od);
            }
            OdStatus::PartOK => {
                od.status = InOutStatus::PartExit;
                od.dirty_main = true;
                eng.save_od(&mut od);
            }
            _ => eng.save_od(&mut od),
        }
    }
    Ok(status == OdStatus::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::ExecMode;
    use crate::exchange::SimExchange;
    use crate::runtime::Ctx;
    use crate::scheduler::env::BarEnv;
    use crate::strategies::{EnterReq, ExitReq};
    use crate::types::Kline;

    fn live_engine(ex: Arc<SimExchange>) -> Arc<Engine> {
        let mut cfg = Config::default();
        cfg.run_timeframes = vec!["1h".into()];
        cfg.wallet_amounts.insert("USDT".into(), 1000.0);
        let ctx = Ctx::live(Arc::new(cfg), ex, 7);
        Arc::new(Engine::new(Arc::new(ctx), ExecMode::Live))
    }

    fn fresh_env(eng: &Engine) -> BarEnv {
        let mut env = BarEnv::new("BTC/USDT", "1h", 1, 10);
        let start = eng.now_ms() / 3_600_000 * 3_600_000 - 3_600_000;
        env.push(Kline::new(start, 100.0, 100.0, 100.0, 100.0, 1.0)).unwrap();
        eng.ctx.prices.set_bar_price("BTC/USDT", 100.0);
        env
    }

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_queue_submits_and_fills() {
        let ex = Arc::new(SimExchange::default());
        ex.set_price("BTC/USDT", 100.0);
        let eng = live_engine(ex.clone());
        let worker = start_live_worker(eng.clone(), 16, RateLimiter::with_rate(100)).unwrap();
        let env = fresh_env(&eng);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let mut req = EnterReq::long("go").with_cost(100.0);
        req.strat_name = "s".into();
        let od = mgr.enter_order(&env, &req, false).unwrap().unwrap();
        let check = od.clone();
        wait_for(move || lock_od(&check).status == InOutStatus::FullEnter).await;
        assert_eq!(ex.placed_orders().len(), 1);
        assert!((lock_od(&od).enter.filled - 1.0).abs() < 1e-9);

        let res = mgr.exit_open_orders(&[], &ExitReq::new("done").forced()).unwrap();
        assert_eq!(res.len(), 1);
        worker.stop().await;
        assert_eq!(ex.placed_orders().len(), 2);
        assert_eq!(mgr.acc.open_count(), 0);
        assert_eq!(lock_od(&od).exit_tag, "done");
    }

    #[tokio::test]
    async fn test_retry_on_timeout() {
        let ex = Arc::new(SimExchange::default());
        ex.set_price("BTC/USDT", 100.0);
        ex.fail_next_calls(2);
        let eng = live_engine(ex.clone());
        let worker = start_live_worker(eng.clone(), 16, RateLimiter::with_rate(100)).unwrap();
        let env = fresh_env(&eng);
        let mgr = OrderMgr::new(&eng, "default").unwrap();
        let mut req = EnterReq::long("go").with_cost(100.0);
        req.strat_name = "s".into();
        let od = mgr.enter_order(&env, &req, false).unwrap().unwrap();
        worker.stop().await;
        assert_eq!(lock_od(&od).status, InOutStatus::FullEnter);
        assert_eq!(ex.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_second_worker_rejected() {
        let eng = live_engine(Arc::new(SimExchange::default()));
        let worker = start_live_worker(eng.clone(), 4, RateLimiter::with_rate(10)).unwrap();
        assert!(start_live_worker(eng.clone(), 4, RateLimiter::with_rate(10)).is_err());
        worker.stop().await;
    }
}
