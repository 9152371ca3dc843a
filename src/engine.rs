//! Per-run shared state
//!
//! One [`Engine`] exists per run (a relay replay creates its own). It owns
//! the open-order tables, wallets and bookkeeping of every account, the
//! backtest history list, the order-change event queue and the optional
//! persistence store.
//!
//! Lock order is `open_ods > order > wallet`: code holding an order lock
//! never takes an open-orders lock, and wallet locks are always innermost.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{ErrKind, FailOpen, Result, TradeError};
use crate::order_mgr::live::OrderTask;
use crate::orders::{InOutOrder, InOutStatus};
use crate::runtime::{Ctx, RunMode};
use crate::scheduler::score::PerfBook;
use crate::state_manager::SqliteStateManager;
use crate::types::LOCK_WARN_SECS;
use crate::wallet::Wallets;

pub type OrderRef = Arc<Mutex<InOutOrder>>;

pub fn new_order_ref(od: InOutOrder) -> OrderRef {
    Arc::new(Mutex::new(od))
}

/// Guard over one order. Logs a warning when held too long.
pub struct OdLock<'a> {
    guard: MutexGuard<'a, InOutOrder>,
    since: Instant,
}

impl Deref for OdLock<'_> {
    type Target = InOutOrder;

    fn deref(&self) -> &InOutOrder {
        &self.guard
    }
}

impl DerefMut for OdLock<'_> {
    fn deref_mut(&mut self) -> &mut InOutOrder {
        &mut self.guard
    }
}

impl Drop for OdLock<'_> {
    fn drop(&mut self) {
        let held = self.since.elapsed();
        if held.as_secs() >= LOCK_WARN_SECS {
            warn!(order = %self.guard.key(), held_ms = held.as_millis() as u64, "order lock held too long");
        }
    }
}

/// Lock an order, recovering from a poisoned mutex.
pub fn lock_od(od: &OrderRef) -> OdLock<'_> {
    OdLock {
        guard: od.lock().unwrap_or_else(|e| e.into_inner()),
        since: Instant::now(),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Order lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OdChange {
    New,
    Enter,
    EnterFill,
    Exit,
    ExitFill,
}

#[derive(Debug, Clone)]
pub struct OdEvent {
    pub account: String,
    pub order: InOutOrder,
    pub kind: OdChange,
    /// Clock value to expose while listeners run
    pub at_ms: i64,
}

type Listener = Box<dyn Fn(&str, &InOutOrder, OdChange) + Send + Sync>;

/// How orders reach a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Simulated against bars
    Local,
    /// Simulated against the live book ticker
    LocalLive,
    /// Sent to the exchange
    Live,
}

/// Per-bar simultaneous-open counters
#[derive(Debug, Default, Clone)]
pub struct SimulOpen {
    pub bar_ms: i64,
    pub total: usize,
    pub by_policy: HashMap<String, usize>,
}

/// Scalar bookkeeping of an account.
#[derive(Debug, Default, Clone)]
pub struct AccountMisc {
    /// Per-order stake derived from `stake_pct`
    pub stake_pct_amt: f64,
    /// Legal value paid in, grows on each liquidation refill
    pub total_invest: f64,
    /// Entries dropped because their amount rounded to zero
    pub zero_amts: usize,
    pub simul: SimulOpen,
    pub max_open_num: usize,
}

pub struct AccountState {
    pub name: String,
    open_ods: Mutex<BTreeMap<i64, OrderRef>>,
    /// symbol -> pending limit entries waiting for the book to cross
    trigger_ods: Mutex<HashMap<String, BTreeMap<i64, OrderRef>>>,
    wallets: Mutex<Wallets>,
    no_enter_until: AtomicI64,
    fail_opens: Mutex<BTreeMap<FailOpen, usize>>,
    misc: Mutex<AccountMisc>,
    perfs: Mutex<PerfBook>,
}

impl AccountState {
    pub fn new(name: &str, wallets: Wallets) -> Self {
        Self {
            name: name.to_string(),
            open_ods: Mutex::new(BTreeMap::new()),
            trigger_ods: Mutex::new(HashMap::new()),
            wallets: Mutex::new(wallets),
            no_enter_until: AtomicI64::new(0),
            fail_opens: Mutex::new(BTreeMap::new()),
            misc: Mutex::new(AccountMisc::default()),
            perfs: Mutex::new(PerfBook::default()),
        }
    }

    pub fn lock_open(&self) -> MutexGuard<'_, BTreeMap<i64, OrderRef>> {
        lock(&self.open_ods)
    }

    pub fn lock_triggers(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<i64, OrderRef>>> {
        lock(&self.trigger_ods)
    }

    pub fn lock_wallets(&self) -> MutexGuard<'_, Wallets> {
        lock(&self.wallets)
    }

    pub fn misc(&self) -> MutexGuard<'_, AccountMisc> {
        lock(&self.misc)
    }

    pub fn perfs(&self) -> MutexGuard<'_, PerfBook> {
        lock(&self.perfs)
    }

    /// Handles of all open orders, in id order.
    pub fn open_orders(&self) -> Vec<OrderRef> {
        self.lock_open().values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock_open().len()
    }

    /// Cloned snapshots of open orders accepted by `filter`.
    pub fn open_snapshots<F>(&self, filter: F) -> Vec<InOutOrder>
    where
        F: Fn(&InOutOrder) -> bool,
    {
        self.open_orders()
            .iter()
            .filter_map(|r| {
                let od = lock_od(r);
                if filter(&od) {
                    Some(od.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn add_open(&self, id: i64, od: OrderRef) {
        let mut ods = self.lock_open();
        ods.insert(id, od);
        let num = ods.len();
        drop(ods);
        let mut misc = self.misc();
        if num > misc.max_open_num {
            misc.max_open_num = num;
        }
    }

    pub fn add_trigger(&self, symbol: &str, id: i64, od: OrderRef) {
        self.lock_triggers()
            .entry(symbol.to_string())
            .or_default()
            .insert(id, od);
    }

    pub fn take_triggers(&self, symbol: &str) -> Vec<OrderRef> {
        self.lock_triggers()
            .remove(symbol)
            .map(|m| m.into_values().collect())
            .unwrap_or_default()
    }

    pub fn no_enter_until(&self) -> i64 {
        self.no_enter_until.load(Ordering::SeqCst)
    }

    pub fn set_no_enter_until(&self, ms: i64) {
        self.no_enter_until.store(ms, Ordering::SeqCst);
    }

    pub fn add_fail_open(&self, tag: FailOpen) {
        *lock(&self.fail_opens).entry(tag).or_insert(0) += 1;
    }

    pub fn add_fail_opens(&self, tag: FailOpen, num: usize) {
        if num > 0 {
            *lock(&self.fail_opens).entry(tag).or_insert(0) += num;
        }
    }

    pub fn fail_opens(&self) -> BTreeMap<FailOpen, usize> {
        lock(&self.fail_opens).clone()
    }
}

pub struct Engine {
    pub ctx: Arc<Ctx>,
    pub mode: ExecMode,
    accounts: BTreeMap<String, Arc<AccountState>>,
    fake_id: AtomicI64,
    hist_ods: Mutex<Vec<InOutOrder>>,
    ban_pairs_until: Mutex<HashMap<String, i64>>,
    listeners: RwLock<Vec<(String, Listener)>>,
    events: Mutex<VecDeque<OdEvent>>,
    bot_running: AtomicBool,
    store: Option<Arc<SqliteStateManager>>,
    live_tx: OnceLock<mpsc::Sender<OrderTask>>,
}

impl Engine {
    /// Create the state for a run. Wallets start from `wallet_amounts`.
    pub fn new(ctx: Arc<Ctx>, mode: ExecMode) -> Self {
        let cfg = ctx.config.clone();
        let mut accounts = BTreeMap::new();
        for name in cfg.account_names() {
            let mut wallets = Wallets::new(&name, cfg.margin_add_rate, cfg.min_open_rate);
            wallets.env_real = ctx.env_real();
            wallets.set_wallets(&cfg.wallet_amounts);
            accounts.insert(name.clone(), Arc::new(AccountState::new(&name, wallets)));
        }
        Self {
            ctx,
            mode,
            accounts,
            fake_id: AtomicI64::new(1),
            hist_ods: Mutex::new(Vec::new()),
            ban_pairs_until: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            bot_running: AtomicBool::new(true),
            store: None,
            live_tx: OnceLock::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<SqliteStateManager>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&Arc<SqliteStateManager>> {
        self.store.as_ref()
    }

    pub fn account(&self, name: &str) -> Result<&Arc<AccountState>> {
        self.accounts
            .get(name)
            .ok_or_else(|| TradeError::param(format!("unknown account: {}", name)))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Arc<AccountState>> {
        self.accounts.values()
    }

    pub fn account_names(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    pub fn now_ms(&self) -> i64 {
        self.ctx.now_ms()
    }

    pub fn is_backtest(&self) -> bool {
        self.ctx.run_mode == RunMode::Backtest
    }

    pub fn bot_running(&self) -> bool {
        self.bot_running.load(Ordering::SeqCst)
    }

    pub fn set_bot_running(&self, val: bool) {
        self.bot_running.store(val, Ordering::SeqCst);
    }

    pub fn ban_pair(&self, symbol: &str, until_ms: i64) {
        lock(&self.ban_pairs_until).insert(symbol.to_string(), until_ms);
    }

    pub fn pair_banned_until(&self, symbol: &str) -> i64 {
        lock(&self.ban_pairs_until).get(symbol).copied().unwrap_or(0)
    }

    pub(crate) fn set_live_sender(&self, tx: mpsc::Sender<OrderTask>) -> Result<()> {
        self.live_tx
            .set(tx)
            .map_err(|_| TradeError::new(ErrKind::RunTime, "live order queue already started"))
    }

    pub(crate) fn live_sender(&self) -> Option<&mpsc::Sender<OrderTask>> {
        self.live_tx.get()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist the dirty parts of an order, assigning an id on first save.
    ///
    /// Failures are logged; dirty flags stay set so the next save retries.
    pub fn save_od(&self, od: &mut InOutOrder) {
        if od.status == InOutStatus::Delete {
            return;
        }
        od.nan_inf_to(0.0);
        match &self.store {
            Some(store) => match store.save_order(od) {
                Ok(()) => od.clear_dirty(),
                Err(err) => {
                    warn!(order = %od.key(), %err, "save order fail");
                    if od.id == 0 {
                        od.id = -self.fake_id.fetch_add(1, Ordering::SeqCst);
                    }
                }
            },
            None => {
                if od.id == 0 {
                    od.id = self.fake_id.fetch_add(1, Ordering::SeqCst);
                }
                od.clear_dirty();
            }
        }
        let id = od.id;
        od.enter.inout_id = id;
        if let Some(exit) = od.exit.as_mut() {
            exit.inout_id = id;
        }
    }

    /// Save a new order and add it to the account's open table.
    pub fn register_open(&self, acc: &AccountState, mut od: InOutOrder) -> OrderRef {
        self.save_od(&mut od);
        let id = od.id;
        let od_ref = new_order_ref(od);
        acc.add_open(id, od_ref.clone());
        od_ref
    }

    /// Move finished orders out of the open table into history.
    pub fn sweep_done(&self, acc: &AccountState) -> usize {
        let refs: Vec<(i64, OrderRef)> = acc.lock_open().iter().map(|(k, v)| (*k, v.clone())).collect();
        let mut done = Vec::new();
        for (id, od_ref) in refs {
            let mut od = lock_od(&od_ref);
            if od.status.is_done() {
                if od.is_dirty() {
                    self.save_od(&mut od);
                }
                done.push((id, od.clone()));
            }
        }
        if done.is_empty() {
            return 0;
        }
        {
            let mut ods = acc.lock_open();
            for (id, _) in done.iter() {
                ods.remove(id);
            }
        }
        {
            let mut trigs = acc.lock_triggers();
            for (id, od) in done.iter() {
                if let Some(m) = trigs.get_mut(&od.symbol) {
                    m.remove(id);
                }
            }
        }
        let num = done.len();
        for (_, od) in done {
            self.add_hist(od);
        }
        num
    }

    /// Record a finished order. History is kept for backtests only.
    pub fn add_hist(&self, od: InOutOrder) {
        if self.is_backtest() {
            lock(&self.hist_ods).push(od);
        }
    }

    pub fn hist_orders(&self) -> Vec<InOutOrder> {
        lock(&self.hist_ods).clone()
    }

    /// Drop history entries that never filled.
    pub fn retain_filled_hist(&self) {
        lock(&self.hist_ods).retain(|od| od.enter.filled > 0.0);
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn add_listener<F>(&self, name: &str, f: F)
    where
        F: Fn(&str, &InOutOrder, OdChange) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), Box::new(f)));
    }

    /// Queue an order change; delivered by [`Engine::take_events`] consumers.
    pub fn fire(&self, account: &str, od: &InOutOrder, kind: OdChange) {
        let at_ms = match kind {
            OdChange::New | OdChange::Enter => od.enter_at,
            OdChange::EnterFill => od.enter.update_at,
            OdChange::Exit => od.exit_at,
            OdChange::ExitFill => od.exit.as_ref().map(|e| e.update_at).unwrap_or(od.exit_at),
        };
        debug!(account, order = %od.key(), ?kind, "order change");
        lock(&self.events).push_back(OdEvent {
            account: account.to_string(),
            order: od.clone(),
            kind,
            at_ms,
        });
    }

    pub fn take_events(&self) -> Vec<OdEvent> {
        lock(&self.events).drain(..).collect()
    }

    /// Run global listeners for one event with the clock pinned to its time.
    pub fn notify(&self, ev: &OdEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        if listeners.is_empty() {
            return;
        }
        let prev = self.ctx.clock.raw();
        if !self.ctx.clock.is_real() && ev.at_ms > 0 {
            self.ctx.clock.set(ev.at_ms);
        }
        for (_, f) in listeners.iter() {
            f(&ev.account, &ev.order, ev.kind);
        }
        if !self.ctx.clock.is_real() {
            self.ctx.clock.set(prev);
        }
    }

    /// Drain events without a scheduler: listeners only.
    pub fn flush_events(&self) -> usize {
        let evs = self.take_events();
        for ev in evs.iter() {
            self.notify(ev);
        }
        evs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::SimExchange;
    use crate::types::OrderType;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> Engine {
        let mut cfg = Config::default();
        cfg.run_timeframes = vec!["1h".into()];
        cfg.wallet_amounts.insert("USDT".into(), 1000.0);
        let ctx = Ctx::backtest(Arc::new(cfg), Arc::new(SimExchange::default()), 0);
        Engine::new(Arc::new(ctx), ExecMode::Local)
    }

    fn order() -> InOutOrder {
        InOutOrder::new(-1, "BTC/USDT", 1, "1h", "s", false, "long", 3_600_000, OrderType::Market)
    }

    #[test]
    fn test_register_assigns_ids() {
        let eng = engine();
        let acc = eng.account("default").unwrap().clone();
        let a = eng.register_open(&acc, order());
        let b = eng.register_open(&acc, order());
        assert_ne!(lock_od(&a).id, lock_od(&b).id);
        assert!(!lock_od(&a).is_dirty());
        assert_eq!(acc.open_count(), 2);
        assert_eq!(acc.misc().max_open_num, 2);
    }

    #[test]
    fn test_sweep_moves_done_to_hist() {
        let eng = engine();
        let acc = eng.account("default").unwrap().clone();
        let a = eng.register_open(&acc, order());
        let _b = eng.register_open(&acc, order());
        lock_od(&a).status = InOutStatus::FullExit;
        assert_eq!(eng.sweep_done(&acc), 1);
        assert_eq!(acc.open_count(), 1);
        assert_eq!(eng.hist_orders().len(), 1);
    }

    #[test]
    fn test_listener_sees_event_time() {
        let eng = engine();
        let seen = Arc::new(AtomicI64::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (s, c, clock) = (seen.clone(), calls.clone(), eng.ctx.clock.clone());
        eng.add_listener("t", move |_, _, kind| {
            assert_eq!(kind, OdChange::New);
            s.store(clock.now_ms(), Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
        });
        eng.ctx.clock.set(9_000_000);
        eng.fire("default", &order(), OdChange::New);
        assert_eq!(eng.flush_events(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3_600_000);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(eng.ctx.clock.now_ms(), 9_000_000);
    }

    #[test]
    fn test_fail_open_counts() {
        let eng = engine();
        let acc = eng.account("default").unwrap();
        acc.add_fail_open(FailOpen::NanNum);
        acc.add_fail_opens(FailOpen::NumLimit, 3);
        acc.add_fail_opens(FailOpen::NoEntry, 0);
        let map = acc.fail_opens();
        assert_eq!(map[&FailOpen::NanNum], 1);
        assert_eq!(map[&FailOpen::NumLimit], 3);
        assert!(!map.contains_key(&FailOpen::NoEntry));
    }
}
