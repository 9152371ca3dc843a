//! Strategy Scheduler
//!
//! Owns the bar environments and the strategy jobs of every account.
//! For each incoming bar it:
//! 1. updates the matching [`BarEnv`]
//! 2. settles pending local orders against the bar
//! 3. runs `on_bar` for the jobs on that stream and `on_info_bar` for jobs
//!    subscribed to it
//! 4. hands the collected requests to the [`OrderMgr`]
//!
//! Jobs of `batch_in_out` strategies are parked in [`batch::BatchPools`] and
//! processed together once every pair of the timeframe has reported.

pub mod batch;
pub mod env;
pub mod job;
pub mod score;

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::{lock_od, Engine, ExecMode, OdChange, OrderRef};
use crate::errors::Result;
use crate::order_mgr::{EditAction, OdEdit, OrderMgr};
use crate::orders::InOutStatus;
use crate::runtime::RunMode;
use crate::strategies::{create_strategy, EnterReq, ExitReq, Strategy, TfScore, CUR_PAIR};
use crate::types::{Dirt, ExSymbol, PairBar};

use self::batch::BatchPools;
use self::env::{env_key, BarEnv, DEFAULT_BAR_CACHE};
use self::job::StratJob;

/// Live bars delayed at least this long (and half their timeframe) may not open orders.
const MIN_BAR_EXPIRE_MS: i64 = 60_000;

/// Jobs of one stream, keyed by policy id
pub type EnvJobs = BTreeMap<String, StratJob>;

/// A job that receives bars of another stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InfoSub {
    account: String,
    /// Stream the job trades on
    main_key: String,
    strat_id: String,
}

/// Outcome of [`Scheduler::refresh_jobs`].
#[derive(Debug, Default)]
pub struct RefreshResult {
    /// pair -> timeframe -> bars to replay before trading
    pub warms: BTreeMap<String, BTreeMap<String, usize>>,
    /// Unfilled entries of jobs that were disabled
    pub unfilled: Vec<OrderRef>,
    /// Pairs no timeframe could be picked for, per policy
    pub failed: BTreeMap<String, Vec<String>>,
}

impl RefreshResult {
    fn add_warm(&mut self, pair: &str, tf: &str, num: usize) {
        let slot = self
            .warms
            .entry(pair.to_string())
            .or_default()
            .entry(tf.to_string())
            .or_insert(0);
        *slot = (*slot).max(num);
    }
}

/// Working prices of an order before the strategy ran.
#[derive(Debug, Clone, PartialEq)]
struct OdSnap {
    enter_limit: f64,
    exit_limit: f64,
    stop_loss: (f64, f64),
    take_profit: (f64, f64),
}

fn snap_orders(job: &StratJob) -> HashMap<i64, OdSnap> {
    job.orders(Dirt::Both)
        .iter()
        .map(|r| {
            let od = lock_od(r);
            let pair = |t: Option<&crate::orders::TriggerState>| {
                t.map(|s| (s.trigger.price, s.trigger.limit)).unwrap_or((0.0, 0.0))
            };
            let snap = OdSnap {
                enter_limit: od.enter.price,
                exit_limit: od.exit.as_ref().map(|e| e.price).unwrap_or(0.0),
                stop_loss: pair(od.stop_loss()),
                take_profit: pair(od.take_profit()),
            };
            (od.id, snap)
        })
        .collect()
}

/// Working-price changes made during this bar, as order edits.
fn collect_edits(job: &StratJob, before: &HashMap<i64, OdSnap>) -> Vec<OdEdit> {
    let mut res = Vec::new();
    let now_snap = snap_orders(job);
    for od_ref in job.orders(Dirt::Both) {
        let (id, entered) = {
            let od = lock_od(&od_ref);
            (od.id, od.status >= InOutStatus::FullEnter)
        };
        let (Some(old), Some(cur)) = (before.get(&id), now_snap.get(&id)) else {
            continue;
        };
        let mut push = |action| {
            res.push(OdEdit {
                od: od_ref.clone(),
                action,
            })
        };
        if !entered {
            if old.enter_limit != cur.enter_limit {
                push(EditAction::LimitEnter);
            }
            continue;
        }
        if old.stop_loss != cur.stop_loss {
            push(EditAction::StopLoss);
        }
        if old.take_profit != cur.take_profit {
            push(EditAction::TakeProfit);
        }
        if old.exit_limit != cur.exit_limit {
            push(EditAction::LimitExit);
        }
    }
    res
}

/// Run a strategy hook, turning a panic into a logged skip.
fn guard<F: FnOnce()>(what: &str, label: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            error!(job = label, what, "strategy hook panicked, bar skipped");
            false
        }
    }
}

fn job_label(job: &StratJob) -> String {
    format!("{}/{}/{}", job.strat_id, job.pair(), job.timeframe)
}

pub struct Scheduler {
    pub eng: Arc<Engine>,
    envs: HashMap<String, BarEnv>,
    /// account -> env key -> policy id -> job
    jobs: BTreeMap<String, BTreeMap<String, EnvJobs>>,
    /// info env key -> subscribers
    info_subs: HashMap<String, Vec<InfoSub>>,
    /// pair -> policy id -> strategy instance
    pair_strats: HashMap<String, HashMap<String, Arc<dyn Strategy>>>,
    sids: HashMap<String, i32>,
    batches: BatchPools,
}

impl Scheduler {
    pub fn new(eng: Arc<Engine>) -> Self {
        Self {
            eng,
            envs: HashMap::new(),
            jobs: BTreeMap::new(),
            info_subs: HashMap::new(),
            pair_strats: HashMap::new(),
            sids: HashMap::new(),
            batches: BatchPools::default(),
        }
    }

    pub fn env(&self, symbol: &str, tf: &str) -> Option<&BarEnv> {
        self.envs.get(&env_key(symbol, tf))
    }

    pub fn env_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.envs.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// `(symbol, timeframe)` of every stream with jobs or subscribers, sorted
    pub fn streams(&self) -> Vec<(String, String)> {
        let mut res: Vec<(String, String)> = self
            .envs
            .values()
            .map(|e| (e.symbol.clone(), e.timeframe.clone()))
            .collect();
        res.sort();
        res
    }

    pub fn job(&self, account: &str, symbol: &str, tf: &str, strat_id: &str) -> Option<&StratJob> {
        self.jobs.get(account)?.get(&env_key(symbol, tf))?.get(strat_id)
    }

    pub fn job_mut(&mut self, account: &str, symbol: &str, tf: &str, strat_id: &str) -> Option<&mut StratJob> {
        self.jobs.get_mut(account)?.get_mut(&env_key(symbol, tf))?.get_mut(strat_id)
    }

    /// Jobs across all accounts
    pub fn job_count(&self) -> usize {
        self.jobs.values().flat_map(|m| m.values()).map(|j| j.len()).sum()
    }

    /// `(symbol, timeframe)` of every job of one account, sorted
    pub fn job_pairs(&self, account: &str) -> Vec<(String, String)> {
        let mut res: Vec<(String, String)> = self
            .jobs
            .get(account)
            .into_iter()
            .flat_map(|m| m.values())
            .flat_map(|jobs| jobs.values())
            .map(|j| (j.pair().to_string(), j.timeframe.clone()))
            .collect();
        res.sort();
        res.dedup();
        res
    }

    /// `(symbol, timeframe, strat_id)` of every job of one account, sorted
    pub fn job_keys(&self, account: &str) -> Vec<(String, String, String)> {
        let mut res: Vec<(String, String, String)> = self
            .jobs
            .get(account)
            .into_iter()
            .flat_map(|m| m.values())
            .flat_map(|jobs| jobs.values())
            .map(|j| (j.pair().to_string(), j.timeframe.clone(), j.strat_id.clone()))
            .collect();
        res.sort();
        res
    }

    fn sid_for(&mut self, symbol: &str) -> i32 {
        let next = self.sids.len() as i32 + 1;
        *self.sids.entry(symbol.to_string()).or_insert(next)
    }

    fn ensure_env(&mut self, symbol: &str, tf: &str, warmup: usize) -> String {
        let key = env_key(symbol, tf);
        if !self.envs.contains_key(&key) {
            let sid = self.sid_for(symbol);
            let cap = DEFAULT_BAR_CACHE.max(warmup + 10);
            self.envs.insert(key.clone(), BarEnv::new(symbol, tf, sid, cap));
        }
        key
    }

    // ========================================================================
    // Job refresh
    // ========================================================================

    /// Rebuild the job set for a new pair universe.
    ///
    /// Every existing job is first forbidden to open; jobs picked again are
    /// re-enabled. Forbidden jobs with positions stay to track them, the
    /// rest get `on_shutdown` and are dropped. `tf_scores` missing a pair
    /// scores every allowed timeframe 1.
    pub fn refresh_jobs(&mut self, pairs: &[String], tf_scores: &HashMap<String, Vec<TfScore>>) -> Result<RefreshResult> {
        let eng = self.eng.clone();
        let cfg = eng.ctx.config.clone();
        let mut res = RefreshResult::default();
        for acc_jobs in self.jobs.values_mut() {
            for job in acc_jobs.values_mut().flat_map(|m| m.values_mut()) {
                job.set_forbid(true);
            }
        }
        let accounts = eng.account_names();
        let mut acc_pairs: HashMap<String, usize> = HashMap::new();
        for pol in cfg.run_policy.iter() {
            let pol_id = pol.id();
            let base = create_strategy(pol, "")?;
            let max_pair = if pol.max_pair == 0 { usize::MAX } else { pol.max_pair };
            let cur_pairs: Vec<String> = if !pol.pairs.is_empty() {
                pol.pairs.clone()
            } else if !pairs.is_empty() {
                pairs.to_vec()
            } else {
                cfg.pairs.clone()
            };
            let mut hold_num = 0;
            for pair in cur_pairs.iter() {
                if hold_num >= max_pair {
                    break;
                }
                let allowed = if !pol.run_timeframes.is_empty() {
                    pol.run_timeframes.clone()
                } else if !base.run_timeframes().is_empty() {
                    base.run_timeframes()
                } else {
                    cfg.run_timeframes.clone()
                };
                let scores = match tf_scores.get(pair) {
                    Some(s) => s.clone(),
                    None => allowed
                        .iter()
                        .map(|tf| TfScore {
                            timeframe: tf.clone(),
                            score: 1.0,
                        })
                        .collect(),
                };
                let min_score = if base.min_tf_score() > 0.0 { base.min_tf_score() } else { cfg.min_tf_score };
                let Some(tf) = base.pick_timeframe(min_score, &allowed, &scores) else {
                    res.failed.entry(pol_id.clone()).or_default().push(pair.clone());
                    continue;
                };
                let existing = self.pair_strats.get(pair).and_then(|m| m.get(&pol_id)).cloned();
                let stgy = match existing {
                    Some(s) => s,
                    None => {
                        let s = if pol.pair_params.contains_key(pair) {
                            create_strategy(pol, pair)?
                        } else {
                            base.clone()
                        };
                        self.pair_strats
                            .entry(pair.clone())
                            .or_default()
                            .insert(pol_id.clone(), s.clone());
                        s
                    }
                };
                hold_num += 1;
                let warmup = stgy.warmup_num();
                let key = self.ensure_env(pair, &tf, warmup);
                res.add_warm(pair, &tf, warmup);
                let sid = self.envs.get(&key).map(|e| e.sid).unwrap_or(0);
                for account in accounts.iter() {
                    let acc_cap = cfg.account(account).max_pair;
                    let acc_jobs = self.jobs.entry(account.clone()).or_default();
                    let env_jobs = acc_jobs.entry(key.clone()).or_default();
                    if let Some(job) = env_jobs.get_mut(&pol_id) {
                        job.set_forbid(false);
                        apply_dirt(job, pol.dirt());
                        continue;
                    }
                    let used = acc_pairs.entry(account.clone()).or_insert(0);
                    if acc_cap > 0 && *used >= acc_cap {
                        continue;
                    }
                    *used += 1;
                    let market = if cfg.is_contract() { "linear" } else { "spot" };
                    let exs = ExSymbol::new(sid, eng.ctx.exchange.name(), market, pair);
                    let mut job = StratJob::new(stgy.clone(), &pol_id, exs, &tf, account, cfg.clone());
                    apply_dirt(&mut job, pol.dirt());
                    let subs = stgy.on_pair_infos(&job);
                    env_jobs.insert(pol_id.clone(), job);
                    for sub in subs {
                        let sym = if sub.symbol == CUR_PAIR { pair.clone() } else { sub.symbol.clone() };
                        let info_key = self.ensure_env(&sym, &sub.timeframe, sub.warmup);
                        res.add_warm(&sym, &sub.timeframe, sub.warmup);
                        let item = InfoSub {
                            account: account.clone(),
                            main_key: key.clone(),
                            strat_id: pol_id.clone(),
                        };
                        let list = self.info_subs.entry(info_key).or_default();
                        if !list.contains(&item) {
                            list.push(item);
                        }
                    }
                    debug!(account = %account, strategy = %pol_id, pair = %pair, tf = %tf, "job created");
                }
            }
        }
        for (pol_id, failed) in res.failed.iter() {
            info!(strategy = %pol_id, num = failed.len(), pairs = ?failed, "no timeframe passed the score");
        }
        self.drop_forbidden(&mut res);
        Ok(res)
    }

    /// Remove forbidden jobs without positions and their streams.
    fn drop_forbidden(&mut self, res: &mut RefreshResult) {
        let eng = self.eng.clone();
        let mut removed: Vec<InfoSub> = Vec::new();
        let mut kept_pairs = Vec::new();
        for (account, acc_jobs) in self.jobs.iter_mut() {
            let Ok(acc) = eng.account(account) else {
                continue;
            };
            for (key, env_jobs) in acc_jobs.iter_mut() {
                let ids: Vec<String> = env_jobs
                    .iter()
                    .filter(|(_, j)| j.max_open_long == -1 && j.max_open_short == -1)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    let Some(job) = env_jobs.get_mut(&id) else {
                        continue;
                    };
                    let (pair, tf) = (job.pair().to_string(), job.timeframe.clone());
                    let ods = acc.open_snapshots(|o| o.symbol == pair && o.timeframe == tf && o.strategy == id);
                    for od in ods.iter().filter(|o| o.enter.filled == 0.0) {
                        if let Some(r) = acc.open_orders().into_iter().find(|r| lock_od(r).id == od.id) {
                            res.unfilled.push(r);
                        }
                    }
                    if ods.iter().any(|o| o.enter.filled > 0.0) {
                        kept_pairs.push(pair);
                        continue;
                    }
                    let strat = job.strat.clone();
                    let label = job_label(job);
                    guard("on_shutdown", &label, || strat.on_shutdown(job));
                    env_jobs.remove(&id);
                    removed.push(InfoSub {
                        account: account.clone(),
                        main_key: key.clone(),
                        strat_id: id,
                    });
                }
            }
            acc_jobs.retain(|_, jobs| !jobs.is_empty());
        }
        if !kept_pairs.is_empty() {
            kept_pairs.sort();
            kept_pairs.dedup();
            info!(num = kept_pairs.len(), pairs = ?kept_pairs, "disable open pairs");
        }
        for subs in self.info_subs.values_mut() {
            subs.retain(|s| !removed.contains(s));
        }
        self.info_subs.retain(|_, subs| !subs.is_empty());
        let mut live_keys: Vec<String> = self
            .jobs
            .values()
            .flat_map(|m| m.keys().cloned())
            .chain(self.info_subs.keys().cloned())
            .collect();
        live_keys.sort();
        live_keys.dedup();
        self.envs.retain(|k, _| live_keys.binary_search(k).is_ok());
        let valid: Vec<(String, String)> = self
            .jobs
            .values()
            .flat_map(|m| m.values())
            .flat_map(|jobs| jobs.values())
            .map(|j| (j.pair().to_string(), j.strat_id.clone()))
            .collect();
        for (pair, strats) in self.pair_strats.iter_mut() {
            strats.retain(|id, _| valid.iter().any(|(p, s)| p == pair && s == id));
        }
        self.pair_strats.retain(|_, m| !m.is_empty());
    }

    /// Run `on_shutdown` for every job.
    pub fn exit_jobs(&mut self) {
        for job in self.jobs.values_mut().flat_map(|m| m.values_mut()).flat_map(|j| j.values_mut()) {
            let (strat, label) = (job.strat.clone(), job_label(job));
            guard("on_shutdown", &label, || strat.on_shutdown(job));
        }
    }

    // ========================================================================
    // Bar dispatch
    // ========================================================================

    /// Feed one bar. Bars of streams without jobs are ignored.
    pub fn on_bar(&mut self, pb: &PairBar) -> Result<()> {
        let eng = self.eng.clone();
        let ctx = &eng.ctx;
        let key = env_key(&pb.symbol, &pb.timeframe);
        ctx.prices.set_bar_price(&pb.symbol, pb.bar.close);
        let live = ctx.run_mode == RunMode::Live;
        let Some(env) = self.envs.get_mut(&key) else {
            return Ok(());
        };
        if live && env.time_stop > pb.bar.time {
            debug!(env = %key, time = pb.bar.time, "expired bar skipped");
            return Ok(());
        }
        if live && env.time_stop > 0 && env.time_stop < pb.bar.time {
            let lack = ((pb.bar.time - env.time_stop) as f64 / env.tf_ms as f64).round() as i64;
            if lack > 0 {
                warn!(env = %key, num = lack, "bar env lack");
            }
        }
        env.push(pb.bar)?;
        let delay_ms = ctx.now_ms() - pb.bar.time - env.tf_ms;
        let expired = live && !pb.is_warmup && delay_ms >= MIN_BAR_EXPIRE_MS.max(env.tf_ms / 2);
        if expired {
            warn!(env = %key, delay_ms, "bar delayed, entries disabled");
        }
        let mut first_err = None;
        for account in eng.account_names() {
            if let Err(err) = self.on_account_bar(&account, &key, pb, expired) {
                error!(account = %account, env = %key, %err, "account bar fail");
                first_err.get_or_insert(err);
            }
        }
        self.dispatch_events();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn on_account_bar(&mut self, account: &str, key: &str, pb: &PairBar, expired: bool) -> Result<()> {
        let eng = self.eng.clone();
        let has_jobs = self.jobs.get(account).map(|m| m.contains_key(key)).unwrap_or(false);
        let has_info = self
            .info_subs
            .get(key)
            .map(|subs| subs.iter().any(|s| s.account == account))
            .unwrap_or(false);
        if !has_jobs && !has_info {
            return Ok(());
        }
        let mgr = OrderMgr::new(&eng, account)?;
        let bar = pb.bar;
        if !pb.is_warmup && mgr.acc.open_count() > 0 {
            mgr.fill_pending_orders(&pb.symbol, &pb.timeframe, &bar)?;
            mgr.update_by_bar(&pb.symbol, &bar)?;
            if eng.mode == ExecMode::LocalLive {
                mgr.check_book_triggers(&pb.symbol)?;
            }
        }
        let cur_orders: Vec<OrderRef> = mgr
            .acc
            .open_orders()
            .into_iter()
            .filter(|r| {
                let od = lock_od(r);
                od.symbol == pb.symbol && od.timeframe == pb.timeframe && od.status < InOutStatus::FullExit
            })
            .collect();
        let Self {
            envs,
            jobs,
            info_subs,
            batches,
            ..
        } = self;
        let Some(env) = envs.get(key) else {
            return Ok(());
        };
        let avg_vol = env.avg_volume(5);
        let stake_amt = job_stake(&eng, account);
        let mut enters: Vec<EnterReq> = Vec::new();
        let mut exits: Vec<ExitReq> = Vec::new();
        let mut edits: Vec<OdEdit> = Vec::new();
        if let Some(env_jobs) = jobs.get_mut(account).and_then(|m| m.get_mut(key)) {
            for (strat_id, job) in env_jobs.iter_mut() {
                let ods: Vec<OrderRef> = cur_orders
                    .iter()
                    .filter(|r| lock_od(r).strategy == *strat_id)
                    .cloned()
                    .collect();
                job.is_warmup = pb.is_warmup;
                job.check_ms = eng.now_ms();
                job.stake_amt = stake_amt;
                if eng.ctx.config.strat_perf.is_some() {
                    job.cost_rate = mgr.acc.perfs().score(strat_id, &pb.symbol, &pb.timeframe);
                }
                job.init_bar(&bar, avg_vol, ods);
                let before = snap_orders(job);
                let strat = job.strat.clone();
                let label = job_label(job);
                if !guard("on_bar", &label, || strat.on_bar(job, env)) {
                    job.entrys.clear();
                    job.exits.clear();
                    continue;
                }
                let mut is_batch = false;
                if !expired {
                    is_batch = strat.batch_in_out();
                    if is_batch {
                        batches.add_job(&pb.timeframe, account, strat_id, key, None, eng.now_ms());
                    } else {
                        enters.append(&mut job.entrys);
                    }
                }
                if !pb.is_warmup {
                    job.check_custom_exits();
                    edits.extend(collect_edits(job, &before));
                }
                if !is_batch {
                    exits.append(&mut job.exits);
                }
            }
        }
        if let Some(subs) = info_subs.get(key) {
            for sub in subs.iter().filter(|s| s.account == account) {
                let Some(job) = jobs
                    .get_mut(account)
                    .and_then(|m| m.get_mut(&sub.main_key))
                    .and_then(|m| m.get_mut(&sub.strat_id))
                else {
                    continue;
                };
                job.is_warmup = pb.is_warmup;
                let strat = job.strat.clone();
                let label = job_label(job);
                guard("on_info_bar", &label, || {
                    strat.on_info_bar(job, env, &pb.symbol, &pb.timeframe)
                });
                if strat.batch_info() {
                    batches.add_job(&pb.timeframe, account, &sub.strat_id, &sub.main_key, Some(&pb.symbol), eng.now_ms());
                }
            }
        }
        if pb.is_warmup || enters.len() + exits.len() + edits.len() == 0 {
            return Ok(());
        }
        mgr.process_orders(env, enters, exits, edits)?;
        Ok(())
    }

    /// Deliver queued order changes to listeners and to the owning job's
    /// `on_order_change`, with the clock pinned to each event's time.
    pub fn dispatch_events(&mut self) -> usize {
        let evs = self.eng.take_events();
        let clock = &self.eng.ctx.clock;
        for ev in evs.iter() {
            self.eng.notify(ev);
            let od = &ev.order;
            let key = env_key(&od.symbol, &od.timeframe);
            let Some(job) = self
                .jobs
                .get_mut(&ev.account)
                .and_then(|m| m.get_mut(&key))
                .and_then(|m| m.get_mut(&od.strategy))
            else {
                continue;
            };
            let prev = clock.raw();
            if !clock.is_real() && ev.at_ms > 0 {
                clock.set(ev.at_ms);
            }
            let strat = job.strat.clone();
            let label = job_label(job);
            guard("on_order_change", &label, || strat.on_order_change(job, od, ev.kind));
            if !clock.is_real() {
                clock.set(prev);
            }
        }
        evs.len()
    }

    /// A stream stopped delivering: exit its orders and reset the env.
    pub fn on_env_end(&mut self, symbol: &str, tf: &str) -> Result<usize> {
        let eng = self.eng.clone();
        let mut num = 0;
        for account in eng.account_names() {
            let mgr = OrderMgr::new(&eng, &account)?;
            match mgr.on_env_end(symbol, tf) {
                Ok(n) => num += n,
                Err(err) => warn!(account = %account, symbol, %err, "close orders on env end fail"),
            }
        }
        let key = env_key(symbol, tf);
        if let Some(env) = self.envs.get_mut(&key) {
            *env = BarEnv::new(symbol, tf, env.sid, DEFAULT_BAR_CACHE.max(env.len()));
        }
        self.dispatch_events();
        Ok(num)
    }

    /// Order changes caused outside bar dispatch (cleanup, relays).
    pub fn notify_order_change(&mut self, account: &str, od_ref: &OrderRef, kind: OdChange) {
        let od = lock_od(od_ref).clone();
        self.eng.fire(account, &od, kind);
        self.dispatch_events();
    }
}

fn apply_dirt(job: &mut StratJob, dirt: Dirt) {
    match dirt {
        Dirt::Long => job.max_open_short = -1,
        Dirt::Short => job.max_open_long = -1,
        Dirt::Both => {}
    }
}

/// Base stake of an account's jobs for the current bar.
fn job_stake(eng: &Engine, account: &str) -> f64 {
    let cfg = &eng.ctx.config;
    let mut amt = cfg.stake_amount;
    if let Ok(acc) = eng.account(account) {
        let pct_amt = acc.misc().stake_pct_amt;
        if cfg.stake_pct > 0.0 && pct_amt > 0.0 {
            amt = pct_amt;
        }
    }
    if cfg.max_stake_amt > 0.0 {
        amt = amt.min(cfg.max_stake_amt);
    }
    let rate = cfg.account(account).stake_rate;
    if rate > 0.0 {
        amt *= rate;
    }
    amt
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Config, RunPolicyConfig};
    use crate::exchange::SimExchange;
    use crate::runtime::Ctx;
    use crate::scheduler::job::StratJob;
    use crate::strategies::{register_strategy, PairSub};
    use crate::types::Kline;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const H: i64 = 3_600_000;

    /// Buys on the third bar, sells on the fifth.
    struct Stepper {
        info_hits: Arc<AtomicUsize>,
        changes: Arc<AtomicUsize>,
    }

    impl Strategy for Stepper {
        fn name(&self) -> &str {
            "stepper"
        }
        fn warmup_num(&self) -> usize {
            2
        }
        fn on_pair_infos(&self, _job: &StratJob) -> Vec<PairSub> {
            vec![PairSub {
                symbol: "ETH/USDT".into(),
                timeframe: "1h".into(),
                warmup: 0,
            }]
        }
        fn on_bar(&self, job: &mut StratJob, env: &BarEnv) {
            if env.bar_num == 3 {
                let _ = job.open_order(EnterReq::long("step").with_cost(100.0));
            } else if env.bar_num == 5 {
                let _ = job.close_orders(ExitReq::new("step_out"));
            }
        }
        fn on_info_bar(&self, _job: &mut StratJob, _env: &BarEnv, _pair: &str, _tf: &str) {
            self.info_hits.fetch_add(1, Ordering::SeqCst);
        }
        fn on_order_change(&self, _job: &mut StratJob, _od: &crate::orders::InOutOrder, _kind: OdChange) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl Strategy for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        fn on_bar(&self, _job: &mut StratJob, _env: &BarEnv) {
            panic!("boom");
        }
    }

    fn engine(pol: &str) -> Arc<Engine> {
        let mut cfg = Config::default();
        cfg.run_timeframes = vec!["1h".into()];
        cfg.wallet_amounts.insert("USDT".into(), 1000.0);
        cfg.run_policy = vec![RunPolicyConfig::new(pol)];
        let ctx = Ctx::backtest(Arc::new(cfg), Arc::new(SimExchange::default()), 0);
        Arc::new(Engine::new(Arc::new(ctx), ExecMode::Local))
    }

    fn feed(sch: &mut Scheduler, symbol: &str, i: i64, close: f64, warm: bool) {
        let bar = Kline::new(i * H, close, close + 1.0, close - 1.0, close, 10.0);
        sch.eng.ctx.clock.set(bar.time + H);
        sch.on_bar(&PairBar {
            symbol: symbol.into(),
            timeframe: "1h".into(),
            bar,
            is_warmup: warm,
        })
        .unwrap();
    }

    #[test]
    fn test_refresh_creates_jobs_and_warms() {
        let info_hits = Arc::new(AtomicUsize::new(0));
        let changes = Arc::new(AtomicUsize::new(0));
        let (ih, ch) = (info_hits.clone(), changes.clone());
        register_strategy("stepper", move |_, _| {
            Ok(Arc::new(Stepper {
                info_hits: ih.clone(),
                changes: ch.clone(),
            }) as Arc<dyn Strategy>)
        });
        let mut sch = Scheduler::new(engine("stepper"));
        let res = sch.refresh_jobs(&["BTC/USDT".into()], &HashMap::new()).unwrap();
        assert_eq!(res.warms["BTC/USDT"]["1h"], 2);
        assert_eq!(res.warms["ETH/USDT"]["1h"], 0);
        assert_eq!(sch.job_count(), 1);
        assert_eq!(sch.env_keys().len(), 2);

        // warmup bars never trade
        feed(&mut sch, "BTC/USDT", 0, 100.0, true);
        feed(&mut sch, "BTC/USDT", 1, 100.0, true);
        feed(&mut sch, "BTC/USDT", 2, 100.0, false);
        let acc = sch.eng.account("default").unwrap().clone();
        assert_eq!(acc.open_count(), 1);
        feed(&mut sch, "ETH/USDT", 2, 10.0, false);
        assert_eq!(info_hits.load(Ordering::SeqCst), 1);
        feed(&mut sch, "BTC/USDT", 3, 101.0, false);
        feed(&mut sch, "BTC/USDT", 4, 102.0, false);
        feed(&mut sch, "BTC/USDT", 5, 103.0, false);
        assert_eq!(acc.open_count(), 0);
        assert_eq!(sch.eng.hist_orders().len(), 1);
        assert!(changes.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_refresh_drops_unpicked_jobs() {
        register_strategy("stepper_b", |_, _| {
            Ok(Arc::new(Stepper {
                info_hits: Arc::new(AtomicUsize::new(0)),
                changes: Arc::new(AtomicUsize::new(0)),
            }) as Arc<dyn Strategy>)
        });
        let mut sch = Scheduler::new(engine("stepper_b"));
        sch.refresh_jobs(&["BTC/USDT".into(), "SOL/USDT".into()], &HashMap::new())
            .unwrap();
        assert_eq!(sch.job_count(), 2);
        let mut scores = HashMap::new();
        scores.insert(
            "SOL/USDT".to_string(),
            vec![TfScore {
                timeframe: "1h".into(),
                score: 0.1,
            }],
        );
        let res = sch
            .refresh_jobs(&["BTC/USDT".into(), "SOL/USDT".into()], &scores)
            .unwrap();
        assert_eq!(res.failed["stepper_b"], vec!["SOL/USDT".to_string()]);
        assert_eq!(sch.job_count(), 1);
        assert!(sch.env("SOL/USDT", "1h").is_none());
    }

    #[test]
    fn test_strategy_panic_skips_bar() {
        register_strategy("panicky", |_, _| Ok(Arc::new(Panicky) as Arc<dyn Strategy>));
        let mut sch = Scheduler::new(engine("panicky"));
        sch.refresh_jobs(&["BTC/USDT".into()], &HashMap::new()).unwrap();
        feed(&mut sch, "BTC/USDT", 0, 100.0, false);
        feed(&mut sch, "BTC/USDT", 1, 100.0, false);
        assert_eq!(sch.env("BTC/USDT", "1h").unwrap().len(), 2);
    }
}
