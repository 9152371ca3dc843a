//! Backtest driver
//!
//! Replays bars from a [`BarSource`] through the [`Scheduler`] with local
//! fills, samples the equity curve, applies the fatal-loss breaker and
//! produces a [`BtResult`] once every order has been closed.
//!
//! When `relay_sim_unfinish` is set, strategy jobs created at start or by a
//! pair refresh are first replayed in a nested run over the recent past;
//! positions still open there are taken over by the main run.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::data::{BarFeeder, BarSource};
use crate::engine::{lock_od, Engine, ExecMode, OrderRef};
use crate::errors::TradeError;
use crate::exchange::{Exchange, SimExchange};
use crate::metrics::{BtResult, PlotData, PlotPoint};
use crate::order_mgr::OrderMgr;
use crate::orders::InOutOrder;
use crate::risk::FatalStop;
use crate::runtime::Ctx;
use crate::scheduler::Scheduler;
use crate::state_manager::SqliteStateManager;
use crate::strategies::TfScore;
use crate::types::{exit_tag, fmt_ms, tf_to_ms, PairBar};

pub struct Backtest {
    pub eng: Arc<Engine>,
    pub sched: Scheduler,
    feeder: BarFeeder,
    fatal: FatalStop,
    plot: PlotData,
    start_ms: i64,
    end_ms: i64,
    bar_num: usize,
    tf_scores: HashMap<String, Vec<TfScore>>,
    /// Set when the clock moved; wallets are sampled on the next trading bar
    check_wallets: bool,
    refresh_ms: i64,
    next_refresh_ms: i64,
    progress: Option<ProgressBar>,
    /// Nested replay started by a pair refresh
    is_relay: bool,
}

impl Backtest {
    /// Backtest over the config's `time_start..time_end`.
    pub fn new(cfg: Arc<Config>, source: Box<dyn BarSource>, store: Option<Arc<SqliteStateManager>>) -> Result<Self> {
        let exchange: Arc<dyn Exchange> = if cfg.fee_rate > 0.0 {
            Arc::new(SimExchange::new(cfg.fee_rate, cfg.fee_rate))
        } else {
            Arc::new(SimExchange::default())
        };
        Self::with_exchange(cfg, source, store, exchange)
    }

    /// Backtest against a caller-built exchange, e.g. one loaded with real
    /// market precisions and fee tiers.
    pub fn with_exchange(
        cfg: Arc<Config>,
        source: Box<dyn BarSource>,
        store: Option<Arc<SqliteStateManager>>,
        exchange: Arc<dyn Exchange>,
    ) -> Result<Self> {
        let start_ms = cfg.start_ms()?;
        let end_ms = cfg.end_ms()?;
        Self::build(cfg, source, store, exchange, start_ms, end_ms)
    }

    fn build(
        cfg: Arc<Config>,
        source: Box<dyn BarSource>,
        store: Option<Arc<SqliteStateManager>>,
        exchange: Arc<dyn Exchange>,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Self> {
        if end_ms > 0 && end_ms <= start_ms {
            anyhow::bail!("time_end {} must be after time_start {}", fmt_ms(end_ms), fmt_ms(start_ms));
        }
        let mut ctx = Ctx::backtest(cfg.clone(), exchange, start_ms);
        if let Some(store) = store.as_ref() {
            let now = chrono::Utc::now().timestamp_millis();
            ctx.task_id = store
                .create_task("backtest", &cfg.name, now, start_ms)
                .context("Failed to create backtest task")?;
        }
        let mut eng = Engine::new(Arc::new(ctx), ExecMode::Local);
        if let Some(store) = store {
            eng = eng.with_store(store);
        }
        let eng = Arc::new(eng);

        let min_tf_ms = cfg
            .run_timeframes
            .iter()
            .map(|tf| tf_to_ms(tf))
            .filter(|ms| *ms > 0)
            .min()
            .unwrap_or(0);
        let refresh_ms = cfg.refresh_pairs.interval_bars.max(0) * min_tf_ms;

        Ok(Self {
            sched: Scheduler::new(eng.clone()),
            eng,
            feeder: BarFeeder::new(source, end_ms),
            fatal: FatalStop::from_config(&cfg),
            plot: PlotData::default(),
            start_ms,
            end_ms,
            bar_num: 0,
            tf_scores: HashMap::new(),
            check_wallets: false,
            refresh_ms,
            next_refresh_ms: if refresh_ms > 0 { start_ms + refresh_ms } else { 0 },
            progress: None,
            is_relay: false,
        })
    }

    /// Timeframe scores used when picking a timeframe per pair
    pub fn set_tf_scores(&mut self, scores: HashMap<String, Vec<TfScore>>) {
        self.tf_scores = scores;
    }

    /// Show a progress bar over the backtest window.
    pub fn with_progress(mut self, show: bool) -> Self {
        if !show || self.end_ms <= self.start_ms {
            return self;
        }
        let pb = ProgressBar::new(100);
        match ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] ✓ {msg}")
        {
            Ok(style) => pb.set_style(style.progress_chars("█░ ")),
            Err(err) => warn!(%err, "invalid progress template"),
        }
        self.progress = Some(pb);
        self
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    /// Trading bars replayed so far, warmup excluded
    pub fn bar_num(&self) -> usize {
        self.bar_num
    }

    pub fn plot(&self) -> &PlotData {
        &self.plot
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run to the end of the data and build the report.
    pub fn run(&mut self) -> Result<BtResult> {
        self.init()?;
        info!(
            start = %fmt_ms(self.start_ms),
            end = %fmt_ms(self.end_ms),
            jobs = self.sched.job_count(),
            streams = self.feeder.stream_count(),
            "backtest started"
        );
        self.run_loop()?;
        self.finish()
    }

    /// Record initial balances and create the first jobs.
    pub fn init(&mut self) -> Result<()> {
        let ctx = &self.eng.ctx;
        let cfg = &ctx.config;
        for acc in self.eng.accounts() {
            let leverage = cfg.account_leverage(&acc.name);
            let (invest, pct_amt) = {
                let wallets = acc.lock_wallets();
                let invest = wallets.total_legal(None, false, &ctx.prices);
                let pct_amt = if cfg.stake_pct > 0.0 {
                    wallets.stake_pct_amount(cfg.stake_pct, leverage, ctx.is_contract(), &ctx.prices)
                } else {
                    0.0
                };
                (invest, pct_amt)
            };
            let mut misc = acc.misc();
            misc.total_invest = invest;
            misc.stake_pct_amt = pct_amt;
        }
        let pairs = cfg.pairs_at(self.start_ms)?;
        self.refresh(&pairs, true)?;
        if self.sched.job_count() == 0 {
            warn!("no strategy job created, check pairs and run_policy");
        }
        Ok(())
    }

    /// Feed bars until the data ends or the bot is stopped.
    ///
    /// Errors of a fatal kind stop the bot and are returned; others
    /// are logged and the replay goes on.
    pub fn run_loop(&mut self) -> Result<()> {
        while let Some(pb) = self.feeder.next() {
            if !self.eng.bot_running() {
                info!(at = %fmt_ms(self.eng.now_ms()), "bot stopped, backtest ends early");
                break;
            }
            if let Err(err) = self.on_bar(&pb) {
                let fatal = err
                    .downcast_ref::<TradeError>()
                    .map(|e| e.kind.is_fatal())
                    .unwrap_or(false);
                if fatal {
                    error!(symbol = %pb.symbol, tf = %pb.timeframe, %err, "fatal error, backtest stopped");
                    self.eng.set_bot_running(false);
                    return Err(err.context(format!("bar {} {} at {}", pb.symbol, pb.timeframe, fmt_ms(pb.bar.time))));
                }
                error!(symbol = %pb.symbol, tf = %pb.timeframe, %err, "backtest bar fail");
            }
        }
        Ok(())
    }

    fn on_bar(&mut self, pb: &PairBar) -> Result<()> {
        let clock = &self.eng.ctx.clock;
        let bar_end = pb.bar.time + tf_to_ms(&pb.timeframe);
        if bar_end > clock.raw() {
            clock.set(bar_end);
            self.sched.try_fire_batches(bar_end, pb.is_warmup);
            self.check_wallets = true;
        }
        if !pb.is_warmup {
            self.bar_num += 1;
        }
        // failures are logged per account by the scheduler
        if let Err(err) = self.sched.on_bar(pb) {
            if err.kind.is_fatal() {
                return Err(err.into());
            }
        }
        for (symbol, tf) in self.feeder.take_ended() {
            let num = self.sched.on_env_end(&symbol, &tf)?;
            debug!(symbol = %symbol, tf = %tf, closed = num, "stream ended");
        }
        if self.check_wallets && !pb.is_warmup {
            self.check_wallets = false;
            self.sample();
            if !self.fatal.is_empty() {
                let hist = self.eng.hist_orders();
                for account in self.eng.account_names() {
                    self.fatal.check(&self.eng, &account, &hist);
                }
            }
        }
        if self.next_refresh_ms > 0 && bar_end >= self.next_refresh_ms {
            self.next_refresh_ms += self.refresh_ms;
            let pairs = self.eng.ctx.config.pairs_at(bar_end)?;
            self.refresh(&pairs, true)?;
        }
        if let Some(progress) = self.progress.as_ref() {
            let done = (bar_end - self.start_ms) as f64 / (self.end_ms - self.start_ms) as f64;
            progress.set_position((done.clamp(0.0, 1.0) * 100.0) as u64);
        }
        Ok(())
    }

    /// Close everything left and build the report.
    pub fn finish(&mut self) -> Result<BtResult> {
        for account in self.eng.account_names() {
            OrderMgr::new(&self.eng, &account)?.cleanup()?;
        }
        self.sched.dispatch_events();
        self.sched.exit_jobs();
        self.sample();
        if let Some(progress) = self.progress.take() {
            progress.finish_and_clear();
        }

        let now = self.eng.now_ms();
        let hist = self.eng.hist_orders();
        let mut res = BtResult {
            start_ms: self.start_ms,
            end_ms: now,
            bar_num: self.bar_num,
            plot: std::mem::take(&mut self.plot),
            ..Default::default()
        };
        for acc in self.eng.accounts() {
            {
                let misc = acc.misc();
                res.total_invest += misc.total_invest;
                res.max_open_orders = res.max_open_orders.max(misc.max_open_num);
            }
            for (tag, num) in acc.fail_opens() {
                *res.fail_opens.entry(tag.as_str().to_string()).or_default() += num;
            }
        }
        res.final_balance = res.plot.points.last().map(|p| p.real).unwrap_or(res.total_invest);
        res.calc(&hist);

        if let Some(store) = self.eng.store() {
            let info = serde_json::json!({
                "orders": res.order_num,
                "profit": res.total_profit,
                "bars": res.bar_num,
            });
            store.finish_task(self.eng.ctx.task_id, now, &info.to_string())?;
        }
        info!(
            orders = res.order_num,
            profit = format!("{:.2}", res.total_profit),
            bars = res.bar_num,
            "backtest finished"
        );
        Ok(res)
    }

    /// Finished orders of the run
    pub fn hist_orders(&self) -> Vec<InOutOrder> {
        self.eng.hist_orders()
    }

    /// Add an equity sample at the current clock.
    fn sample(&mut self) {
        let ctx = &self.eng.ctx;
        let mut pt = PlotPoint {
            time_ms: ctx.now_ms(),
            job_num: self.sched.job_count(),
            ..Default::default()
        };
        let mut invest = 0.0;
        for acc in self.eng.accounts() {
            pt.od_num += acc.open_count();
            invest += acc.misc().total_invest;
            let wallets = acc.lock_wallets();
            let withdraw = wallets.withdraw_legal_total(None, &ctx.prices);
            pt.real += wallets.total_legal(None, true, &ctx.prices) + withdraw;
            pt.available += wallets.ava_legal(None, &ctx.prices);
            pt.unrealized_pol += wallets.unrealized_pol_legal(None, &ctx.prices);
            pt.withdraw += withdraw;
        }
        pt.profit = pt.real - invest;
        self.plot.add(pt);
    }

    // ========================================================================
    // Pair refresh
    // ========================================================================

    /// Rebuild jobs for `pairs`, subscribe the streams they need and drop
    /// the rest. With `relay`, newly created jobs are replayed first.
    fn refresh(&mut self, pairs: &[String], relay: bool) -> Result<()> {
        let before = self.job_keys();
        let res = self.sched.refresh_jobs(pairs, &self.tf_scores)?;
        for (pol, failed) in res.failed.iter() {
            warn!(policy = %pol, pairs = %failed.join(","), "no timeframe fits");
        }
        self.close_unfilled(&res.unfilled)?;

        let now = self.eng.now_ms();
        for (pair, tfs) in res.warms.iter() {
            for (tf, warm) in tfs.iter() {
                self.feeder.subscribe(pair, tf, *warm, now)?;
            }
        }
        self.feeder.retain(&self.sched.streams());

        let cfg = &self.eng.ctx.config;
        if relay && cfg.relay_sim_unfinish && !self.is_relay {
            let added: BTreeSet<JobKey> = self.job_keys().difference(&before).cloned().collect();
            if !added.is_empty() {
                self.relay_unfinished(&added)?;
            }
        }
        Ok(())
    }

    fn job_keys(&self) -> BTreeSet<JobKey> {
        let mut res = BTreeSet::new();
        for account in self.eng.account_names() {
            for (symbol, tf, strat_id) in self.sched.job_keys(&account) {
                res.insert(JobKey {
                    account: account.clone(),
                    symbol,
                    timeframe: tf,
                    strat_id,
                });
            }
        }
        res
    }

    /// Pending entries of disabled jobs are dropped.
    fn close_unfilled(&mut self, unfilled: &[OrderRef]) -> Result<()> {
        if unfilled.is_empty() {
            return Ok(());
        }
        let now = self.eng.now_ms();
        for account in self.eng.account_names() {
            let acc = self.eng.account(&account)?;
            let ids: Vec<i64> = acc.lock_open().keys().copied().collect();
            let mgr = OrderMgr::new(&self.eng, &account)?;
            for od_ref in unfilled {
                let mut od = lock_od(od_ref);
                if !ids.contains(&od.id) {
                    continue;
                }
                mgr.close_local(&mut od, exit_tag::PAIR_DEL, 0.0, "", None, now)?;
            }
            self.eng.sweep_done(acc);
        }
        self.sched.dispatch_events();
        Ok(())
    }

    /// Replay the pairs of `jobs` over the last `order_bar_max` bars and
    /// hand the orders still open at the current time to those jobs.
    fn relay_unfinished(&mut self, jobs: &BTreeSet<JobKey>) -> Result<()> {
        let now = self.eng.now_ms();
        let cfg = self.eng.ctx.config.clone();
        let pairs: Vec<String> = jobs.iter().map(|k| k.symbol.clone()).unique().sorted().collect();
        let strat_ids: BTreeSet<&str> = jobs.iter().map(|k| k.strat_id.as_str()).collect();
        let max_tf_ms = jobs.iter().map(|k| tf_to_ms(&k.timeframe)).max().unwrap_or(0);
        if max_tf_ms <= 0 {
            return Ok(());
        }
        let bar_max = cfg
            .run_policy
            .iter()
            .filter(|p| strat_ids.contains(p.id().as_str()))
            .map(|p| if p.order_bar_max > 0 { p.order_bar_max } else { cfg.order_bar_max })
            .max()
            .unwrap_or(cfg.order_bar_max)
            .max(1);
        let start = now - bar_max * max_tf_ms;

        let mut sub_cfg = (*cfg).clone();
        sub_cfg.pairs = pairs.clone();
        sub_cfg.relay_sim_unfinish = false;
        sub_cfg.refresh_pairs = Default::default();
        sub_cfg.fatal_stop.clear();
        sub_cfg.run_policy.retain_mut(|pol| {
            if !strat_ids.contains(pol.id().as_str()) {
                return false;
            }
            if pol.pairs.is_empty() {
                return true;
            }
            pol.pairs.retain(|p| pairs.contains(p));
            !pol.pairs.is_empty()
        });
        info!(
            pairs = %pairs.join(","),
            policies = %strat_ids.iter().join(","),
            from = %fmt_ms(start),
            "relay new jobs"
        );

        let exchange = self.eng.ctx.exchange.clone();
        let mut sub = Backtest::build(
            Arc::new(sub_cfg),
            Box::new(self.feeder.shared_source()),
            None,
            exchange,
            start,
            now,
        )?;
        sub.is_relay = true;
        sub.tf_scores = self.tf_scores.clone();
        sub.init()?;
        sub.run_loop().context("relay replay")?;

        let closed: HashMap<String, InOutOrder> = sub
            .eng
            .hist_orders()
            .into_iter()
            .map(|od| (od.key_align(), od))
            .collect();
        for account in self.eng.account_names() {
            let Ok(sub_acc) = sub.eng.account(&account) else {
                continue;
            };
            let owned = |od: &InOutOrder| jobs.contains(&JobKey::of(&account, od));
            let mgr = OrderMgr::new(&self.eng, &account)?;
            // still open here but already closed by the replay
            for od_ref in mgr.acc.open_orders() {
                let mut od = lock_od(&od_ref);
                if od.status.is_done() || !owned(&*od) {
                    continue;
                }
                if let Some(done) = closed.get(&od.key_align()) {
                    let price = done.exit.as_ref().map(|e| e.average).unwrap_or(0.0);
                    let msg = format!("replay exit: {}", done.exit_tag);
                    mgr.close_local(&mut od, exit_tag::EXIT_DELAY, price, &msg, None, now)?;
                }
            }
            let open = sub_acc.open_snapshots(|o| !o.status.is_done() && owned(o));
            let skipped = sub_acc.open_count().saturating_sub(open.len());
            if skipped > 0 {
                debug!(account = %account, num = skipped, "replayed orders without job skipped");
            }
            let taken = mgr.relay_orders(open)?;
            if !taken.is_empty() {
                info!(account = %account, num = taken.len(), "relay orders taken over");
            }
            self.eng.sweep_done(mgr.acc);
            for key in jobs.iter().filter(|k| k.account == account) {
                let ods: Vec<OrderRef> = mgr
                    .acc
                    .open_orders()
                    .into_iter()
                    .filter(|r| JobKey::of(&account, &lock_od(r)) == *key)
                    .collect();
                if let Some(job) = self.sched.job_mut(&account, &key.symbol, &key.timeframe, &key.strat_id) {
                    job.reset_orders(ods);
                }
            }
        }
        self.sched.dispatch_events();
        Ok(())
    }
}

/// One strategy job of one account
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct JobKey {
    account: String,
    symbol: String,
    timeframe: String,
    strat_id: String,
}

impl JobKey {
    fn of(account: &str, od: &InOutOrder) -> Self {
        Self {
            account: account.to_string(),
            symbol: od.symbol.clone(),
            timeframe: od.timeframe.clone(),
            strat_id: od.strategy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunPolicyConfig;
    use crate::data::VecSource;
    use crate::errors::ErrKind;
    use crate::exchange::{Balances, BookTicker, CreateOrderReq, ExchangeOrder, Fee, Income, LastPrice, Market, Position};
    use crate::types::{Kline, OrderType, Side};

    const HOUR: i64 = 3_600_000;

    fn wave_bars(start: i64, num: usize) -> Vec<Kline> {
        (0..num)
            .map(|i| {
                let close = 100.0 + 10.0 * ((i as f64) / 6.0).sin();
                Kline::new(start + i as i64 * HOUR, close, close + 0.5, close - 0.5, close, 10.0)
            })
            .collect()
    }

    fn config(start: i64, end: i64) -> Config {
        let mut pol = RunPolicyConfig::new("sma_cross");
        pol.params.insert("fast".into(), 3.0);
        pol.params.insert("slow".into(), 8.0);
        let mut cfg = Config::default();
        cfg.time_start = start.to_string();
        cfg.time_end = end.to_string();
        cfg.pairs = vec!["BTC/USDT".into()];
        cfg.run_timeframes = vec!["1h".into()];
        cfg.run_policy = vec![pol];
        cfg.wallet_amounts.insert("USDT".into(), 10_000.0);
        cfg.stake_amount = 100.0;
        cfg
    }

    #[test]
    fn test_backtest_closes_everything() {
        let start = 1_700_000_000_000 / HOUR * HOUR;
        let bars = wave_bars(start - 20 * HOUR, 220);
        let end = start + 200 * HOUR;
        let src = VecSource::new().with("BTC/USDT", "1h", bars);
        let mut bt = Backtest::new(Arc::new(config(start, end)), Box::new(src), None).unwrap();
        let res = bt.run().unwrap();
        assert_eq!(res.bar_num, 200);
        assert!(res.order_num > 0);
        assert!(bt.hist_orders().iter().all(|od| od.status.is_done()));
        assert_eq!(bt.eng.account("default").unwrap().open_count(), 0);
        assert!(!res.plot.points.is_empty());
        assert!(res.total_invest > 9_999.0);
    }

    /// Sim exchange whose fee schedule is gone: every fill fails.
    struct FeeOutage(SimExchange);

    impl Exchange for FeeOutage {
        fn name(&self) -> &str {
            "fee_outage"
        }
        fn get_market(&self, symbol: &str) -> crate::errors::Result<Market> {
            self.0.get_market(symbol)
        }
        fn prec_price(&self, symbol: &str, price: f64) -> crate::errors::Result<f64> {
            self.0.prec_price(symbol, price)
        }
        fn prec_amount(&self, symbol: &str, amount: f64) -> crate::errors::Result<f64> {
            self.0.prec_amount(symbol, amount)
        }
        fn calc_maint_margin(&self, symbol: &str, notional: f64) -> crate::errors::Result<f64> {
            self.0.calc_maint_margin(symbol, notional)
        }
        fn calculate_fee(
            &self,
            _symbol: &str,
            _order_type: OrderType,
            _side: Side,
            _amount: f64,
            _price: f64,
            _is_maker: bool,
        ) -> crate::errors::Result<Fee> {
            Err(TradeError::new(ErrKind::RunTime, "fee schedule unavailable"))
        }
        fn fetch_last_prices(&self, symbols: &[String]) -> crate::errors::Result<Vec<LastPrice>> {
            self.0.fetch_last_prices(symbols)
        }
        fn fetch_balance(&self, account: &str) -> crate::errors::Result<Balances> {
            self.0.fetch_balance(account)
        }
        fn fetch_positions(&self, symbols: &[String], account: &str) -> crate::errors::Result<Vec<Position>> {
            self.0.fetch_positions(symbols, account)
        }
        fn fetch_orders(
            &self,
            symbol: &str,
            since: i64,
            limit: usize,
            account: &str,
        ) -> crate::errors::Result<Vec<ExchangeOrder>> {
            self.0.fetch_orders(symbol, since, limit, account)
        }
        fn fetch_book_tickers(&self) -> crate::errors::Result<HashMap<String, BookTicker>> {
            self.0.fetch_book_tickers()
        }
        fn create_order(&self, req: &CreateOrderReq) -> crate::errors::Result<ExchangeOrder> {
            self.0.create_order(req)
        }
        fn cancel_order(&self, order_id: &str, symbol: &str, account: &str) -> crate::errors::Result<ExchangeOrder> {
            self.0.cancel_order(order_id, symbol, account)
        }
        fn fetch_income_history(
            &self,
            kind: &str,
            symbol: &str,
            since: i64,
            limit: usize,
            account: &str,
        ) -> crate::errors::Result<Vec<Income>> {
            self.0.fetch_income_history(kind, symbol, since, limit, account)
        }
    }

    #[test]
    fn test_fatal_error_stops_run() {
        let start = 1_700_000_000_000 / HOUR * HOUR;
        let end = start + 200 * HOUR;
        let src = VecSource::new().with("BTC/USDT", "1h", wave_bars(start - 20 * HOUR, 220));
        let ex: Arc<dyn Exchange> = Arc::new(FeeOutage(SimExchange::default()));
        let mut bt = Backtest::with_exchange(Arc::new(config(start, end)), Box::new(src), None, ex).unwrap();
        let err = bt.run().unwrap_err();
        let cause = err.downcast_ref::<TradeError>().unwrap();
        assert_eq!(cause.kind, ErrKind::RunTime);
        assert!(!bt.eng.bot_running());
        assert!(bt.bar_num() < 200);
        assert!(bt.hist_orders().is_empty());
    }

    #[test]
    fn test_rejects_inverted_window() {
        let cfg = config(2 * HOUR * 1_000_000, HOUR * 1_000_000);
        assert!(Backtest::new(Arc::new(cfg), Box::new(VecSource::new()), None).is_err());
    }

    #[test]
    fn test_task_recorded_in_store() {
        let start = 1_700_000_000_000 / HOUR * HOUR;
        let end = start + 60 * HOUR;
        let store = Arc::new(SqliteStateManager::open_in_memory().unwrap());
        let src = VecSource::new().with("BTC/USDT", "1h", wave_bars(start - 20 * HOUR, 80));
        let mut bt = Backtest::new(Arc::new(config(start, end)), Box::new(src), Some(store.clone())).unwrap();
        bt.run().unwrap();
        let task_id = bt.eng.ctx.task_id;
        assert!(task_id > 0);
        let task = store.get_task(task_id).unwrap().unwrap();
        assert!(task.stop_at > 0);
    }
}
