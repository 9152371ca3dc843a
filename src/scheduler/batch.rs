//! Batched entry/exit handling
//!
//! Jobs whose strategy sets `batch_in_out` leave their requests on the job
//! and register here. A pool per (timeframe, account, strategy) waits until
//! [`DELAY_BATCH_MS`] after its last registration, then the strategy sees
//! all its jobs at once through `on_batch_jobs` and the requests are
//! processed per job.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error};

use super::job::StratJob;
use super::Scheduler;
use crate::engine::lock_od;
use crate::order_mgr::OrderMgr;
use crate::orders::InOutStatus;
use crate::types::{tf_to_ms, DELAY_BATCH_MS};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchKey {
    pub timeframe: String,
    pub account: String,
    pub strat_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchPool {
    /// Fire once the clock reaches this
    pub exec_ms: i64,
    pub tf_ms: i64,
    /// Env keys of jobs waiting with their own bar
    pub main: BTreeSet<String>,
    /// `(job env key, info pair)` for info-bar batches
    pub info: BTreeSet<(String, String)>,
}

#[derive(Debug, Default)]
pub struct BatchPools {
    pools: BTreeMap<BatchKey, BatchPool>,
}

impl BatchPools {
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Register a job; every registration pushes the pool's deadline back.
    pub fn add_job(&mut self, tf: &str, account: &str, strat_id: &str, env_key: &str, info_pair: Option<&str>, now_ms: i64) {
        let key = BatchKey {
            timeframe: tf.to_string(),
            account: account.to_string(),
            strat_id: strat_id.to_string(),
        };
        let pool = self.pools.entry(key).or_insert_with(|| BatchPool {
            tf_ms: tf_to_ms(tf),
            ..Default::default()
        });
        pool.exec_ms = now_ms + DELAY_BATCH_MS;
        match info_pair {
            Some(pair) => {
                pool.info.insert((env_key.to_string(), pair.to_string()));
            }
            None => {
                pool.main.insert(env_key.to_string());
            }
        }
    }

    /// Remove and return due pools, plus how many pools are about to be due
    /// (within half a timeframe).
    pub fn take_due(&mut self, now_ms: i64) -> (Vec<(BatchKey, BatchPool)>, usize) {
        let mut waiting = 0;
        let due: Vec<BatchKey> = self
            .pools
            .iter()
            .filter(|(_, pool)| {
                if now_ms >= pool.exec_ms {
                    return true;
                }
                if pool.exec_ms - now_ms < pool.tf_ms / 2 {
                    waiting += 1;
                }
                false
            })
            .map(|(k, _)| k.clone())
            .collect();
        let res = due
            .into_iter()
            .filter_map(|k| self.pools.remove(&k).map(|p| (k, p)))
            .collect();
        (res, waiting)
    }
}

impl Scheduler {
    /// Fire every due batch pool. Returns the number of pools still waiting.
    ///
    /// During warmup the strategy still sees its jobs but no order is sent.
    pub fn try_fire_batches(&mut self, now_ms: i64, is_warmup: bool) -> usize {
        let (due, waiting) = self.batches.take_due(now_ms);
        if due.is_empty() {
            return waiting;
        }
        let eng = self.eng.clone();
        for (key, pool) in due {
            let Ok(mgr) = OrderMgr::new(&eng, &key.account) else {
                continue;
            };
            let all_orders = mgr.acc.open_orders();
            let Some(acc_jobs) = self.jobs.get_mut(&key.account) else {
                continue;
            };
            let info_keys: BTreeSet<&String> = pool.info.iter().map(|(k, _)| k).collect();
            let mut main_jobs: Vec<&mut StratJob> = Vec::new();
            let mut info_jobs: Vec<&mut StratJob> = Vec::new();
            for (env_key, env_jobs) in acc_jobs.iter_mut() {
                let Some(job) = env_jobs.get_mut(&key.strat_id) else {
                    continue;
                };
                if pool.main.contains(env_key) {
                    main_jobs.push(job);
                } else if info_keys.contains(env_key) {
                    info_jobs.push(job);
                }
            }
            let Some(strat) = main_jobs.first().or(info_jobs.first()).map(|j| j.strat.clone()) else {
                continue;
            };
            for job in main_jobs.iter_mut() {
                let ods = all_orders
                    .iter()
                    .filter(|r| {
                        let od = lock_od(r);
                        od.symbol == job.pair()
                            && od.timeframe == job.timeframe
                            && od.strategy == job.strat_id
                            && od.status < InOutStatus::FullExit
                    })
                    .cloned()
                    .collect();
                job.reset_orders(ods);
            }
            if !info_jobs.is_empty() {
                let label = format!("{}/{}", key.strat_id, key.timeframe);
                super::guard("on_batch_infos", &label, || strat.on_batch_infos(&key.timeframe, &mut info_jobs));
            }
            if main_jobs.is_empty() {
                continue;
            }
            let label = format!("{}/{}", key.strat_id, key.timeframe);
            if !super::guard("on_batch_jobs", &label, || strat.on_batch_jobs(&mut main_jobs)) {
                continue;
            }
            debug!(account = %key.account, strategy = %key.strat_id, tf = %key.timeframe, jobs = main_jobs.len(), "batch fired");
            if is_warmup {
                continue;
            }
            for job in main_jobs.iter_mut() {
                let Some(env) = self.envs.get(&super::env::env_key(job.pair(), &job.timeframe)) else {
                    continue;
                };
                let enters = std::mem::take(&mut job.entrys);
                let exits = std::mem::take(&mut job.exits);
                if enters.is_empty() && exits.is_empty() {
                    continue;
                }
                if let Err(err) = mgr.process_orders(env, enters, exits, Vec::new()) {
                    error!(account = %key.account, pair = %job.pair(), %err, "process batch orders fail");
                }
            }
        }
        self.dispatch_events();
        waiting
    }
}
