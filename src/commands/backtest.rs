//! Backtest command implementation

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use trade_core::data::CsvSource;
use trade_core::state_manager::SqliteStateManager;
use trade_core::{Backtest, BtResult, Config, InOutOrder};

#[derive(Debug, Clone)]
pub struct BacktestArgs {
    pub configs: Vec<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Initial amount of the first stake currency
    pub wallet: Option<f64>,
    /// Comma-separated pairs replacing the config's
    pub pairs: Option<String>,
    pub output: String,
    pub db: Option<String>,
    pub sequential: bool,
}

/// Load a config and apply the command-line overrides.
fn load_config(path: &str, args: &BacktestArgs) -> Result<Config> {
    let mut config = Config::from_file(path)?;
    info!("Loaded configuration from: {}", path);

    if let Some(start) = args.start.as_ref() {
        info!("Overriding start to: {}", start);
        config.time_start = start.clone();
    }
    if let Some(end) = args.end.as_ref() {
        info!("Overriding end to: {}", end);
        config.time_end = end.clone();
    }
    if let Some(amount) = args.wallet {
        let coin = config.stake_currency.first().cloned().unwrap_or_else(|| "USDT".to_string());
        info!("Overriding wallet to: {:.2} {}", amount, coin);
        config.wallet_amounts.insert(coin, amount);
    }
    if let Some(pairs) = args.pairs.as_ref() {
        config.pairs = pairs
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        info!("Overriding pairs to: {:?}", config.pairs);
    }
    config.validate().context("Invalid configuration after overrides")?;
    Ok(config)
}

fn open_store(config: &Config, args: &BacktestArgs) -> Result<Option<Arc<SqliteStateManager>>> {
    let path = args.db.clone().unwrap_or_else(|| config.db_path.clone());
    if path.is_empty() {
        return Ok(None);
    }
    let store = SqliteStateManager::new(&path).with_context(|| format!("Failed to open database: {}", path))?;
    Ok(Some(Arc::new(store)))
}

fn run_single(
    config: Config,
    store: Option<Arc<SqliteStateManager>>,
    progress: bool,
) -> Result<(BtResult, Vec<InOutOrder>)> {
    let source = CsvSource::new(&config.data_dir);
    let mut bt = Backtest::new(Arc::new(config), Box::new(source), store)?.with_progress(progress);
    let result = bt.run()?;
    Ok((result, bt.hist_orders()))
}

fn out_dir(base: &str, config: &Config) -> PathBuf {
    Path::new(base).join(format!("{}_{}", config.name, config.config_hash()))
}

pub fn run(args: BacktestArgs) -> Result<()> {
    info!("Starting backtest");
    let configs: Vec<Config> = args
        .configs
        .iter()
        .map(|path| load_config(path, &args))
        .collect::<Result<_>>()?;

    if let [config] = configs.as_slice() {
        let store = open_store(config, &args)?;
        let dir = out_dir(&args.output, config);
        let (result, orders) = run_single(config.clone(), store, true)?;
        println!("\n{}", result);
        result.dump(&dir, &orders)?;
        println!("Results written to {}", dir.display());
        info!("Backtest completed successfully");
        return Ok(());
    }

    let pb = ProgressBar::new(configs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}] ✓ {msg}")
            .context("Invalid progress template")?
            .progress_chars("█░ "),
    );

    let run_one = |config: &Config| -> (String, PathBuf, Result<BtResult>) {
        let dir = out_dir(&args.output, config);
        let res = open_store(config, &args)
            .and_then(|store| run_single(config.clone(), store, false))
            .and_then(|(result, orders)| {
                result.dump(&dir, &orders)?;
                Ok(result)
            });
        pb.inc(1);
        (config.name.clone(), dir, res)
    };
    let results: Vec<(String, PathBuf, Result<BtResult>)> = if args.sequential {
        configs.iter().map(run_one).collect()
    } else {
        configs.par_iter().map(run_one).collect()
    };
    pb.finish_with_message("done");

    println!("\n{}", "=".repeat(100));
    println!("BACKTEST SUMMARY");
    println!("{}", "=".repeat(100));
    println!(
        "{:<24} {:>7} {:>12} {:>8} {:>8} {:>7} | Output",
        "Config", "Orders", "Profit", "WinR%", "MaxDD%", "Sharpe"
    );
    println!("{}", "-".repeat(100));
    for (name, dir, res) in results.iter() {
        match res {
            Ok(r) => println!(
                "{:<24} {:>7} {:>12.2} {:>8.2} {:>8.2} {:>7.2} | {}",
                name,
                r.order_num,
                r.total_profit,
                r.win_rate * 100.0,
                r.max_drawdown * 100.0,
                r.sharpe,
                dir.display()
            ),
            Err(err) => {
                error!("Backtest {} failed: {:#}", name, err);
                println!("{:<24} FAILED: {}", name, err);
            }
        }
    }
    println!("{}", "=".repeat(100));
    info!("Backtest completed successfully");
    Ok(())
}
