//! Trade core - main entry point
//!
//! Subcommands:
//! - backtest: replay one or more configs over historical bars
//! - strategies: list the registered strategies

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::backtest::BacktestArgs;

#[derive(Parser, Debug)]
#[command(name = "trade-core")]
#[command(about = "Bar-driven trading core with local backtesting", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run backtests; several configs run in parallel
    Backtest {
        /// Path to configuration file, repeatable
        #[arg(short, long, default_value = "configs/backtest.json")]
        config: Vec<String>,

        /// Start time (YYYY-MM-DD, "YYYY-MM-DD HH:MM:SS" or epoch ms)
        #[arg(long)]
        start: Option<String>,

        /// End time
        #[arg(long)]
        end: Option<String>,

        /// Initial amount of the first stake currency
        #[arg(long)]
        wallet: Option<f64>,

        /// Pairs to trade (comma-separated). E.g., "BTC/USDT,ETH/USDT"
        #[arg(short, long)]
        pairs: Option<String>,

        /// Output directory for orders.csv and result.json
        #[arg(short, long, default_value = "backtest_results")]
        output: String,

        /// SQLite database for orders (overrides db_path)
        #[arg(long)]
        db: Option<String>,

        /// Run configs one after another
        #[arg(long)]
        sequential: bool,
    },

    /// List registered strategies
    Strategies,
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{},rusqlite=warn,rayon=warn", level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    if file_only {
        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);
        // keep the console clean for progress bars
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { config, .. } => ("backtest", config.len() > 1),
        Commands::Strategies => ("strategies", true),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            start,
            end,
            wallet,
            pairs,
            output,
            db,
            sequential,
        } => commands::backtest::run(BacktestArgs {
            configs: config,
            start,
            end,
            wallet,
            pairs,
            output,
            db,
            sequential,
        }),

        Commands::Strategies => commands::strategies::run(),
    }
}
