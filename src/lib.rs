//! Trade Core
//!
//! Bar-driven trading core: strategy scheduling, order management, a
//! wallet/margin engine and a local fill simulator, with a backtest driver
//! and SQLite order persistence on top.

pub mod backtest;
pub mod config;
pub mod data;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod metrics;
pub mod net_lock;
pub mod order_mgr;
pub mod orders;
pub mod rate_limiter;
pub mod risk;
pub mod runtime;
pub mod scheduler;
pub mod simulator;
pub mod state_manager;
pub mod strategies;
pub mod types;
pub mod wallet;

pub use backtest::Backtest;
pub use config::Config;
pub use engine::{Engine, ExecMode};
pub use errors::{ErrKind, Result, TradeError};
pub use metrics::BtResult;
pub use orders::InOutOrder;
pub use types::*;
