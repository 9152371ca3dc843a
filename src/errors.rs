//! Error kinds raised by the trading core
//!
//! Library code returns [`Result<T>`] carrying a [`TradeError`]. Command-line
//! and file-loading code wraps these into `anyhow` with context.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error categories with stable short codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrKind {
    InvalidConfig,
    InvalidParam,
    InvalidCost,
    InvalidSymbol,
    LowFunds,
    LowSrcAmount,
    Liquidation,
    NetFail,
    NetTimeout,
    DbReadFail,
    DbExecFail,
    Timeout,
    BadConfig,
    Unsupported,
    /// A state the core believed impossible (formerly a panic)
    InternalInconsistency,
    RunTime,
}

impl ErrKind {
    pub fn code(&self) -> i32 {
        match self {
            ErrKind::InvalidConfig => -10,
            ErrKind::InvalidParam => -11,
            ErrKind::InvalidCost => -12,
            ErrKind::InvalidSymbol => -13,
            ErrKind::LowFunds => -20,
            ErrKind::LowSrcAmount => -21,
            ErrKind::Liquidation => -22,
            ErrKind::NetFail => -30,
            ErrKind::NetTimeout => -31,
            ErrKind::DbReadFail => -40,
            ErrKind::DbExecFail => -41,
            ErrKind::Timeout => -50,
            ErrKind::BadConfig => -51,
            ErrKind::Unsupported => -52,
            ErrKind::InternalInconsistency => -90,
            ErrKind::RunTime => -99,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrKind::InvalidConfig => "InvalidConfig",
            ErrKind::InvalidParam => "InvalidParam",
            ErrKind::InvalidCost => "InvalidCost",
            ErrKind::InvalidSymbol => "InvalidSymbol",
            ErrKind::LowFunds => "LowFunds",
            ErrKind::LowSrcAmount => "LowSrcAmount",
            ErrKind::Liquidation => "Liquidation",
            ErrKind::NetFail => "NetFail",
            ErrKind::NetTimeout => "NetTimeout",
            ErrKind::DbReadFail => "DbReadFail",
            ErrKind::DbExecFail => "DbExecFail",
            ErrKind::Timeout => "Timeout",
            ErrKind::BadConfig => "BadConfig",
            ErrKind::Unsupported => "Unsupported",
            ErrKind::InternalInconsistency => "InternalInconsistency",
            ErrKind::RunTime => "RunTime",
        }
    }

    /// Kinds after which wallets or persisted orders can no longer be
    /// trusted; a run stops instead of trading on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrKind::InternalInconsistency | ErrKind::RunTime | ErrKind::DbExecFail | ErrKind::DbReadFail
        )
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Error value carried through the core: a kind plus a human message.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{kind}] {msg}")]
pub struct TradeError {
    pub kind: ErrKind,
    pub msg: String,
}

impl TradeError {
    pub fn new(kind: ErrKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn is(&self, kind: ErrKind) -> bool {
        self.kind == kind
    }

    pub fn param(msg: impl Into<String>) -> Self {
        Self::new(ErrKind::InvalidParam, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrKind::InternalInconsistency, msg)
    }
}

impl From<rusqlite::Error> for TradeError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows | rusqlite::Error::InvalidColumnType(..) => {
                TradeError::new(ErrKind::DbReadFail, err.to_string())
            }
            _ => TradeError::new(ErrKind::DbExecFail, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TradeError {
    fn from(err: serde_json::Error) -> Self {
        TradeError::new(ErrKind::RunTime, format!("json: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TradeError>;

/// Reasons an entry request was refused before an order was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailOpen {
    NoEntry,
    BarTooLate,
    NumLimit,
    NumLimitPol,
    BadDirtOrLimit,
    NanNum,
    CostTooLess,
    BadStopLoss,
    BadTakeProfit,
    PairBanned,
}

impl FailOpen {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailOpen::NoEntry => "FailOpenNoEntry",
            FailOpen::BarTooLate => "FailOpenBarTooLate",
            FailOpen::NumLimit => "FailOpenNumLimit",
            FailOpen::NumLimitPol => "FailOpenNumLimitPol",
            FailOpen::BadDirtOrLimit => "FailOpenBadDirtOrLimit",
            FailOpen::NanNum => "FailOpenNanNum",
            FailOpen::CostTooLess => "FailOpenCostTooLess",
            FailOpen::BadStopLoss => "FailOpenBadStopLoss",
            FailOpen::BadTakeProfit => "FailOpenBadTakeProfit",
            FailOpen::PairBanned => "FailOpenPairBanned",
        }
    }
}

impl fmt::Display for FailOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected entry: the error surfaced to the strategy plus the tag it is counted under.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryReject {
    pub tag: FailOpen,
    pub err: TradeError,
}

impl EntryReject {
    pub fn new(tag: FailOpen, kind: ErrKind, msg: impl Into<String>) -> Self {
        Self {
            tag,
            err: TradeError::new(kind, msg),
        }
    }
}

impl fmt::Display for EntryReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag, self.err)
    }
}

impl std::error::Error for EntryReject {}
