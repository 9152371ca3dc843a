//! Bar sources
//!
//! A [`BarSource`] loads the bars of one (symbol, timeframe) stream for a
//! time window. [`BarFeeder`] merges any number of streams into one
//! chronological sequence of [`PairBar`]s, flagging the bars before the
//! trading window as warmup.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::types::{tf_to_ms, Kline, PairBar};

pub trait BarSource: Send {
    /// Bars opening in `[start_ms, end_ms)`, ascending. `end_ms <= 0` means no upper bound.
    fn load(&mut self, symbol: &str, timeframe: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Kline>>;
}

fn in_window(bar: &Kline, start_ms: i64, end_ms: i64) -> bool {
    bar.time >= start_ms && (end_ms <= 0 || bar.time < end_ms)
}

/// A source shared between a run and the nested runs it starts.
#[derive(Clone)]
pub struct SharedSource(Arc<Mutex<Box<dyn BarSource>>>);

impl SharedSource {
    pub fn new(source: Box<dyn BarSource>) -> Self {
        Self(Arc::new(Mutex::new(source)))
    }
}

impl BarSource for SharedSource {
    fn load(&mut self, symbol: &str, timeframe: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Kline>> {
        let mut source = self.0.lock().unwrap_or_else(|e| e.into_inner());
        source.load(symbol, timeframe, start_ms, end_ms)
    }
}

// =============================================================================
// In-memory source
// =============================================================================

/// Bars held in memory, mostly for tests and generated data.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    bars: HashMap<(String, String), Vec<Kline>>,
}

impl VecSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, timeframe: &str, mut bars: Vec<Kline>) {
        bars.sort_by_key(|b| b.time);
        self.bars.insert((symbol.to_string(), timeframe.to_string()), bars);
    }

    pub fn with(mut self, symbol: &str, timeframe: &str, bars: Vec<Kline>) -> Self {
        self.insert(symbol, timeframe, bars);
        self
    }
}

impl BarSource for VecSource {
    fn load(&mut self, symbol: &str, timeframe: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Kline>> {
        let key = (symbol.to_string(), timeframe.to_string());
        Ok(self
            .bars
            .get(&key)
            .map(|bars| bars.iter().filter(|b| in_window(b, start_ms, end_ms)).copied().collect())
            .unwrap_or_default())
    }
}

// =============================================================================
// CSV source
// =============================================================================

/// Reads `{data_dir}/{symbol}_{timeframe}.csv`, where `/` and `:` in the
/// symbol become `_`. Columns: time, open, high, low, close, volume.
/// Time is either epoch milliseconds or a UTC datetime.
#[derive(Debug, Clone)]
pub struct CsvSource {
    data_dir: PathBuf,
    cache: HashMap<(String, String), Vec<Kline>>,
}

impl CsvSource {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            cache: HashMap::new(),
        }
    }

    pub fn file_path(&self, symbol: &str, timeframe: &str) -> PathBuf {
        let name = symbol.replace(['/', ':'], "_");
        self.data_dir.join(format!("{}_{}.csv", name, timeframe))
    }
}

impl BarSource for CsvSource {
    fn load(&mut self, symbol: &str, timeframe: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Kline>> {
        let key = (symbol.to_string(), timeframe.to_string());
        if !self.cache.contains_key(&key) {
            let path = self.file_path(symbol, timeframe);
            let bars = if path.exists() {
                let bars = load_csv(&path).with_context(|| format!("Failed to load data for {} {}", symbol, timeframe))?;
                info!(symbol, tf = timeframe, num = bars.len(), "bars loaded");
                bars
            } else {
                warn!("Data file not found: {}", path.display());
                Vec::new()
            };
            self.cache.insert(key.clone(), bars);
        }
        Ok(self
            .cache
            .get(&key)
            .map(|bars| bars.iter().filter(|b| in_window(b, start_ms, end_ms)).copied().collect())
            .unwrap_or_default())
    }
}

fn parse_time(text: &str) -> Result<i64> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = text.parse::<DateTime<Utc>>() {
        return Ok(dt.timestamp_millis());
    }
    let ndt = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Failed to parse datetime: {}", text))?;
    Ok(ndt.and_utc().timestamp_millis())
}

/// Load OHLCV bars from a CSV file with a header row, sorted by time.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Kline>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;
    let mut bars = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .with_context(|| format!("Missing {} column", name))?
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Failed to parse {} at row {}", name, row_idx + 1))
        };
        let time = parse_time(record.get(0).context("Missing time column")?)?;
        let bar = Kline::new(
            time,
            field(1, "open")?,
            field(2, "high")?,
            field(3, "low")?,
            field(4, "close")?,
            field(5, "volume")?,
        );
        if let Err(err) = bar.validate() {
            warn!(row = row_idx + 1, %err, "bad bar skipped");
            continue;
        }
        bars.push(bar);
    }
    bars.sort_by_key(|b| b.time);
    bars.dedup_by_key(|b| b.time);
    Ok(bars)
}

// =============================================================================
// Feeder
// =============================================================================

struct Stream {
    symbol: String,
    timeframe: String,
    tf_ms: i64,
    bars: Vec<Kline>,
    pos: usize,
    /// Bars opening before this are warmup
    trade_start: i64,
}

impl Stream {
    fn peek_end(&self) -> Option<i64> {
        self.bars.get(self.pos).map(|b| b.time + self.tf_ms)
    }
}

/// Merges the subscribed streams by bar close time. Ties go to the larger
/// timeframe first, then by symbol.
pub struct BarFeeder {
    source: SharedSource,
    streams: BTreeMap<(String, String), Stream>,
    end_ms: i64,
    /// Streams that ran dry before the window end
    ended: Vec<(String, String)>,
}

impl BarFeeder {
    pub fn new(source: Box<dyn BarSource>, end_ms: i64) -> Self {
        Self {
            source: SharedSource::new(source),
            streams: BTreeMap::new(),
            end_ms,
            ended: Vec::new(),
        }
    }

    pub fn shared_source(&self) -> SharedSource {
        self.source.clone()
    }

    pub fn is_subscribed(&self, symbol: &str, timeframe: &str) -> bool {
        self.streams.contains_key(&(symbol.to_string(), timeframe.to_string()))
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Subscribe a stream trading from `start_ms`, with `warmup` bars before it.
    /// An existing subscription is kept as is. Returns the number of bars loaded.
    pub fn subscribe(&mut self, symbol: &str, timeframe: &str, warmup: usize, start_ms: i64) -> Result<usize> {
        let key = (symbol.to_string(), timeframe.to_string());
        if self.streams.contains_key(&key) {
            return Ok(0);
        }
        let tf_ms = tf_to_ms(timeframe);
        if tf_ms <= 0 {
            anyhow::bail!("invalid timeframe: {}", timeframe);
        }
        let from = start_ms - warmup as i64 * tf_ms;
        let bars = self.source.load(symbol, timeframe, from, self.end_ms)?;
        let num = bars.len();
        debug!(symbol, tf = timeframe, warmup, num, "stream subscribed");
        self.streams.insert(
            key,
            Stream {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
                tf_ms,
                bars,
                pos: 0,
                trade_start: start_ms,
            },
        );
        Ok(num)
    }

    /// Drop streams not in `keep`.
    pub fn retain(&mut self, keep: &[(String, String)]) {
        self.streams.retain(|k, _| keep.contains(k));
    }

    /// Streams exhausted before the window end since the last call
    pub fn take_ended(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.ended)
    }

    /// Close time of the next bar, if any.
    pub fn peek_time(&self) -> Option<i64> {
        self.streams.values().filter_map(|s| s.peek_end()).min()
    }
}

impl Iterator for BarFeeder {
    type Item = PairBar;

    fn next(&mut self) -> Option<PairBar> {
        let key = self
            .streams
            .iter()
            .filter_map(|(k, s)| s.peek_end().map(|end| (end, -s.tf_ms, k)))
            .min()
            .map(|(_, _, k)| k.clone())?;
        let end_ms = self.end_ms;
        let stream = self.streams.get_mut(&key)?;
        let bar = *stream.bars.get(stream.pos)?;
        stream.pos += 1;
        if stream.pos >= stream.bars.len() {
            let last_end = bar.time + stream.tf_ms;
            if end_ms > 0 && last_end + stream.tf_ms <= end_ms {
                self.ended.push(key.clone());
            }
        }
        Some(PairBar {
            symbol: stream.symbol.clone(),
            timeframe: stream.timeframe.clone(),
            is_warmup: bar.time < stream.trade_start,
            bar,
        })
    }
}
