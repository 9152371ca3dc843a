//! Intra-bar price path used by the local fill simulator
//!
//! A bar is modelled as a three-segment poly-line. Bullish bars
//! (`open <= close`) travel `open -> low -> high -> close`, bearish bars
//! travel `open -> high -> low -> close`. Time inside the bar is mapped
//! linearly onto the travelled distance, so a "rate" in `[0, 1]` is both
//! the fraction of bar time elapsed and of path length covered.

use crate::types::Kline;

/// Minimum delay between trigger and limit, in seconds, for a triggered
/// order to be treated as a limit fill rather than a market fill.
pub const LIMIT_SOJOURN_SECS: f64 = 30.0;

/// Rates at or above this are treated as the bar close.
const CLOSE_RATE: f64 = 0.999;

/// The three segments of a bar's path as `(from, to)` price pairs.
fn segments(bar: &Kline) -> [(f64, f64); 3] {
    if bar.is_bullish() {
        [(bar.open, bar.low), (bar.low, bar.high), (bar.high, bar.close)]
    } else {
        [(bar.open, bar.high), (bar.high, bar.low), (bar.low, bar.close)]
    }
}

fn path_len(bar: &Kline) -> f64 {
    segments(bar).iter().map(|(a, b)| (b - a).abs()).sum()
}

/// Price reached after `rate` of the bar has elapsed.
pub fn sim_market_price(bar: &Kline, rate: f64) -> f64 {
    if rate <= 0.0 {
        return bar.open;
    }
    if rate >= CLOSE_RATE {
        return bar.close;
    }
    let total = path_len(bar);
    if total == 0.0 {
        return bar.close;
    }
    let mut left = rate * total;
    for (from, to) in segments(bar) {
        let len = (to - from).abs();
        if left <= len {
            return if to >= from { from + left } else { from - left };
        }
        left -= len;
    }
    bar.close
}

/// Rate at which the path first touches `price` at or after `min_rate`.
///
/// In order mode (`is_trigger == false`) a price already available at the
/// open (`is_buy && price >= open`, or a sell at or below the open) returns
/// `min_rate` at once. In trigger mode a price outside `[low, high]` also
/// returns `min_rate`; callers check the range before relying on it.
pub fn sim_market_rate(bar: &Kline, price: f64, is_buy: bool, is_trigger: bool, min_rate: f64) -> f64 {
    if is_trigger {
        if price < bar.low || price > bar.high {
            return min_rate;
        }
    } else if (is_buy && price >= bar.open) || (!is_buy && price <= bar.open) {
        return min_rate;
    }
    let total = path_len(bar);
    if total == 0.0 {
        return 0.5;
    }
    let mut passed = 0.0;
    let mut last = None;
    for (from, to) in segments(bar) {
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        if price >= lo && price <= hi {
            let rate = (passed + (price - from).abs()) / total;
            if rate >= min_rate {
                return rate;
            }
            last = Some(rate);
        }
        passed += (to - from).abs();
    }
    last.unwrap_or(min_rate)
}

/// Fill price for a triggered exit with an optional protective limit.
///
/// Returns `-1` when the limit cannot be reached within this bar, the limit
/// price when it is reached more than [`LIMIT_SOJOURN_SECS`] after the
/// trigger, and `0` when the order should fill as a market order at the
/// trigger price.
///
/// `short` is the direction of the position: a short exits with a buy.
pub fn get_exc_price(short: bool, bar: &Kline, trig_price: f64, limit: f64, after_rate: f64, tf_secs: i64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    if (short && limit < bar.low) || (!short && limit > bar.high) {
        return -1.0;
    }
    let is_buy = short;
    let trig_rate = sim_market_rate(bar, trig_price, is_buy, true, after_rate);
    let limit_rate = sim_market_rate(bar, limit, is_buy, true, trig_rate);
    if (limit_rate - trig_rate) * tf_secs as f64 > LIMIT_SOJOURN_SECS {
        limit
    } else {
        0.0
    }
}
