//! Synthetic candle builders shared by the unit tests

use super::bars::Candle;

/// 2024-03-04 00:00:00 UTC
pub const BASE_TIME_MS: i64 = 1_709_510_400_000;
pub const MINUTE_MS: i64 = 60_000;
pub const FIFTEEN_MIN_MS: i64 = 15 * MINUTE_MS;

pub fn bar_time(index: usize) -> i64 {
    BASE_TIME_MS + index as i64 * FIFTEEN_MIN_MS
}

pub fn candle(index: usize, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle::new(bar_time(index), open, high, low, close, 100.0)
}

/// Doji bars of the given range centered on `price`
pub fn flat_bars(start: usize, count: usize, price: f64, range: f64) -> Vec<Candle> {
    (start..start + count)
        .map(|i| candle(i, price, price + range / 2.0, price - range / 2.0, price))
        .collect()
}

/// Steadily trending bars: each opens `step` beyond the previous open and
/// closes 80% of a step further.
pub fn trending_bars(start: usize, count: usize, start_price: f64, step: f64) -> Vec<Candle> {
    let wick = 0.2 * step.abs();
    (0..count)
        .map(|i| {
            let open = start_price + step * i as f64;
            let close = open + 0.8 * step;
            candle(
                start + i,
                open,
                open.max(close) + wick,
                open.min(close) - wick,
                close,
            )
        })
        .collect()
}

/// Linear interpolation between waypoints, `bars_per_leg` closes per leg
pub fn zigzag_closes(waypoints: &[f64], bars_per_leg: usize) -> Vec<f64> {
    let mut closes = Vec::new();
    if let Some(&first) = waypoints.first() {
        closes.push(first);
    }
    for pair in waypoints.windows(2) {
        let step = (pair[1] - pair[0]) / bars_per_leg as f64;
        for k in 1..=bars_per_leg {
            closes.push(pair[0] + step * k as f64);
        }
    }
    closes
}

/// Bars that walk a close path. Each bar opens halfway between the previous
/// close and its own close, so turning points are strict extremes.
pub fn path_bars(start: usize, closes: &[f64], wick: f64) -> Vec<Candle> {
    let mut prev = closes.first().copied().unwrap_or(0.0);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = (prev + close) / 2.0;
            prev = close;
            candle(
                start + i,
                open,
                open.max(close) + wick,
                open.min(close) - wick,
                close,
            )
        })
        .collect()
}

/// Uptrend with swing highs near 106/109/112 and swing lows near 103/106/109,
/// ending on a push to 115 (43 bars)
pub fn uptrend_bars() -> Vec<Candle> {
    let closes = zigzag_closes(&[100.0, 106.0, 103.0, 109.0, 106.0, 112.0, 109.0, 115.0], 6);
    path_bars(0, &closes, 0.1)
}

/// Mirror image of [`uptrend_bars`], ending on a drop to 100 (43 bars)
pub fn downtrend_bars() -> Vec<Candle> {
    let closes = zigzag_closes(&[115.0, 109.0, 112.0, 106.0, 109.0, 103.0, 106.0, 100.0], 6);
    path_bars(0, &closes, 0.1)
}

/// Re-time a series so its first bar opens at `first_time` with `spacing` between bars
pub fn retime(candles: &mut [Candle], first_time: i64, spacing: i64) {
    for (i, c) in candles.iter_mut().enumerate() {
        c.time = first_time + i as i64 * spacing;
    }
}
