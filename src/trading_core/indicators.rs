//! Rolling indicators shared by the analyzers

use serde::{Deserialize, Serialize};

use super::bars::{tail, Candle};

/// Average True Range: simple mean of the last `period` true ranges.
/// Returns 0 when fewer than `period + 1` candles are available.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return 0.0;
    }

    let start = candles.len() - period;
    let sum_tr: f64 = (start..candles.len())
        .map(|i| candles[i].true_range(candles[i - 1].close))
        .sum();

    sum_tr / period as f64
}

/// Mean high-low range over the last `period` candles
pub fn avg_range(candles: &[Candle], period: usize) -> f64 {
    let window = tail(candles, period);
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|c| c.range()).sum::<f64>() / window.len() as f64
}

/// Mean absolute body over the last `period` candles
pub fn avg_body(candles: &[Candle], period: usize) -> f64 {
    let window = tail(candles, period);
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|c| c.body()).sum::<f64>() / window.len() as f64
}

/// EMA series seeded with the first value
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let Some(&first) = values.first() else {
        return out;
    };

    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = first;
    out.push(prev);
    for &v in &values[1..] {
        prev = (v - prev) * k + prev;
        out.push(prev);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdPoint {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
}

impl MacdPoint {
    const FLAT: MacdPoint = MacdPoint {
        macd_line: 0.0,
        signal_line: 0.0,
        histogram: 0.0,
    };
}

/// MACD value at the last close. Flat (all zero) until `slow + signal`
/// closes exist.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdPoint {
    if closes.len() < slow + signal {
        return MacdPoint::FLAT;
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let macd_values: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_ema = ema_series(&macd_values, signal);

    match (macd_values.last(), signal_ema.last()) {
        (Some(&macd_line), Some(&signal_line)) => MacdPoint {
            macd_line,
            signal_line,
            histogram: macd_line - signal_line,
        },
        _ => MacdPoint::FLAT,
    }
}

/// Least-squares slope of `values` against their index
pub fn regression_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let n = n as f64;
    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bar(time: i64, price: f64, half_range: f64) -> Candle {
        Candle::new(time, price, price + half_range, price - half_range, price, 1.0)
    }

    #[test]
    fn test_atr_needs_period_plus_one() {
        let bars: Vec<Candle> = (0..14).map(|i| flat_bar(i, 100.0, 1.0)).collect();
        assert_eq!(atr(&bars, 14), 0.0);

        let bars: Vec<Candle> = (0..15).map(|i| flat_bar(i, 100.0, 1.0)).collect();
        assert!((atr(&bars, 14) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_averages_use_tail() {
        let mut bars: Vec<Candle> = (0..10).map(|i| flat_bar(i, 100.0, 1.0)).collect();
        bars.push(Candle::new(10, 100.0, 106.0, 100.0, 105.0, 1.0));
        assert!((avg_range(&bars, 2) - 4.0).abs() < 1e-12);
        assert!((avg_body(&bars, 2) - 2.5).abs() < 1e-12);
        assert_eq!(avg_range(&[], 20), 0.0);
    }

    #[test]
    fn test_slope() {
        let values: Vec<f64> = (0..10).map(|i| 3.0 + 0.5 * i as f64).collect();
        assert!((regression_slope(&values) - 0.5).abs() < 1e-12);
        assert_eq!(regression_slope(&[1.0]), 0.0);
    }

    #[test]
    fn test_macd_sign_follows_trend() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let point = macd(&rising, 12, 26, 9);
        assert!(point.macd_line > 0.0);

        let short: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(macd(&short, 12, 26, 9), MacdPoint::FLAT);
    }
}
