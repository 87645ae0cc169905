//! Candle type and bar geometry helpers

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// One OHLCV bar. `time` is the bar open in epoch milliseconds (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body_high(&self) -> f64 {
        self.open.max(self.close)
    }

    pub fn body_low(&self) -> f64 {
        self.open.min(self.close)
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.body_high()
    }

    pub fn lower_wick(&self) -> f64 {
        self.body_low() - self.low
    }

    /// Where the close sits inside the range: 0 = at the low, 1 = at the high.
    pub fn close_location(&self) -> f64 {
        let range = self.range();
        if range > 0.0 {
            (self.close - self.low) / range
        } else {
            0.5
        }
    }

    /// Body as a fraction of the full range (0 for a zero-range bar)
    pub fn body_ratio(&self) -> f64 {
        let range = self.range();
        if range > 0.0 {
            self.body() / range
        } else {
            0.0
        }
    }

    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

pub fn highest_high(candles: &[Candle]) -> f64 {
    candles.iter().map(|c| c.high).fold(f64::MIN, f64::max)
}

pub fn lowest_low(candles: &[Candle]) -> f64 {
    candles.iter().map(|c| c.low).fold(f64::MAX, f64::min)
}

/// The last `n` candles (or all of them when fewer exist)
pub fn tail(candles: &[Candle], n: usize) -> &[Candle] {
    &candles[candles.len().saturating_sub(n)..]
}

/// Reject a series the detectors cannot reason about: non-finite prices,
/// inverted bars, or timestamps that do not strictly increase.
pub fn validate_series(timeframe: &str, candles: &[Candle]) -> EngineResult<()> {
    let mut prev_time: Option<i64> = None;

    for (index, c) in candles.iter().enumerate() {
        let prices = [c.open, c.high, c.low, c.close, c.volume];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(EngineError::InvalidCandle {
                timeframe: timeframe.to_string(),
                index,
                reason: "non-finite value".to_string(),
            });
        }
        if c.high < c.body_high() || c.low > c.body_low() {
            return Err(EngineError::InvalidCandle {
                timeframe: timeframe.to_string(),
                index,
                reason: format!(
                    "high/low do not contain the body (o={} h={} l={} c={})",
                    c.open, c.high, c.low, c.close
                ),
            });
        }
        if c.volume < 0.0 {
            return Err(EngineError::InvalidCandle {
                timeframe: timeframe.to_string(),
                index,
                reason: "negative volume".to_string(),
            });
        }
        if let Some(previous) = prev_time {
            if c.time <= previous {
                return Err(EngineError::NonMonotonicTime {
                    timeframe: timeframe.to_string(),
                    index,
                    previous,
                    current: c.time,
                });
            }
        }
        prev_time = Some(c.time);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let c = Candle::new(0, 10.0, 14.0, 8.0, 13.0, 100.0);
        assert!(c.is_bullish());
        assert_eq!(c.body(), 3.0);
        assert_eq!(c.range(), 6.0);
        assert_eq!(c.upper_wick(), 1.0);
        assert_eq!(c.lower_wick(), 2.0);
        assert!((c.close_location() - 5.0 / 6.0).abs() < 1e-12);
        assert_eq!(c.true_range(16.0), 8.0);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let good = vec![
            Candle::new(1, 10.0, 11.0, 9.0, 10.5, 1.0),
            Candle::new(2, 10.5, 11.5, 10.0, 11.0, 1.0),
        ];
        assert!(validate_series("15m", &good).is_ok());

        let nan = vec![Candle::new(1, 10.0, f64::NAN, 9.0, 10.5, 1.0)];
        assert!(matches!(
            validate_series("15m", &nan),
            Err(EngineError::InvalidCandle { index: 0, .. })
        ));

        let inverted = vec![Candle::new(1, 10.0, 10.2, 9.0, 10.5, 1.0)];
        assert!(validate_series("15m", &inverted).is_err());

        let backwards = vec![
            Candle::new(5, 10.0, 11.0, 9.0, 10.5, 1.0),
            Candle::new(5, 10.5, 11.5, 10.0, 11.0, 1.0),
        ];
        assert!(matches!(
            validate_series("1m", &backwards),
            Err(EngineError::NonMonotonicTime { index: 1, .. })
        ));
    }
}
