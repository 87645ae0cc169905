//! Liquidity levels and sweep detection
//!
//! Levels are where resting stops cluster: the previous day's extremes, the
//! current session's extremes, equal highs/lows and recent swing points.
//! A sweep is a wick through a level followed by a reclaim.
//!
//! Detection never mutates its inputs. Swept levels come back as new records
//! so a level set can be reused across calls without aliasing.

use super::bars::{highest_high, lowest_low, tail, Candle};
use super::session::{utc_datetime, utc_day_start_ms, utc_time_on_day_ms};
use super::structure::SwingPoint;
use crate::types::TrendDirection;
use chrono::Timelike;
use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const EQUAL_LEVEL_TOLERANCE: f64 = 0.002;
const PRIOR_DAY_FALLBACK_BARS: usize = 100;
const RECENT_SWINGS: usize = 3;
pub const SWEEP_LOOKBACK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelKind {
    Pdh,
    Pdl,
    SessionHigh,
    SessionLow,
    EqualHighs,
    EqualLows,
    SwingHigh,
    SwingLow,
}

impl LevelKind {
    /// Buy-side liquidity sits above price, sell-side below
    pub fn is_high(self) -> bool {
        matches!(
            self,
            LevelKind::Pdh | LevelKind::SessionHigh | LevelKind::EqualHighs | LevelKind::SwingHigh
        )
    }

    /// Previous-day and session extremes
    pub fn is_major(self) -> bool {
        matches!(
            self,
            LevelKind::Pdh | LevelKind::Pdl | LevelKind::SessionHigh | LevelKind::SessionLow
        )
    }

    fn touch_tolerance(self) -> f64 {
        match self {
            LevelKind::Pdh | LevelKind::Pdl => 0.002,
            _ => 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidityLevel {
    pub kind: LevelKind,
    pub price: f64,
    pub strength: f64,
    pub touched: bool,
    pub swept: bool,
    pub reclaimed: bool,
    pub sweep_time: Option<i64>,
}

impl LiquidityLevel {
    fn new(kind: LevelKind, price: f64, strength: f64, current_price: f64) -> Self {
        let tolerance = kind.touch_tolerance();
        let touched = if kind.is_high() {
            current_price >= price * (1.0 - tolerance)
        } else {
            current_price <= price * (1.0 + tolerance)
        };

        Self {
            kind,
            price,
            strength,
            touched,
            swept: false,
            reclaimed: false,
            sweep_time: None,
        }
    }

    /// Copy of this level recording a sweep at `time`
    pub fn with_sweep(&self, time: i64) -> Self {
        Self {
            swept: true,
            reclaimed: true,
            sweep_time: Some(time),
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySweep {
    /// Snapshot of the level as of this sweep
    pub level: LiquidityLevel,
    pub sweep_price: f64,
    pub reclaim_price: f64,
    pub direction: TrendDirection,
    pub quality: f64,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidity {
    pub levels: Vec<LiquidityLevel>,
    /// Newest first
    pub recent_sweeps: Vec<LiquiditySweep>,
    pub pdh: Option<f64>,
    pub pdl: Option<f64>,
    pub session_high: f64,
    pub session_low: f64,
    pub equal_highs: Vec<f64>,
    pub equal_lows: Vec<f64>,
}

impl Liquidity {
    /// Highest-quality sweep in `direction`
    pub fn best_sweep(&self, direction: TrendDirection) -> Option<&LiquiditySweep> {
        self.recent_sweeps
            .iter()
            .filter(|s| s.direction == direction)
            .fold(None, |best: Option<&LiquiditySweep>, s| match best {
                Some(b) if b.quality >= s.quality => Some(b),
                _ => Some(s),
            })
    }
}

/// Average of every swing pair within `tolerance` of each other, deduplicated
pub fn detect_equal_levels(swings: &[SwingPoint], tolerance: f64) -> Vec<f64> {
    let mut levels: Vec<f64> = Vec::new();

    for (i, a) in swings.iter().enumerate() {
        for b in &swings[i + 1..] {
            if a.price <= 0.0 || (a.price - b.price).abs() / a.price > tolerance {
                continue;
            }
            let avg = (a.price + b.price) / 2.0;
            if !levels.iter().any(|l| (l - avg).abs() / avg < tolerance) {
                levels.push(avg);
            }
        }
    }

    levels
}

/// High/low of the previous UTC calendar day. Without any prior-day bars,
/// falls back to the last 100 bars excluding the newest.
pub fn previous_day_high_low(candles: &[Candle]) -> Option<(f64, f64)> {
    if candles.len() < 2 {
        return None;
    }

    let now = candles[candles.len() - 1].time;
    let today_start = utc_day_start_ms(now)?;
    let yesterday_start = today_start - DAY_MS;

    let yesterday: Vec<Candle> = candles
        .iter()
        .filter(|c| c.time >= yesterday_start && c.time < today_start)
        .copied()
        .collect();

    if yesterday.is_empty() {
        let window = tail(candles, PRIOR_DAY_FALLBACK_BARS);
        let window = &window[..window.len() - 1];
        return Some((highest_high(window), lowest_low(window)));
    }

    Some((highest_high(&yesterday), lowest_low(&yesterday)))
}

/// High/low since the current session's start: 13:30 UTC from 13:00 on,
/// 08:00 UTC from 08:00, otherwise UTC midnight. Falls back to the newest bar.
pub fn session_high_low(candles: &[Candle]) -> Option<(f64, f64)> {
    let last = candles.last()?;
    let hour = utc_datetime(last.time)?.hour();

    let (start_hour, start_minute) = if hour >= 13 {
        (13, 30)
    } else if hour >= 8 {
        (8, 0)
    } else {
        (0, 0)
    };
    let session_start = utc_time_on_day_ms(last.time, start_hour, start_minute)?;

    let session: Vec<Candle> = candles
        .iter()
        .filter(|c| c.time >= session_start)
        .copied()
        .collect();

    if session.is_empty() {
        return Some((last.high, last.low));
    }
    Some((highest_high(&session), lowest_low(&session)))
}

pub fn build_liquidity_levels(
    candles: &[Candle],
    swing_highs: &[SwingPoint],
    swing_lows: &[SwingPoint],
) -> Vec<LiquidityLevel> {
    let mut levels = Vec::new();
    let Some(current_price) = candles.last().map(|c| c.close) else {
        return levels;
    };

    if let Some((pdh, pdl)) = previous_day_high_low(candles) {
        if pdh > 0.0 {
            levels.push(LiquidityLevel::new(LevelKind::Pdh, pdh, 2.0, current_price));
        }
        if pdl > 0.0 {
            levels.push(LiquidityLevel::new(LevelKind::Pdl, pdl, 2.0, current_price));
        }
    }

    if let Some((high, low)) = session_high_low(candles) {
        levels.push(LiquidityLevel::new(LevelKind::SessionHigh, high, 1.5, current_price));
        levels.push(LiquidityLevel::new(LevelKind::SessionLow, low, 1.5, current_price));
    }

    for price in detect_equal_levels(swing_highs, EQUAL_LEVEL_TOLERANCE) {
        levels.push(LiquidityLevel::new(LevelKind::EqualHighs, price, 1.5, current_price));
    }
    for price in detect_equal_levels(swing_lows, EQUAL_LEVEL_TOLERANCE) {
        levels.push(LiquidityLevel::new(LevelKind::EqualLows, price, 1.5, current_price));
    }

    let recent_swings = swing_highs[swing_highs.len().saturating_sub(RECENT_SWINGS)..]
        .iter()
        .map(|s| (LevelKind::SwingHigh, s))
        .chain(
            swing_lows[swing_lows.len().saturating_sub(RECENT_SWINGS)..]
                .iter()
                .map(|s| (LevelKind::SwingLow, s)),
        );

    for (kind, swing) in recent_swings {
        let duplicate = levels
            .iter()
            .any(|l| (l.price - swing.price).abs() / swing.price < EQUAL_LEVEL_TOLERANCE);
        if !duplicate {
            levels.push(LiquidityLevel::new(kind, swing.price, swing.strength, current_price));
        }
    }

    levels
}

/// Sweeps of `levels` within the last `lookback` bars, newest first.
///
/// A high-side sweep needs a bar wicking above the level while closing
/// below it, then a bar closing back below the level but above the sweep
/// bar's low. Low-side levels mirror this.
pub fn detect_liquidity_sweeps(
    candles: &[Candle],
    levels: &[LiquidityLevel],
    lookback: usize,
) -> Vec<LiquiditySweep> {
    let mut sweeps = Vec::new();
    let recent = tail(candles, lookback);

    for level in levels {
        let price = level.price;
        if price <= 0.0 {
            continue;
        }

        for pair in recent.windows(2) {
            let (bar, next) = (&pair[0], &pair[1]);

            let swept = if level.kind.is_high() {
                bar.high > price && bar.close < price && next.close < price && next.close > bar.low
            } else {
                bar.low < price && bar.close > price && next.close > price && next.close < bar.high
            };
            if !swept {
                continue;
            }

            let (sweep_price, excursion, direction) = if level.kind.is_high() {
                (bar.high, bar.high - price, TrendDirection::Bearish)
            } else {
                (bar.low, price - bar.low, TrendDirection::Bullish)
            };

            sweeps.push(LiquiditySweep {
                level: level.with_sweep(bar.time),
                sweep_price,
                reclaim_price: next.close,
                direction,
                quality: level.strength * (1.0 + excursion / price * 100.0),
                time: bar.time,
            });
        }
    }

    sweeps.sort_by(|a, b| b.time.cmp(&a.time));
    sweeps
}

/// New level records carrying the latest sweep recorded against each level
pub fn apply_sweeps(levels: &[LiquidityLevel], sweeps: &[LiquiditySweep]) -> Vec<LiquidityLevel> {
    levels
        .iter()
        .map(|level| {
            sweeps
                .iter()
                .filter(|s| s.level.kind == level.kind && s.level.price == level.price)
                .map(|s| s.time)
                .max()
                .map(|time| level.with_sweep(time))
                .unwrap_or(*level)
        })
        .collect()
}

pub fn analyze_liquidity(
    candles: &[Candle],
    swing_highs: &[SwingPoint],
    swing_lows: &[SwingPoint],
) -> Liquidity {
    let base_levels = build_liquidity_levels(candles, swing_highs, swing_lows);
    let recent_sweeps = detect_liquidity_sweeps(candles, &base_levels, SWEEP_LOOKBACK);
    let levels = apply_sweeps(&base_levels, &recent_sweeps);

    let (pdh, pdl) = match previous_day_high_low(candles) {
        Some((high, low)) => (Some(high), Some(low)),
        None => (None, None),
    };
    let (session_high, session_low) = session_high_low(candles).unwrap_or((0.0, 0.0));

    Liquidity {
        levels,
        recent_sweeps,
        pdh,
        pdl,
        session_high,
        session_low,
        equal_highs: detect_equal_levels(swing_highs, EQUAL_LEVEL_TOLERANCE),
        equal_lows: detect_equal_levels(swing_lows, EQUAL_LEVEL_TOLERANCE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::fixtures::{candle, flat_bars, retime, BASE_TIME_MS, FIFTEEN_MIN_MS};
    use crate::trading_core::structure::SwingKind;

    fn swing(price: f64, index: usize) -> SwingPoint {
        SwingPoint {
            kind: SwingKind::High,
            price,
            index,
            time: 0,
            strength: 1.0,
        }
    }

    #[test]
    fn test_previous_day_and_fallback() {
        // 8 bars on day one, 4 on day two starting at midnight
        let mut bars = flat_bars(0, 12, 100.0, 1.0);
        bars[3].high = 104.0;
        bars[5].low = 95.0;
        bars[10].high = 110.0;
        retime(&mut bars[..8], BASE_TIME_MS + 16 * 3_600_000, FIFTEEN_MIN_MS);
        retime(&mut bars[8..], BASE_TIME_MS + 24 * 3_600_000, FIFTEEN_MIN_MS);

        assert_eq!(previous_day_high_low(&bars), Some((104.0, 95.0)));

        // Same day only: last 100 bars minus the newest
        let mut same_day = flat_bars(0, 5, 100.0, 1.0);
        same_day[2].high = 102.0;
        same_day[4].high = 120.0;
        assert_eq!(previous_day_high_low(&same_day), Some((102.0, 99.5)));
        assert_eq!(previous_day_high_low(&same_day[..1]), None);
    }

    #[test]
    fn test_session_high_low() {
        // 13:00 - 14:45 UTC: session starts 13:30
        let mut bars = flat_bars(52, 8, 100.0, 1.0);
        bars[0].high = 130.0;
        bars[3].high = 103.0;
        assert_eq!(session_high_low(&bars), Some((103.0, 99.5)));
    }

    #[test]
    fn test_equal_levels() {
        let swings = vec![swing(100.0, 5), swing(100.1, 15), swing(100.05, 25), swing(110.0, 35)];
        let levels = detect_equal_levels(&swings, 0.002);
        assert_eq!(levels.len(), 1);
        assert!((levels[0] - 100.05).abs() < 1e-9);
    }

    #[test]
    fn test_low_sweep_is_bullish_and_levels_are_not_mutated() {
        let mut bars = flat_bars(0, 30, 100.0, 1.0);
        // Wick to 98 below a 99 level, close back above, then hold
        bars[25] = candle(25, 99.6, 100.3, 98.0, 99.5);
        bars[26] = candle(26, 99.5, 100.2, 99.3, 100.0);

        let level = LiquidityLevel::new(LevelKind::SwingLow, 99.0, 1.0, 100.0);
        let levels = vec![level];
        let sweeps = detect_liquidity_sweeps(&bars, &levels, 20);

        assert_eq!(sweeps.len(), 1);
        let sweep = &sweeps[0];
        assert_eq!(sweep.direction, TrendDirection::Bullish);
        assert_eq!(sweep.sweep_price, 98.0);
        assert!((sweep.quality - (1.0 + 1.0 / 99.0 * 100.0)).abs() < 1e-9);
        assert!(sweep.level.swept && sweep.level.reclaimed);
        assert_eq!(sweep.level.sweep_time, Some(bars[25].time));

        // Inputs untouched, updated copies returned separately
        assert!(!levels[0].swept);
        let updated = apply_sweeps(&levels, &sweeps);
        assert!(updated[0].swept);
        assert_eq!(updated[0].sweep_time, Some(bars[25].time));
    }

    #[test]
    fn test_sweep_outside_lookback_ignored() {
        let mut bars = flat_bars(0, 40, 100.0, 1.0);
        bars[5] = candle(5, 99.6, 100.3, 98.0, 99.5);
        bars[6] = candle(6, 99.5, 100.2, 99.3, 100.0);
        let levels = vec![LiquidityLevel::new(LevelKind::SwingLow, 99.0, 1.0, 100.0)];
        assert!(detect_liquidity_sweeps(&bars, &levels, 20).is_empty());
    }

    #[test]
    fn test_touched_flags() {
        let pdh = LiquidityLevel::new(LevelKind::Pdh, 100.0, 2.0, 99.85);
        assert!(pdh.touched);
        let swing_high = LiquidityLevel::new(LevelKind::SwingHigh, 100.0, 1.0, 99.85);
        assert!(!swing_high.touched);
        let pdl = LiquidityLevel::new(LevelKind::Pdl, 100.0, 2.0, 100.15);
        assert!(pdl.touched);
    }
}
