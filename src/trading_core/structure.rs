//! Market structure: swing points, BOS/CHOCH breaks and pullbacks

use super::bars::{highest_high, lowest_low, tail, Candle};
use super::indicators::{avg_body, avg_range};
use crate::types::TrendDirection;
use serde::{Deserialize, Serialize};

/// Bars scanned for structure breaks
const BREAK_SCAN_BARS: usize = 10;
/// Bars scanned for the current pullback
const PULLBACK_WINDOW: usize = 20;
/// Baseline period the pullback's bars are compared against
const PULLBACK_BASELINE: usize = 30;
const MIN_PULLBACK_BARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwingKind {
    High,
    Low,
}

/// Confirmed local extremum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub kind: SwingKind,
    pub price: f64,
    pub index: usize,
    pub time: i64,
    /// Share of the 4L neighbour comparisons (highs and lows on both sides)
    /// that fall inside the bar, in [0.5, 1]. A bar that also engulfs its
    /// neighbours' opposite extremes scores 1.
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakKind {
    #[serde(rename = "BOS")]
    Bos,
    #[serde(rename = "CHOCH")]
    Choch,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructureBreak {
    pub kind: BreakKind,
    pub direction: TrendDirection,
    pub level: f64,
    pub index: usize,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullbackKind {
    Shallow,
    Deep,
    Extended,
}

impl PullbackKind {
    pub fn from_depth(depth: f64) -> Self {
        if depth > 0.618 {
            PullbackKind::Extended
        } else if depth > 0.382 {
            PullbackKind::Deep
        } else {
            PullbackKind::Shallow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PullbackClassification {
    pub kind: PullbackKind,
    /// Correction range / originating swing range, capped at 1
    pub depth: f64,
    pub candle_count: usize,
    pub is_slow_correction: bool,
    pub avg_range_ratio: f64,
    pub avg_body_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub swing_highs: Vec<SwingPoint>,
    pub swing_lows: Vec<SwingPoint>,
    pub recent_breaks: Vec<StructureBreak>,
    pub current_trend: TrendDirection,
    pub last_bos: Option<StructureBreak>,
    pub last_choch: Option<StructureBreak>,
    pub pullback: Option<PullbackClassification>,
}

impl Structure {
    pub fn last_swing_high(&self) -> Option<&SwingPoint> {
        self.swing_highs.last()
    }

    pub fn last_swing_low(&self) -> Option<&SwingPoint> {
        self.swing_lows.last()
    }
}

/// Swing highs and lows with a symmetric lookback.
///
/// A bar is a swing high when every bar within `lookback` on both sides has
/// a strictly lower high (mirrored for lows).
pub fn detect_swing_points(candles: &[Candle], lookback: usize) -> (Vec<SwingPoint>, Vec<SwingPoint>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();

    if lookback == 0 || candles.len() < lookback * 2 + 1 {
        return (highs, lows);
    }

    let comparisons = (lookback * 4) as f64;

    for i in lookback..candles.len() - lookback {
        let current = &candles[i];
        let window = candles[i - lookback..=i + lookback]
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != lookback)
            .map(|(_, c)| c);

        let (mut lower_highs, mut higher_lows) = (0usize, 0usize);
        for c in window {
            if c.high < current.high {
                lower_highs += 1;
            }
            if c.low > current.low {
                higher_lows += 1;
            }
        }

        let strength = (lower_highs + higher_lows) as f64 / comparisons;

        if lower_highs == lookback * 2 {
            highs.push(SwingPoint {
                kind: SwingKind::High,
                price: current.high,
                index: i,
                time: current.time,
                strength,
            });
        }
        if higher_lows == lookback * 2 {
            lows.push(SwingPoint {
                kind: SwingKind::Low,
                price: current.low,
                index: i,
                time: current.time,
                strength,
            });
        }
    }

    (highs, lows)
}

/// Bullish on higher highs and higher lows, bearish on lower highs and lower lows
pub fn classify_trend(highs: &[SwingPoint], lows: &[SwingPoint]) -> TrendDirection {
    if highs.len() < 2 || lows.len() < 2 {
        return TrendDirection::Neutral;
    }

    let (h0, h1) = (highs[highs.len() - 2].price, highs[highs.len() - 1].price);
    let (l0, l1) = (lows[lows.len() - 2].price, lows[lows.len() - 1].price);

    if h1 > h0 && l1 > l0 {
        TrendDirection::Bullish
    } else if h1 < h0 && l1 < l0 {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    }
}

/// Closes beyond the most recent swing levels over the last 10 bars.
/// A break against `trend` is a CHOCH, anything else a BOS.
pub fn detect_structure_breaks(
    candles: &[Candle],
    highs: &[SwingPoint],
    lows: &[SwingPoint],
    trend: TrendDirection,
) -> Vec<StructureBreak> {
    let mut breaks = Vec::new();
    if candles.len() < 3 {
        return breaks;
    }

    let offset = candles.len().saturating_sub(BREAK_SCAN_BARS);
    let last_high = highs.last();
    let last_low = lows.last();

    for (i, candle) in candles.iter().enumerate().skip(offset) {
        if let Some(swing) = last_high.filter(|s| i > s.index && candle.close > s.price) {
            let kind = if trend == TrendDirection::Bearish {
                BreakKind::Choch
            } else {
                BreakKind::Bos
            };
            breaks.push(StructureBreak {
                kind,
                direction: TrendDirection::Bullish,
                level: swing.price,
                index: i,
                time: candle.time,
            });
        }

        if let Some(swing) = last_low.filter(|s| i > s.index && candle.close < s.price) {
            let kind = if trend == TrendDirection::Bullish {
                BreakKind::Choch
            } else {
                BreakKind::Bos
            };
            breaks.push(StructureBreak {
                kind,
                direction: TrendDirection::Bearish,
                level: swing.price,
                index: i,
                time: candle.time,
            });
        }
    }

    breaks
}

/// Bar index within `bars` where a correction that starts at `bars[0]`
/// ends: the bar before the first two consecutive closes back in the
/// trend direction, else the last bar while the correction is still running.
fn correction_end(bars: &[Candle], bullish: bool) -> usize {
    let resumes = |i: usize| {
        let (a, b, c) = (bars[i - 2].close, bars[i - 1].close, bars[i].close);
        if bullish {
            c > b && b > a
        } else {
            c < b && b < a
        }
    };

    (2..bars.len())
        .find(|&i| resumes(i))
        .map(|i| i - 2)
        .unwrap_or(bars.len() - 1)
}

/// Classify the correction after the most recent trend extreme within the
/// last 20 bars. The correction ends once price resumes with two consecutive
/// closes in the trend direction; those resumption bars are not counted.
pub fn classify_pullback(
    candles: &[Candle],
    highs: &[SwingPoint],
    lows: &[SwingPoint],
    trend: TrendDirection,
) -> Option<PullbackClassification> {
    if trend == TrendDirection::Neutral || candles.len() < MIN_PULLBACK_BARS {
        return None;
    }

    let baseline_range = avg_range(candles, PULLBACK_BASELINE);
    let baseline_body = avg_body(candles, PULLBACK_BASELINE);
    if baseline_range == 0.0 || baseline_body == 0.0 {
        return None;
    }

    let recent = tail(candles, PULLBACK_WINDOW);
    let offset = candles.len() - recent.len();
    let bullish = trend == TrendDirection::Bullish;

    // Most recent bar holding the window's extreme
    let mut extreme_at = 0;
    for (i, c) in recent.iter().enumerate() {
        let beyond = if bullish {
            c.high >= recent[extreme_at].high
        } else {
            c.low <= recent[extreme_at].low
        };
        if beyond {
            extreme_at = i;
        }
    }

    // The extreme bar anchors the resumption check but is not part of the count
    let end = extreme_at + correction_end(&recent[extreme_at..], bullish);
    if end <= extreme_at {
        return None;
    }

    let correction = &recent[extreme_at + 1..=end];
    let extreme_bar = &recent[extreme_at];
    let extreme_index = offset + extreme_at;

    let (correction_range, swing_range) = if bullish {
        let origin = lows
            .iter()
            .rev()
            .find(|s| s.index < extreme_index)
            .map(|s| s.price)
            .unwrap_or_else(|| lowest_low(&recent[..=extreme_at]));
        (
            extreme_bar.high - lowest_low(correction),
            extreme_bar.high - origin,
        )
    } else {
        let origin = highs
            .iter()
            .rev()
            .find(|s| s.index < extreme_index)
            .map(|s| s.price)
            .unwrap_or_else(|| highest_high(&recent[..=extreme_at]));
        (
            highest_high(correction) - extreme_bar.low,
            origin - extreme_bar.low,
        )
    };

    let depth = if swing_range > 0.0 {
        (correction_range / swing_range).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let candle_count = correction.len();
    let avg_range_ratio = avg_range(correction, candle_count) / baseline_range;
    let avg_body_ratio = avg_body(correction, candle_count) / baseline_body;

    Some(PullbackClassification {
        kind: PullbackKind::from_depth(depth),
        depth,
        candle_count,
        is_slow_correction: candle_count >= 3 && avg_range_ratio <= 0.8 && avg_body_ratio <= 0.6,
        avg_range_ratio,
        avg_body_ratio,
    })
}

pub fn analyze_structure(candles: &[Candle], lookback: usize) -> Structure {
    let (swing_highs, swing_lows) = detect_swing_points(candles, lookback);
    let current_trend = classify_trend(&swing_highs, &swing_lows);
    let recent_breaks = detect_structure_breaks(candles, &swing_highs, &swing_lows, current_trend);

    let last_bos = recent_breaks.iter().rev().find(|b| b.kind == BreakKind::Bos).copied();
    let last_choch = recent_breaks.iter().rev().find(|b| b.kind == BreakKind::Choch).copied();
    let pullback = classify_pullback(candles, &swing_highs, &swing_lows, current_trend);

    Structure {
        swing_highs,
        swing_lows,
        recent_breaks,
        current_trend,
        last_bos,
        last_choch,
        pullback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::fixtures::{candle, downtrend_bars, flat_bars, path_bars, uptrend_bars};
    use proptest::prelude::*;

    fn from_highs(highs: &[f64]) -> Vec<Candle> {
        highs
            .iter()
            .enumerate()
            .map(|(i, &h)| candle(i, h - 0.5, h, h - 1.0, h - 0.5))
            .collect()
    }

    #[test]
    fn test_swing_points() {
        let bars = from_highs(&[1.0, 2.0, 3.0, 2.0, 1.0, 2.0, 5.0, 2.0, 1.0]);
        let (highs, lows) = detect_swing_points(&bars, 2);

        let high_idx: Vec<usize> = highs.iter().map(|s| s.index).collect();
        assert_eq!(high_idx, vec![2, 6]);
        // Every neighbour high is lower but no neighbour low is higher
        assert_eq!(highs[0].strength, 0.5);
        assert_eq!(lows.len(), 1);
        assert_eq!(lows[0].index, 4);

        // Equal neighbour disqualifies the swing
        let flat_top = from_highs(&[1.0, 2.0, 3.0, 3.0, 2.0, 1.0]);
        let (highs, _) = detect_swing_points(&flat_top, 2);
        assert!(highs.is_empty());
    }

    #[test]
    fn test_swing_strength_grades_the_extremum() {
        let mut bars = vec![
            candle(0, 2.0, 2.5, 1.5, 2.0),
            candle(1, 2.0, 3.0, 1.0, 2.5),
            candle(2, 2.5, 4.0, 0.5, 3.0),
            candle(3, 3.0, 3.5, 2.0, 2.5),
            candle(4, 2.5, 3.0, 0.2, 1.0),
        ];
        let (highs, lows) = detect_swing_points(&bars, 2);
        assert_eq!(highs.len(), 1);
        assert!(lows.is_empty());
        // 4 lower highs + 3 higher lows out of 8 comparisons
        assert!((highs[0].strength - 0.875).abs() < 1e-12);

        // An outside bar is both a swing high and a swing low at full strength
        bars[4].low = 0.6;
        let (highs, lows) = detect_swing_points(&bars, 2);
        assert_eq!(highs[0].strength, 1.0);
        assert_eq!(lows[0].index, 2);
        assert_eq!(lows[0].strength, 1.0);
    }

    #[test]
    fn test_uptrend_bos() {
        let bars = uptrend_bars();
        let structure = analyze_structure(&bars, 5);

        assert_eq!(structure.current_trend, TrendDirection::Bullish);
        assert_eq!(structure.swing_highs.len(), 3);
        assert_eq!(structure.swing_lows.len(), 3);
        assert!(structure.last_choch.is_none());

        let bos = structure.last_bos.expect("bos");
        assert_eq!(bos.direction, TrendDirection::Bullish);
        assert_eq!(bos.index, bars.len() - 1);
        assert!((bos.level - 112.1).abs() < 1e-9);

        // The newest bar is the extreme, so there is no pullback yet
        assert!(structure.pullback.is_none());
    }

    #[test]
    fn test_choch_against_downtrend() {
        let mut closes: Vec<f64> = downtrend_bars().iter().map(|c| c.close).collect();
        closes.extend([101.5, 103.0, 104.5, 106.0, 107.5]);
        let bars = path_bars(0, &closes, 0.1);

        let structure = analyze_structure(&bars, 5);
        assert_eq!(structure.current_trend, TrendDirection::Bearish);

        let choch = structure.last_choch.expect("choch");
        assert_eq!(choch.direction, TrendDirection::Bullish);
        assert_eq!(choch.index, bars.len() - 1);
        assert!(structure.last_bos.is_none());
    }

    #[test]
    fn test_pullback_depth() {
        let mut closes: Vec<f64> = uptrend_bars().iter().map(|c| c.close).collect();
        closes.extend([114.2, 113.4, 112.6]);
        let bars = path_bars(0, &closes, 0.1);

        let structure = analyze_structure(&bars, 5);
        assert_eq!(structure.current_trend, TrendDirection::Bullish);

        let pullback = structure.pullback.expect("pullback");
        assert_eq!(pullback.candle_count, 3);
        // (115.1 - 112.5) / (115.1 - 108.9)
        assert!((pullback.depth - 2.6 / 6.2).abs() < 1e-9);
        assert_eq!(pullback.kind, PullbackKind::Deep);
    }

    #[test]
    fn test_pullback_ends_when_trend_resumes() {
        // Two bars down from the 115 top, then two higher closes below it
        let mut closes: Vec<f64> = uptrend_bars().iter().map(|c| c.close).collect();
        closes.extend([114.2, 113.4, 114.0, 114.6]);
        let bars = path_bars(0, &closes, 0.1);

        let structure = analyze_structure(&bars, 5);
        assert_eq!(structure.current_trend, TrendDirection::Bullish);

        let pullback = structure.pullback.expect("pullback");
        assert_eq!(pullback.candle_count, 2);
        assert!(!pullback.is_slow_correction);
        // (115.1 - 113.3) / (115.1 - 108.9), the resumption bars do not deepen it
        assert!((pullback.depth - 1.8 / 6.2).abs() < 1e-9);
        assert_eq!(pullback.kind, PullbackKind::Shallow);
    }

    #[test]
    fn test_bearish_pullback_ends_when_trend_resumes() {
        let mut closes: Vec<f64> = downtrend_bars().iter().map(|c| c.close).collect();
        let last = *closes.last().expect("bars");
        closes.extend([last + 0.8, last + 1.6, last + 1.0, last + 0.4]);
        let bars = path_bars(0, &closes, 0.1);

        let structure = analyze_structure(&bars, 5);
        assert_eq!(structure.current_trend, TrendDirection::Bearish);
        assert_eq!(structure.pullback.expect("pullback").candle_count, 2);

        // Still retracing: every bar after the low is counted
        let mut closes: Vec<f64> = downtrend_bars().iter().map(|c| c.close).collect();
        closes.extend([last + 0.8, last + 1.6, last + 1.2, last + 1.8]);
        let bars = path_bars(0, &closes, 0.1);
        let structure = analyze_structure(&bars, 5);
        assert_eq!(structure.pullback.expect("pullback").candle_count, 4);
    }

    #[test]
    fn test_no_pullback_without_trend() {
        let bars = flat_bars(0, 40, 100.0, 1.0);
        let structure = analyze_structure(&bars, 5);
        assert_eq!(structure.current_trend, TrendDirection::Neutral);
        assert!(structure.pullback.is_none());
    }

    fn random_candles() -> impl Strategy<Value = Vec<Candle>> {
        prop::collection::vec((-1.0f64..1.0, 0.0f64..0.5, 0.0f64..0.5), 11..80).prop_map(|steps| {
            let mut price: f64 = 100.0;
            steps
                .into_iter()
                .enumerate()
                .map(|(i, (delta, up, down))| {
                    let open = price;
                    price += delta;
                    candle(i, open, open.max(price) + up, open.min(price) - down, price)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_swing_points_dominate_their_window(candles in random_candles(), lookback in 1usize..6) {
            let (highs, lows) = detect_swing_points(&candles, lookback);

            for swing in &highs {
                let lo = swing.index - lookback;
                let hi = swing.index + lookback;
                for j in lo..=hi {
                    if j != swing.index {
                        prop_assert!(candles[j].high < swing.price);
                    }
                }
            }
            for swing in &lows {
                for j in swing.index - lookback..=swing.index + lookback {
                    if j != swing.index {
                        prop_assert!(candles[j].low > swing.price);
                    }
                }
            }
        }
    }
}
