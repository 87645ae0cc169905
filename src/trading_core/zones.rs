//! Zone detection: displacement candles, fair value gaps, rejection wicks
//! and the opening range box.
//!
//! Mitigation is judged against every close after a zone formed, so a zone
//! that is mitigated on one candle series stays mitigated on any extension
//! of it.

use super::bars::{highest_high, lowest_low, Candle};
use super::indicators::{avg_body, avg_range};
use super::session::{utc_time_on_day_ms, SessionInfo};
use crate::types::TrendDirection;
use serde::{Deserialize, Serialize};

pub const DISPLACEMENT_LOOKBACK: usize = 20;
pub const DISPLACEMENT_BODY_MULT: f64 = 3.0;
pub const DISPLACEMENT_RANGE_MULT: f64 = 1.5;
/// Newest bars searched for a displacement candle
const DISPLACEMENT_SCAN_BARS: usize = 5;

const FVG_AVERAGE_PERIOD: usize = 30;
const FVG_BODY_MULT: f64 = 2.0;
const FVG_MIN_GAP_RANGE_MULT: f64 = 0.3;
const WICK_SCAN_BARS: usize = 30;
const WICK_MIN_RATIO: f64 = 0.5;
const MAX_ZONES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplacementCandle {
    pub candle: Candle,
    pub index: usize,
    pub body_multiplier: f64,
    pub range_multiplier: f64,
    pub close_location: f64,
    pub direction: TrendDirection,
    pub quality: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FvgZone {
    pub direction: TrendDirection,
    pub high: f64,
    pub low: f64,
    pub midpoint: f64,
    /// Index of the displacement (middle) candle
    pub creation_index: usize,
    pub creation_time: i64,
    pub displacement_quality: f64,
    pub mitigated: bool,
    /// How far into the zone the latest close sits (0 at the near edge)
    pub mitigation_level: f64,
    pub touch_count: u32,
    pub is_first_touch: bool,
}

impl FvgZone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WickZone {
    pub direction: TrendDirection,
    pub zone_high: f64,
    pub zone_low: f64,
    pub wick_extreme: f64,
    pub wick_ratio: f64,
    pub body_edge: f64,
    pub creation_index: usize,
    pub mitigated: bool,
    pub touch_count: u32,
}

impl WickZone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.zone_low && price <= self.zone_high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrbBox {
    pub high: f64,
    pub low: f64,
    pub range_size: f64,
    pub midpoint: f64,
    pub breakout_direction: Option<TrendDirection>,
    pub breakout_confirmed: bool,
    pub breakout_price: Option<f64>,
    pub retest_complete: bool,
    /// Epoch-ms at which the capture window closed
    pub window_end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zones {
    pub fvg_zones: Vec<FvgZone>,
    pub wick_zones: Vec<WickZone>,
    pub orb_box: Option<OrbBox>,
    pub active_fvg: Option<FvgZone>,
    pub active_wick_zone: Option<WickZone>,
}

/// Most recent of the last 5 bars whose body and range dwarf the preceding
/// averages and whose close sits at the directional extreme of its range.
pub fn detect_displacement(
    candles: &[Candle],
    lookback: usize,
    body_mult: f64,
    range_mult: f64,
) -> Option<DisplacementCandle> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }

    let len = candles.len();
    let baseline = &candles[len - 1 - lookback..len - 1];
    let average_body = avg_body(baseline, lookback);
    let average_range = avg_range(baseline, lookback);
    if average_body == 0.0 || average_range == 0.0 {
        return None;
    }

    for index in (len.saturating_sub(DISPLACEMENT_SCAN_BARS)..len).rev() {
        let candle = candles[index];
        let body_multiplier = candle.body() / average_body;
        let range_multiplier = candle.range() / average_range;
        if body_multiplier < body_mult || range_multiplier < range_mult {
            continue;
        }

        let close_location = candle.close_location();
        let direction = if candle.is_bullish() && close_location >= 0.8 {
            TrendDirection::Bullish
        } else if !candle.is_bullish() && close_location <= 0.2 {
            TrendDirection::Bearish
        } else {
            continue;
        };

        let directional_close = match direction {
            TrendDirection::Bullish => close_location,
            _ => 1.0 - close_location,
        };
        let quality =
            (body_multiplier / body_mult + range_multiplier / range_mult + directional_close) / 3.0;

        return Some(DisplacementCandle {
            candle,
            index,
            body_multiplier,
            range_multiplier,
            close_location,
            direction,
            quality: quality.min(1.0),
        });
    }

    None
}

/// Touch runs and mitigation for a zone given the closes after it formed.
/// A touch is a close entering the zone from outside.
fn zone_interaction(
    later: &[Candle],
    contains: impl Fn(f64) -> bool,
    breached: impl Fn(f64) -> bool,
) -> (u32, bool) {
    let mut touches = 0u32;
    let mut inside = false;
    let mut mitigated = false;

    for c in later {
        if breached(c.close) {
            mitigated = true;
        }
        let now_inside = contains(c.close);
        if now_inside && !inside {
            touches += 1;
        }
        inside = now_inside;
    }

    (touches, mitigated)
}

/// Every fair value gap in the series, mitigated ones included
pub fn scan_fvg_zones(candles: &[Candle]) -> Vec<FvgZone> {
    let mut zones = Vec::new();
    let Some(current_price) = candles.last().map(|c| c.close) else {
        return zones;
    };
    if candles.len() < 5 {
        return zones;
    }

    let average_body = avg_body(candles, FVG_AVERAGE_PERIOD);
    let average_range = avg_range(candles, FVG_AVERAGE_PERIOD);

    for i in 2..candles.len() {
        let (first, middle, third) = (&candles[i - 2], &candles[i - 1], &candles[i]);
        let body = middle.body();
        if body < average_body * FVG_BODY_MULT {
            continue;
        }

        let (direction, high, low) = if middle.is_bullish() && third.low > first.high {
            (TrendDirection::Bullish, third.low, first.high)
        } else if middle.is_bearish() && third.high < first.low {
            (TrendDirection::Bearish, first.low, third.high)
        } else {
            continue;
        };
        if high - low < average_range * FVG_MIN_GAP_RANGE_MULT {
            continue;
        }

        let bullish = direction == TrendDirection::Bullish;
        let (touch_count, mitigated) = zone_interaction(
            &candles[i + 1..],
            |close| close >= low && close <= high,
            |close| if bullish { close < low } else { close > high },
        );

        let inside_now = current_price >= low && current_price <= high && i + 1 < candles.len();
        let mitigation_level = match (inside_now, bullish) {
            (true, true) => (high - current_price) / (high - low),
            (true, false) => (current_price - low) / (high - low),
            (false, _) => 0.0,
        };

        zones.push(FvgZone {
            direction,
            high,
            low,
            midpoint: (high + low) / 2.0,
            creation_index: i - 1,
            creation_time: middle.time,
            displacement_quality: (body / (average_body * 3.0)).min(1.0),
            mitigated,
            mitigation_level,
            touch_count,
            is_first_touch: !mitigated && touch_count <= 1,
        });
    }

    zones
}

/// The unmitigated gaps nearest the current close
pub fn detect_fvg_zones(candles: &[Candle], max_zones: usize) -> Vec<FvgZone> {
    let Some(current_price) = candles.last().map(|c| c.close) else {
        return Vec::new();
    };

    let mut zones: Vec<FvgZone> = scan_fvg_zones(candles)
        .into_iter()
        .filter(|z| !z.mitigated)
        .collect();
    zones.sort_by(|a, b| {
        (current_price - a.midpoint)
            .abs()
            .total_cmp(&(current_price - b.midpoint).abs())
    });
    zones.truncate(max_zones);
    zones
}

/// Every rejection wick among the last 30 bars, newest first, mitigated ones included
pub fn scan_wick_zones(candles: &[Candle]) -> Vec<WickZone> {
    let mut zones = Vec::new();
    if candles.len() < 10 {
        return zones;
    }

    let start = candles.len().saturating_sub(WICK_SCAN_BARS);
    for i in (start..candles.len()).rev() {
        let candle = &candles[i];
        let range = candle.range();
        if range == 0.0 {
            continue;
        }
        let later = &candles[i + 1..];

        let lower_ratio = candle.lower_wick() / range;
        if lower_ratio >= WICK_MIN_RATIO {
            let (zone_low, zone_high) = (candle.low, candle.body_low());
            let (touch_count, mitigated) = zone_interaction(
                later,
                |close| close >= zone_low && close <= zone_high,
                |close| close < zone_low,
            );
            zones.push(WickZone {
                direction: TrendDirection::Bullish,
                zone_high,
                zone_low,
                wick_extreme: candle.low,
                wick_ratio: lower_ratio,
                body_edge: candle.body_low(),
                creation_index: i,
                mitigated,
                touch_count,
            });
        }

        let upper_ratio = candle.upper_wick() / range;
        if upper_ratio >= WICK_MIN_RATIO {
            let (zone_low, zone_high) = (candle.body_high(), candle.high);
            let (touch_count, mitigated) = zone_interaction(
                later,
                |close| close >= zone_low && close <= zone_high,
                |close| close > zone_high,
            );
            zones.push(WickZone {
                direction: TrendDirection::Bearish,
                zone_high,
                zone_low,
                wick_extreme: candle.high,
                wick_ratio: upper_ratio,
                body_edge: candle.body_high(),
                creation_index: i,
                mitigated,
                touch_count,
            });
        }
    }

    zones
}

/// The unmitigated wick zones with the largest wick ratios
pub fn detect_wick_zones(candles: &[Candle], max_zones: usize) -> Vec<WickZone> {
    let mut zones: Vec<WickZone> = scan_wick_zones(candles)
        .into_iter()
        .filter(|z| !z.mitigated)
        .collect();
    zones.sort_by(|a, b| b.wick_ratio.total_cmp(&a.wick_ratio));
    zones.truncate(max_zones);
    zones
}

/// Opening range for the current session, frozen once its capture window
/// has elapsed. Breakout and retest only look at bars from the window end on.
pub fn detect_orb_box(candles: &[Candle], session: &SessionInfo, window_minutes: u32) -> Option<OrbBox> {
    if !session.is_open {
        return None;
    }
    let (hour, minute) = session.name.orb_open()?;
    let last = candles.last()?;

    let window_start = utc_time_on_day_ms(last.time, hour, minute)?;
    let window_end = window_start + window_minutes as i64 * 60_000;

    let captured: Vec<Candle> = candles
        .iter()
        .filter(|c| c.time >= window_start && c.time < window_end)
        .copied()
        .collect();
    if captured.is_empty() {
        return None;
    }

    let high = highest_high(&captured);
    let low = lowest_low(&captured);

    let mut breakout_direction = None;
    let mut breakout_price = None;
    let mut retest_complete = false;

    for candle in candles.iter().filter(|c| c.time >= window_end) {
        match breakout_direction {
            None if candle.close > high => {
                breakout_direction = Some(TrendDirection::Bullish);
                breakout_price = Some(candle.close);
            }
            None if candle.close < low => {
                breakout_direction = Some(TrendDirection::Bearish);
                breakout_price = Some(candle.close);
            }
            Some(TrendDirection::Bullish) if candle.low <= high && candle.close > high => {
                retest_complete = true;
            }
            Some(TrendDirection::Bearish) if candle.high >= low && candle.close < low => {
                retest_complete = true;
            }
            _ => {}
        }
    }

    Some(OrbBox {
        high,
        low,
        range_size: high - low,
        midpoint: (high + low) / 2.0,
        breakout_direction,
        breakout_confirmed: breakout_direction.is_some(),
        breakout_price,
        retest_complete,
        window_end,
    })
}

pub fn analyze_zones(candles: &[Candle], session: &SessionInfo, orb_window_minutes: u32) -> Zones {
    let fvg_zones = detect_fvg_zones(candles, MAX_ZONES);
    let wick_zones = detect_wick_zones(candles, MAX_ZONES);
    let orb_box = detect_orb_box(candles, session, orb_window_minutes);

    let current_price = candles.last().map(|c| c.close).unwrap_or(0.0);

    let active_fvg = fvg_zones
        .iter()
        .find(|z| !z.mitigated && z.is_first_touch && z.contains(current_price))
        .copied();
    let active_wick_zone = wick_zones
        .iter()
        .find(|z| !z.mitigated && z.contains(current_price))
        .copied();

    Zones {
        fvg_zones,
        wick_zones,
        orb_box,
        active_fvg,
        active_wick_zone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::fixtures::{candle, retime, BASE_TIME_MS, MINUTE_MS};
    use crate::trading_core::session::SessionName;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    /// 31 quiet bars, a bullish displacement bar, then a gap-leaving bar
    fn gap_series() -> Vec<Candle> {
        let mut bars: Vec<Candle> = (0..30)
            .map(|i| candle(i, 100.0, 100.6, 99.4, 100.2))
            .collect();
        bars.push(candle(30, 100.0, 100.5, 99.5, 100.2));
        bars.push(candle(31, 100.2, 103.2, 100.1, 103.0));
        bars.push(candle(32, 103.0, 103.5, 101.5, 103.3));
        bars
    }

    #[test]
    fn test_displacement() {
        let bars = gap_series();
        let d = detect_displacement(&bars, 20, 3.0, 1.5).expect("displacement");
        assert_eq!(d.index, 31);
        assert_eq!(d.direction, TrendDirection::Bullish);
        assert!(d.body_multiplier > 8.0);
        assert_eq!(d.quality, 1.0);

        assert!(detect_displacement(&bars[..20], 20, 3.0, 1.5).is_none());
    }

    #[test]
    fn test_fvg_first_touch_then_mitigation() {
        let mut bars = gap_series();
        bars.push(candle(33, 103.3, 103.4, 101.1, 101.2));

        let zones = analyze_zones(&bars, &SessionInfo::from_minute_of_day(0), 15);
        let fvg = zones.active_fvg.expect("active fvg");
        assert_eq!(fvg.direction, TrendDirection::Bullish);
        assert_eq!((fvg.low, fvg.high), (100.5, 101.5));
        assert_eq!(fvg.creation_index, 31);
        assert_eq!(fvg.touch_count, 1);
        assert!(fvg.is_first_touch);
        assert!((fvg.mitigation_level - 0.3).abs() < 1e-9);

        // Close through the far edge, then back inside
        bars.push(candle(34, 101.2, 101.3, 100.2, 100.3));
        let scanned = scan_fvg_zones(&bars);
        assert!(scanned.iter().any(|z| z.creation_index == 31 && z.mitigated));

        bars.push(candle(35, 100.3, 101.1, 100.2, 101.0));
        let zones = analyze_zones(&bars, &SessionInfo::from_minute_of_day(0), 15);
        assert!(zones.active_fvg.is_none());
        assert!(zones.fvg_zones.iter().all(|z| z.creation_index != 31));
    }

    #[test]
    fn test_wick_zone() {
        let mut bars: Vec<Candle> = (0..12)
            .map(|i| candle(i, 100.0, 100.6, 99.4, 100.2))
            .collect();
        // Long lower wick: range 1.7, lower wick 1.4
        bars.push(candle(12, 100.0, 100.3, 98.6, 100.2));
        bars.push(candle(13, 100.2, 100.4, 99.0, 99.5));

        let zones = analyze_zones(&bars, &SessionInfo::from_minute_of_day(0), 15);
        let wick = zones.active_wick_zone.expect("active wick");
        assert_eq!(wick.direction, TrendDirection::Bullish);
        assert_eq!(wick.creation_index, 12);
        assert!((wick.wick_ratio - 1.4 / 1.7).abs() < 1e-9);
        assert_eq!(wick.touch_count, 1);

        bars.push(candle(14, 99.5, 99.6, 98.0, 98.2));
        let zones = analyze_zones(&bars, &SessionInfo::from_minute_of_day(0), 15);
        assert!(zones.wick_zones.iter().all(|z| z.creation_index != 12));
    }

    #[test]
    fn test_orb_breakout_and_retest() {
        // 5-minute bars from 13:30 UTC
        let mut bars = vec![
            candle(0, 100.0, 101.0, 99.5, 100.5),
            candle(1, 100.5, 101.2, 100.0, 101.0),
            candle(2, 101.0, 101.1, 99.8, 100.2),
            candle(3, 100.2, 101.8, 100.1, 101.6), // breakout
            candle(4, 101.6, 101.7, 101.0, 101.5), // retest of 101.2
        ];
        retime(&mut bars, BASE_TIME_MS + (13 * 60 + 30) * MINUTE_MS, 5 * MINUTE_MS);

        let session = SessionInfo::from_minute_of_day(13 * 60 + 50);
        assert_eq!(session.name, SessionName::Overlap);

        let orb = detect_orb_box(&bars[..4], &session, 15).expect("orb");
        assert_eq!((orb.high, orb.low), (101.2, 99.5));
        assert_eq!(orb.breakout_direction, Some(TrendDirection::Bullish));
        assert_eq!(orb.breakout_price, Some(101.6));
        assert!(!orb.retest_complete);

        let orb = detect_orb_box(&bars, &session, 15).expect("orb");
        assert!(orb.retest_complete);

        // Still inside the capture window: box forming, no breakout yet
        let orb = detect_orb_box(&bars[..2], &session, 15).expect("orb");
        assert!(!orb.breakout_confirmed);

        let asia = SessionInfo::from_minute_of_day(120);
        assert!(detect_orb_box(&bars, &asia, 15).is_none());
    }

    #[test]
    fn test_mitigated_zones_never_return() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut price: f64 = 100.0;
        let bars: Vec<Candle> = (0..300)
            .map(|i| {
                let open = price;
                // Occasional large bars so gaps actually form
                let scale: f64 = if rng.gen_bool(0.1) { 4.0 } else { 1.0 };
                price += rng.gen_range(-1.0..1.0) * scale;
                let high = open.max(price) + rng.gen_range(0.0..0.6);
                let low = open.min(price) - rng.gen_range(0.0..0.6);
                candle(i, open, high, low, price)
            })
            .collect();

        let mut dead_fvgs: HashSet<usize> = HashSet::new();
        let mut dead_wicks: HashSet<(usize, bool)> = HashSet::new();
        let session = SessionInfo::from_minute_of_day(0);

        for n in 10..=bars.len() {
            let prefix = &bars[..n];

            for z in scan_fvg_zones(prefix) {
                if dead_fvgs.contains(&z.creation_index) {
                    assert!(z.mitigated, "fvg {} revived at {}", z.creation_index, n);
                }
                if z.mitigated {
                    dead_fvgs.insert(z.creation_index);
                }
            }
            for z in scan_wick_zones(prefix) {
                let key = (z.creation_index, z.direction == TrendDirection::Bullish);
                if dead_wicks.contains(&key) {
                    assert!(z.mitigated, "wick {:?} revived at {}", key, n);
                }
                if z.mitigated {
                    dead_wicks.insert(key);
                }
            }

            let zones = analyze_zones(prefix, &session, 15);
            if let Some(active) = zones.active_fvg {
                assert!(!dead_fvgs.contains(&active.creation_index));
            }
            if let Some(active) = zones.active_wick_zone {
                let key = (active.creation_index, active.direction == TrendDirection::Bullish);
                assert!(!dead_wicks.contains(&key));
            }
        }
    }
}
