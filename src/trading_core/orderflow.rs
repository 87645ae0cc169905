//! Order flow read from candles and order book snapshots
//!
//! Candle feeds carry no aggressor side, so each bar's volume is split by
//! where it closed in its range. From that split:
//! - CVD and its trend
//! - Stacked price-bucket imbalances (momentum surges)
//! - Absorption after a liquidity sweep
//! - Delta flips
//! - A 0-100 pressure meter
//!
//! Order book imbalance (OBI) works on the top levels of a depth snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bars::{tail, Candle};
use crate::types::TrendDirection;

const CVD_TREND_LOOKBACK: usize = 10;
/// CVD change, as a percentage of its average, needed to call a trend
const CVD_TREND_PCT: f64 = 15.0;
const FLAT_PRICE_LOOKBACK: usize = 10;
const FLAT_PRICE_PCT: f64 = 0.5;
const ACCUMULATION_MOMENTUM: f64 = 20.0;
const PRESSURE_MOMENTUM: f64 = 10.0;

const IMBALANCE_WINDOW: usize = 30;
const IMBALANCE_BUCKETS: usize = 15;
pub const IMBALANCE_RATIO: f64 = 3.0;
/// Consecutive imbalanced buckets that make a surge
const SURGE_STACK: usize = 3;
/// Buy/sell ratio reported when only one side traded
const ONE_SIDED_RATIO: f64 = 10.0;

const ABSORPTION_BARS: usize = 5;
const ABSORPTION_BASELINE: usize = 20;
const ABSORPTION_VOLUME_MULT: f64 = 1.5;
const ABSORPTION_RANGE_PCT: f64 = 0.3;

const DELTA_FLIP_LOOKBACK: usize = 5;
const RECENT_FLOW_BARS: usize = 5;
const MIN_PRESSURE_BARS: usize = 10;

pub const OBI_TOP_LEVELS: usize = 5;
/// |OBI| above this is strong and passes the gate
pub const OBI_GATE: f64 = 0.60;
const OBI_MODERATE: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvdTrend {
    Rising,
    Falling,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    Buy,
    Sell,
    Neutral,
    Absorption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterColor {
    Green,
    Red,
    Yellow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    Accumulation,
    Distribution,
    None,
}

/// Estimated aggressor split of one or more bars
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSplit {
    pub buy: f64,
    pub sell: f64,
}

impl VolumeSplit {
    /// Volume x close location goes to buyers, the rest to sellers. Zero
    /// range or zero volume bars split evenly.
    pub fn estimate(candle: &Candle) -> Self {
        Self {
            buy: candle.volume * candle.close_location(),
            sell: candle.volume * (1.0 - candle.close_location()),
        }
    }

    pub fn sum(candles: &[Candle]) -> Self {
        candles.iter().map(Self::estimate).fold(Self::default(), |acc, s| Self {
            buy: acc.buy + s.buy,
            sell: acc.sell + s.sell,
        })
    }

    pub fn delta(&self) -> f64 {
        self.buy - self.sell
    }

    pub fn ratio(&self) -> f64 {
        if self.sell > 0.0 {
            self.buy / self.sell
        } else if self.buy > 0.0 {
            ONE_SIDED_RATIO
        } else {
            1.0
        }
    }
}

/// Aggregated flow at one close-price bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeLevel {
    /// Bucket midpoint
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Imbalance {
    pub has_momentum_surge: bool,
    /// Longest run of same-side imbalanced buckets
    pub consecutive_imbalances: usize,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaFlip {
    pub direction: TrendDirection,
    /// Current delta over the prior delta, capped at 2
    pub strength: f64,
}

impl DeltaFlip {
    /// Flow has turned toward `direction`
    pub fn confirms(&self, direction: TrendDirection) -> bool {
        direction != TrendDirection::Neutral && self.direction == direction
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureMeter {
    pub pressure: Pressure,
    /// 0 = all sellers, 50 = balanced, 100 = all buyers
    pub score: f64,
    pub label: String,
    pub color: MeterColor,
    pub cvd: f64,
    pub delta: f64,
    pub absorption_active: bool,
    pub momentum_surge: bool,
}

/// Order flow snapshot for one candle window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFlow {
    pub cvd: f64,
    pub cvd_trend: CvdTrend,
    pub cvd_momentum: f64,
    /// Recent 5 bars
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub delta: f64,
    pub delta_percent: f64,
    pub imbalance_ratio: f64,
    pub consecutive_imbalances: usize,
    pub has_momentum_surge: bool,
    pub absorption_detected: bool,
    pub delta_flip: Option<DeltaFlip>,
    pub pressure: Pressure,
    pub pressure_score: f64,
}

/// Running cumulative delta, one value per candle
pub fn calculate_cvd(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .scan(0.0, |cvd, c| {
            *cvd += VolumeSplit::estimate(c).delta();
            Some(*cvd)
        })
        .collect()
}

/// Trend of the last `lookback` CVD values. Momentum is the change over the
/// window as a percentage of the window's mean magnitude.
pub fn detect_cvd_trend(cvd: &[f64], lookback: usize) -> (CvdTrend, f64) {
    if lookback == 0 || cvd.len() < lookback {
        return (CvdTrend::Flat, 0.0);
    }

    let recent = &cvd[cvd.len() - lookback..];
    let change = recent[recent.len() - 1] - recent[0];
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let momentum = if mean != 0.0 {
        change / mean.abs() * 100.0
    } else {
        0.0
    };

    let trend = if momentum > CVD_TREND_PCT {
        CvdTrend::Rising
    } else if momentum < -CVD_TREND_PCT {
        CvdTrend::Falling
    } else {
        CvdTrend::Flat
    };
    (trend, momentum)
}

/// Close moved less than `threshold_pct` of the average close over the window
pub fn is_price_flat(candles: &[Candle], lookback: usize, threshold_pct: f64) -> bool {
    if lookback == 0 || candles.len() < lookback {
        return false;
    }

    let recent = tail(candles, lookback);
    let mean = recent.iter().map(|c| c.close).sum::<f64>() / recent.len() as f64;
    if mean <= 0.0 {
        return false;
    }
    let change = (recent[recent.len() - 1].close - recent[0].close).abs();
    change / mean * 100.0 < threshold_pct
}

/// Flat price while CVD trends hard: buyers or sellers are building quietly
pub fn detect_accumulation_distribution(candles: &[Candle]) -> (FlowPhase, f64) {
    let cvd = calculate_cvd(candles);
    let (trend, momentum) = detect_cvd_trend(&cvd, CVD_TREND_LOOKBACK);
    if !is_price_flat(candles, FLAT_PRICE_LOOKBACK, FLAT_PRICE_PCT) {
        return (FlowPhase::None, 0.0);
    }

    match trend {
        CvdTrend::Rising if momentum > ACCUMULATION_MOMENTUM => {
            (FlowPhase::Accumulation, (momentum / 50.0).min(1.0))
        }
        CvdTrend::Falling if momentum < -ACCUMULATION_MOMENTUM => {
            (FlowPhase::Distribution, (momentum.abs() / 50.0).min(1.0))
        }
        _ => (FlowPhase::None, 0.0),
    }
}

/// Bucket closes into `buckets` equal slices of the close range. Only
/// occupied buckets are returned, highest price first.
pub fn calculate_volume_levels(candles: &[Candle], buckets: usize) -> Vec<VolumeLevel> {
    if candles.is_empty() || buckets == 0 {
        return Vec::new();
    }

    let min = candles.iter().map(|c| c.close).fold(f64::MAX, f64::min);
    let max = candles.iter().map(|c| c.close).fold(f64::MIN, f64::max);
    let size = if max > min {
        (max - min) / buckets as f64
    } else {
        1.0
    };

    let mut split: BTreeMap<usize, VolumeSplit> = BTreeMap::new();
    for c in candles {
        // The top close would land one past the last bucket
        let bucket = (((c.close - min) / size).floor() as usize).min(buckets - 1);
        let s = VolumeSplit::estimate(c);
        let entry = split.entry(bucket).or_default();
        entry.buy += s.buy;
        entry.sell += s.sell;
    }

    split
        .into_iter()
        .rev()
        .map(|(bucket, s)| VolumeLevel {
            price: min + bucket as f64 * size + size / 2.0,
            buy_volume: s.buy,
            sell_volume: s.sell,
            ratio: s.ratio(),
        })
        .collect()
}

/// Stacked imbalances over the last 30 bars. A level is buy-imbalanced at
/// ratio >= `threshold` and sell-imbalanced at ratio <= 1/`threshold`.
pub fn detect_imbalance(candles: &[Candle], threshold: f64) -> Imbalance {
    let levels = calculate_volume_levels(tail(candles, IMBALANCE_WINDOW), IMBALANCE_BUCKETS);

    let (mut buy_run, mut sell_run) = (0usize, 0usize);
    let (mut max_buy, mut max_sell) = (0usize, 0usize);
    for level in &levels {
        if level.ratio >= threshold {
            buy_run += 1;
            sell_run = 0;
            max_buy = max_buy.max(buy_run);
        } else if level.ratio <= 1.0 / threshold {
            sell_run += 1;
            buy_run = 0;
            max_sell = max_sell.max(sell_run);
        } else {
            buy_run = 0;
            sell_run = 0;
        }
    }

    let buy_surge = max_buy >= SURGE_STACK;
    let sell_surge = max_sell >= SURGE_STACK;
    let direction = if buy_surge {
        TrendDirection::Bullish
    } else if sell_surge {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    };

    Imbalance {
        has_momentum_surge: buy_surge || sell_surge,
        consecutive_imbalances: max_buy.max(max_sell),
        direction,
    }
}

/// Heavy volume that fails to move price, right after a sweep
pub fn detect_absorption(candles: &[Candle], sweep_occurred: bool) -> bool {
    if !sweep_occurred || candles.len() < ABSORPTION_BARS {
        return false;
    }

    let baseline = tail(candles, ABSORPTION_BASELINE);
    let baseline_volume = baseline.iter().map(|c| c.volume).sum::<f64>() / baseline.len() as f64;

    let recent = tail(candles, ABSORPTION_BARS);
    let recent_volume = recent.iter().map(|c| c.volume).sum::<f64>() / recent.len() as f64;
    let high_volume = recent_volume > baseline_volume * ABSORPTION_VOLUME_MULT;

    let max = recent.iter().map(|c| c.close).fold(f64::MIN, f64::max);
    let min = recent.iter().map(|c| c.close).fold(f64::MAX, f64::min);
    let mean = recent.iter().map(|c| c.close).sum::<f64>() / recent.len() as f64;
    let low_volatility = mean > 0.0 && (max - min) / mean * 100.0 < ABSORPTION_RANGE_PCT;

    high_volume && low_volatility
}

/// Net delta of the last 2 bars against the `lookback` bars before them
pub fn detect_delta_flip(candles: &[Candle], lookback: usize) -> Option<DeltaFlip> {
    if candles.len() < lookback + 2 {
        return None;
    }

    let window = tail(candles, lookback + 2);
    let previous = VolumeSplit::sum(&window[..lookback]).delta();
    let current = VolumeSplit::sum(&window[lookback..]).delta();

    if previous < 0.0 && current > 0.0 {
        Some(DeltaFlip {
            direction: TrendDirection::Bullish,
            strength: (current / previous.abs()).min(2.0),
        })
    } else if previous > 0.0 && current < 0.0 {
        Some(DeltaFlip {
            direction: TrendDirection::Bearish,
            strength: (current.abs() / previous).min(2.0),
        })
    } else {
        None
    }
}

/// First matching read wins: absorption, accumulation/distribution, a
/// momentum surge, then a CVD trend. Anything else is neutral at 50.
pub fn calculate_pressure(candles: &[Candle], sweep_occurred: bool) -> PressureMeter {
    if candles.len() < MIN_PRESSURE_BARS {
        return PressureMeter {
            pressure: Pressure::Neutral,
            score: 50.0,
            label: "Insufficient Data".to_string(),
            color: MeterColor::Yellow,
            cvd: 0.0,
            delta: 0.0,
            absorption_active: false,
            momentum_surge: false,
        };
    }

    let cvd = calculate_cvd(candles);
    let (trend, momentum) = detect_cvd_trend(&cvd, CVD_TREND_LOOKBACK);
    let delta = VolumeSplit::sum(tail(candles, RECENT_FLOW_BARS)).delta();
    let imbalance = detect_imbalance(candles, IMBALANCE_RATIO);
    let absorption = detect_absorption(candles, sweep_occurred);
    let (phase, phase_strength) = detect_accumulation_distribution(candles);

    let (pressure, score, label) = if absorption {
        (Pressure::Absorption, 50.0, "Institutional Absorption")
    } else if phase == FlowPhase::Accumulation {
        (Pressure::Buy, 70.0 + phase_strength * 30.0, "Accumulation Detected")
    } else if phase == FlowPhase::Distribution {
        (Pressure::Sell, 30.0 - phase_strength * 30.0, "Distribution Detected")
    } else if imbalance.has_momentum_surge {
        let stack = imbalance.consecutive_imbalances as f64 * 5.0;
        if imbalance.direction == TrendDirection::Bullish {
            (Pressure::Buy, 75.0 + stack, "Momentum Surge (Buy)")
        } else {
            (Pressure::Sell, 25.0 - stack, "Momentum Surge (Sell)")
        }
    } else if trend == CvdTrend::Rising && momentum > PRESSURE_MOMENTUM {
        (Pressure::Buy, 60.0 + (momentum / 2.0).min(20.0), "Buy Pressure Rising")
    } else if trend == CvdTrend::Falling && momentum < -PRESSURE_MOMENTUM {
        (Pressure::Sell, 40.0 - (momentum.abs() / 2.0).min(20.0), "Sell Pressure Rising")
    } else {
        (Pressure::Neutral, 50.0, "Neutral")
    };

    let color = match pressure {
        Pressure::Buy => MeterColor::Green,
        Pressure::Sell => MeterColor::Red,
        Pressure::Neutral | Pressure::Absorption => MeterColor::Yellow,
    };

    PressureMeter {
        pressure,
        score: score.clamp(0.0, 100.0),
        label: label.to_string(),
        color,
        cvd: cvd.last().copied().unwrap_or(0.0),
        delta,
        absorption_active: absorption,
        momentum_surge: imbalance.has_momentum_surge,
    }
}

/// Full order flow read over `candles`; `sweep_occurred` enables absorption
pub fn analyze_order_flow(candles: &[Candle], sweep_occurred: bool) -> OrderFlow {
    let cvd = calculate_cvd(candles);
    let (cvd_trend, cvd_momentum) = detect_cvd_trend(&cvd, CVD_TREND_LOOKBACK);

    let recent = VolumeSplit::sum(tail(candles, RECENT_FLOW_BARS));
    let total = recent.buy + recent.sell;
    let delta_percent = if total > 0.0 {
        recent.delta() / total * 100.0
    } else {
        0.0
    };

    let imbalance = detect_imbalance(candles, IMBALANCE_RATIO);
    let meter = calculate_pressure(candles, sweep_occurred);

    OrderFlow {
        cvd: cvd.last().copied().unwrap_or(0.0),
        cvd_trend,
        cvd_momentum,
        buy_volume: recent.buy,
        sell_volume: recent.sell,
        delta: recent.delta(),
        delta_percent,
        imbalance_ratio: recent.ratio(),
        consecutive_imbalances: imbalance.consecutive_imbalances,
        has_momentum_surge: imbalance.has_momentum_surge,
        absorption_detected: detect_absorption(candles, sweep_occurred),
        delta_flip: detect_delta_flip(candles, DELTA_FLIP_LOOKBACK),
        pressure: meter.pressure,
        pressure_score: meter.score,
    }
}

// ============================================================================
// Order book imbalance
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
    #[serde(default)]
    pub orders: Option<u32>,
}

/// Depth snapshot, best level first on each side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub timestamp: i64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObiStrength {
    Strong,
    Moderate,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObiResult {
    /// (bid - ask) / (bid + ask) over the top levels, rounded to 3 places
    pub obi: f64,
    pub pressure: TrendDirection,
    pub strength: ObiStrength,
    pub total_bid_qty: f64,
    pub total_ask_qty: f64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    /// False for an empty book
    pub is_valid: bool,
    pub threshold: f64,
    pub passed_gate: bool,
}

pub fn calculate_obi(snapshot: &OrderBookSnapshot, top_levels: usize) -> ObiResult {
    let bids = &snapshot.bids[..snapshot.bids.len().min(top_levels)];
    let asks = &snapshot.asks[..snapshot.asks.len().min(top_levels)];
    let bid_qty: f64 = bids.iter().map(|l| l.size).sum();
    let ask_qty: f64 = asks.iter().map(|l| l.size).sum();
    let total = bid_qty + ask_qty;

    if total <= 0.0 {
        return ObiResult {
            obi: 0.0,
            pressure: TrendDirection::Neutral,
            strength: ObiStrength::Weak,
            total_bid_qty: 0.0,
            total_ask_qty: 0.0,
            bid_levels: 0,
            ask_levels: 0,
            is_valid: false,
            threshold: OBI_GATE,
            passed_gate: false,
        };
    }

    let obi = (bid_qty - ask_qty) / total;
    let (pressure, strength) = if obi > OBI_GATE {
        (TrendDirection::Bullish, ObiStrength::Strong)
    } else if obi > OBI_MODERATE {
        (TrendDirection::Bullish, ObiStrength::Moderate)
    } else if obi < -OBI_GATE {
        (TrendDirection::Bearish, ObiStrength::Strong)
    } else if obi < -OBI_MODERATE {
        (TrendDirection::Bearish, ObiStrength::Moderate)
    } else {
        (TrendDirection::Neutral, ObiStrength::Weak)
    };

    ObiResult {
        obi: (obi * 1000.0).round() / 1000.0,
        pressure,
        strength,
        total_bid_qty: bid_qty,
        total_ask_qty: ask_qty,
        bid_levels: bids.len(),
        ask_levels: asks.len(),
        is_valid: true,
        threshold: OBI_GATE,
        passed_gate: strength == ObiStrength::Strong,
    }
}

pub fn obi_pressure_label(obi: f64) -> &'static str {
    match obi {
        x if x > 0.80 => "EXTREME BUY PRESSURE - Whales stacking bids",
        x if x > 0.60 => "STRONG BUY PRESSURE - Green light for longs",
        x if x > 0.30 => "MODERATE BUY PRESSURE - Accumulation zone",
        x if x > 0.10 => "SLIGHT BUY PRESSURE - Minor bid advantage",
        x if x < -0.80 => "EXTREME SELL PRESSURE - Whales stacking asks",
        x if x < -0.60 => "STRONG SELL PRESSURE - Green light for shorts",
        x if x < -0.30 => "MODERATE SELL PRESSURE - Distribution zone",
        x if x < -0.10 => "SLIGHT SELL PRESSURE - Minor ask advantage",
        _ => "NEUTRAL - Balanced order book",
    }
}

pub fn obi_color(obi: f64) -> MeterColor {
    if obi > OBI_GATE {
        MeterColor::Green
    } else if obi < -OBI_GATE {
        MeterColor::Red
    } else {
        MeterColor::Yellow
    }
}
