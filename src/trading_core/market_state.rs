//! Market State Detection
//!
//! Summarizes the backdrop for a candidate setup:
//! - Trend bias per timeframe from block-wise higher-high/higher-low counts
//! - Volatility regime from short vs long ATR
//! - Market phase from regression slope relative to average range
//! - Whether volatility just expanded out of a contraction

use super::bars::{highest_high, lowest_low, tail, Candle};
use super::indicators::{atr, avg_body, avg_range, regression_slope};
use crate::types::TrendDirection;
use serde::{Deserialize, Serialize};

const TREND_LOOKBACK: usize = 20;
const TREND_BLOCK: usize = 5;
const ATR_PERIOD: usize = 14;
const AVERAGE_PERIOD: usize = 20;
const REGIME_SHORT: usize = 5;
const REGIME_LONG: usize = 20;
const PHASE_LOOKBACK: usize = 30;
/// Cut-offs (bars back) at which a prior contraction is looked for
const CONTRACTION_BARS_BACK: std::ops::RangeInclusive<usize> = 10..=15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    Expansion,
    Contraction,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    Trending,
    Ranging,
    Transitioning,
}

/// Market backdrop computed once per engine step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub htf_bias: TrendDirection,
    pub mtf_bias: TrendDirection,
    pub ltf_bias: TrendDirection,
    /// Regime of the middle timeframe
    pub volatility_regime: VolatilityRegime,
    pub market_phase: MarketPhase,
    /// ATR(14) of the middle timeframe
    pub atr: f64,
    pub avg_range: f64,
    pub avg_body: f64,
    pub is_expansion_after_contraction: bool,
}

/// Trend from consecutive 5-bar blocks over the last `lookback` bars.
///
/// Each block's max high / min low is compared with the previous block's.
/// Bullish when HH + HL beats LH + LL by more than one, bearish mirrored.
pub fn detect_trend_direction(candles: &[Candle], lookback: usize) -> TrendDirection {
    if lookback < TREND_BLOCK * 2 || candles.len() < lookback {
        return TrendDirection::Neutral;
    }

    let recent = tail(candles, lookback);
    let mut higher_highs = 0;
    let mut higher_lows = 0;
    let mut lower_highs = 0;
    let mut lower_lows = 0;

    for end in (TREND_BLOCK * 2..=recent.len()).step_by(TREND_BLOCK) {
        let current = &recent[end - TREND_BLOCK..end];
        let previous = &recent[end - TREND_BLOCK * 2..end - TREND_BLOCK];

        let (cur_high, prev_high) = (highest_high(current), highest_high(previous));
        let (cur_low, prev_low) = (lowest_low(current), lowest_low(previous));

        if cur_high > prev_high {
            higher_highs += 1;
        }
        if cur_high < prev_high {
            lower_highs += 1;
        }
        if cur_low > prev_low {
            higher_lows += 1;
        }
        if cur_low < prev_low {
            lower_lows += 1;
        }
    }

    let bullish = higher_highs + higher_lows;
    let bearish = lower_highs + lower_lows;

    if bullish > bearish + 1 {
        TrendDirection::Bullish
    } else if bearish > bullish + 1 {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    }
}

/// Ratio of short ATR to long ATR: > 1.3 expansion, < 0.7 contraction
pub fn detect_volatility_regime(candles: &[Candle], short: usize, long: usize) -> VolatilityRegime {
    if candles.len() < long {
        return VolatilityRegime::Normal;
    }

    let short_atr = atr(tail(candles, short + 1), short);
    let long_atr = atr(candles, long);
    if long_atr == 0.0 {
        return VolatilityRegime::Normal;
    }

    let ratio = short_atr / long_atr;
    if ratio > 1.3 {
        VolatilityRegime::Expansion
    } else if ratio < 0.7 {
        VolatilityRegime::Contraction
    } else {
        VolatilityRegime::Normal
    }
}

/// Slope of closes per bar, measured in units of average range
pub fn detect_market_phase(candles: &[Candle], lookback: usize) -> MarketPhase {
    if candles.len() < lookback {
        return MarketPhase::Ranging;
    }

    let recent = tail(candles, lookback);
    let average_range = avg_range(recent, lookback);
    if average_range == 0.0 {
        return MarketPhase::Ranging;
    }

    let closes: Vec<f64> = recent.iter().map(|c| c.close).collect();
    let strength = regression_slope(&closes).abs() / average_range;

    if strength > 0.25 {
        MarketPhase::Trending
    } else if strength < 0.10 {
        MarketPhase::Ranging
    } else {
        MarketPhase::Transitioning
    }
}

/// Expansion now, and contraction at some cut-off 10-15 bars back
pub fn is_expansion_after_contraction(candles: &[Candle]) -> bool {
    if detect_volatility_regime(candles, REGIME_SHORT, REGIME_LONG) != VolatilityRegime::Expansion {
        return false;
    }

    CONTRACTION_BARS_BACK.into_iter().any(|back| {
        candles.len() > back
            && detect_volatility_regime(&candles[..candles.len() - back], REGIME_SHORT, REGIME_LONG)
                == VolatilityRegime::Contraction
    })
}

pub fn analyze_market_state(htf: &[Candle], mtf: &[Candle], ltf: &[Candle]) -> MarketState {
    MarketState {
        htf_bias: detect_trend_direction(htf, TREND_LOOKBACK),
        mtf_bias: detect_trend_direction(mtf, TREND_LOOKBACK),
        ltf_bias: detect_trend_direction(ltf, TREND_LOOKBACK),
        volatility_regime: detect_volatility_regime(mtf, REGIME_SHORT, REGIME_LONG),
        market_phase: detect_market_phase(mtf, PHASE_LOOKBACK),
        atr: atr(mtf, ATR_PERIOD),
        avg_range: avg_range(mtf, AVERAGE_PERIOD),
        avg_body: avg_body(mtf, AVERAGE_PERIOD),
        is_expansion_after_contraction: is_expansion_after_contraction(mtf),
    }
}
