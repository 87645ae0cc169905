//! Gate scoring
//!
//! Seven weighted gates, each scored in [0, weight]:
//! 1. HTF bias        - multi-timeframe trend agreement
//! 2. Liquidity sweep - best sweep in the trade direction
//! 3. Displacement    - body/range multiples and close location
//! 4. Zone quality    - FVG, wick or opening-range specific
//! 5. Volatility      - regime, favouring expansion out of contraction
//! 6. Session         - session quality, opening window, lunch lull
//! 7. Proximity       - room before opposing liquidity
//!
//! The total is normalized to a 0-10 scale and compared with the setup
//! kind's threshold.

use serde::{Deserialize, Serialize};

use super::config::{GateWeights, SetupThresholds};
use super::liquidity::Liquidity;
use super::market_state::{MarketPhase, MarketState, VolatilityRegime};
use super::session::SessionInfo;
use super::setup::{CandidateSetup, SetupKind, SetupZone};
use super::zones::DisplacementCandle;
use crate::types::TrendDirection;

/// Blocking levels closer than this fraction of price cost proximity score
const PROXIMITY_BAND: f64 = 0.01;
const PROXIMITY_PENALTY_SCALE: f64 = 0.3;
/// Relative opening-range size that earns full range credit
const ORB_FULL_RANGE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateScore {
    pub htf_bias: f64,
    pub liquidity_sweep: f64,
    pub displacement_quality: f64,
    pub zone_quality: f64,
    pub volatility_regime: f64,
    pub session_context: f64,
    pub proximity_filter: f64,
    pub total: f64,
    pub max_possible: f64,
    /// 10 * total / max_possible
    pub normalized: f64,
}

fn bounded(value: f64, weight: f64) -> f64 {
    let weight = weight.max(0.0);
    if value.is_finite() {
        value.clamp(0.0, weight)
    } else {
        0.0
    }
}

pub fn score_htf_bias(market: &MarketState, direction: TrendDirection, weight: f64) -> f64 {
    if direction == TrendDirection::Neutral {
        return bounded(weight * 0.5, weight);
    }

    let agreement = [
        (market.htf_bias, 0.6),
        (market.mtf_bias, 0.3),
        (market.ltf_bias, 0.1),
    ]
    .iter()
    .filter(|(bias, _)| *bias == direction)
    .map(|(_, share)| share)
    .sum::<f64>();

    bounded(agreement * weight, weight)
}

pub fn score_liquidity_sweep(liquidity: &Liquidity, direction: TrendDirection, weight: f64) -> f64 {
    let Some(sweep) = liquidity.best_sweep(direction) else {
        return 0.0;
    };

    let quality = (sweep.quality / 3.0).min(1.0);
    let major_boost = if sweep.level.kind.is_major() { 0.2 } else { 0.0 };

    bounded((quality + major_boost) * weight, weight)
}

pub fn score_displacement(displacement: Option<&DisplacementCandle>, weight: f64) -> f64 {
    let Some(d) = displacement else {
        return 0.0;
    };

    let body = (d.body_multiplier / 5.0).min(1.0);
    let range = (d.range_multiplier / 2.5).min(1.0);
    let close = match d.direction {
        TrendDirection::Bearish => 1.0 - d.close_location,
        _ => d.close_location,
    };

    bounded((body + range + close) / 3.0 * weight, weight)
}

pub fn score_zone_quality(zone: &SetupZone, weight: f64) -> f64 {
    let score = match zone {
        SetupZone::Fvg(fvg) => {
            let mut s = fvg.displacement_quality * 0.5;
            if fvg.is_first_touch {
                s += 0.3;
            }
            if fvg.touch_count == 0 {
                s += 0.2;
            }
            s
        }
        SetupZone::Wick(wick) => {
            let mut s = wick.wick_ratio * 0.7;
            if wick.touch_count == 0 {
                s += 0.3;
            }
            s
        }
        SetupZone::Orb(orb) => {
            let mut s = 0.0;
            if orb.breakout_confirmed {
                s += 0.5;
            }
            if orb.retest_complete {
                s += 0.3;
            }
            let relative_range = if orb.midpoint > 0.0 {
                orb.range_size / orb.midpoint
            } else {
                0.0
            };
            s + (relative_range / ORB_FULL_RANGE).min(1.0) * 0.2
        }
    };

    bounded(score * weight, weight)
}

pub fn score_volatility_regime(market: &MarketState, weight: f64) -> f64 {
    let mut score = if market.is_expansion_after_contraction {
        1.0
    } else {
        match market.volatility_regime {
            VolatilityRegime::Expansion => 0.7,
            VolatilityRegime::Normal => 0.4,
            VolatilityRegime::Contraction => 0.2,
        }
    };

    match market.market_phase {
        MarketPhase::Trending => score *= 1.1,
        MarketPhase::Ranging => score *= 0.8,
        MarketPhase::Transitioning => {}
    }

    bounded(score * weight, weight)
}

pub fn score_session_context(session: &SessionInfo, kind: SetupKind, weight: f64) -> f64 {
    let mut score = session.name.quality();

    if kind == SetupKind::Orb {
        if session.is_orb_window {
            score *= 1.2;
        } else if session.minutes_since_open <= 60 {
            score *= 0.9;
        } else {
            score *= 0.6;
        }
    }

    if session.is_lunch_dead {
        score *= 0.5;
    }

    bounded(score * weight, weight)
}

/// Full weight unless opposing liquidity sits within 1% of price. Each such
/// level costs (closeness x strength x 0.3) of the weight.
pub fn score_proximity(
    current_price: f64,
    liquidity: &Liquidity,
    direction: TrendDirection,
    weight: f64,
) -> f64 {
    if current_price <= 0.0 {
        return bounded(weight, weight);
    }

    let penalty: f64 = liquidity
        .levels
        .iter()
        .filter(|level| match direction {
            TrendDirection::Bullish => level.kind.is_high() && level.price > current_price,
            TrendDirection::Bearish => !level.kind.is_high() && level.price < current_price,
            TrendDirection::Neutral => false,
        })
        .map(|level| {
            let distance = (level.price - current_price).abs() / current_price;
            (distance, level.strength)
        })
        .filter(|(distance, _)| *distance < PROXIMITY_BAND)
        .map(|(distance, strength)| {
            (PROXIMITY_BAND - distance) / PROXIMITY_BAND * strength * PROXIMITY_PENALTY_SCALE
        })
        .sum();

    bounded(weight * (1.0 - penalty), weight)
}

pub fn calculate_gate_score(
    candidate: &CandidateSetup,
    market: &MarketState,
    liquidity: &Liquidity,
    session: &SessionInfo,
    current_price: f64,
    weights: &GateWeights,
) -> GateScore {
    let direction = candidate.direction();

    let htf_bias = score_htf_bias(market, direction, weights.htf_bias);
    let liquidity_sweep = score_liquidity_sweep(liquidity, direction, weights.liquidity_sweep);
    let displacement_quality =
        score_displacement(candidate.displacement.as_ref(), weights.displacement_quality);
    let zone_quality = score_zone_quality(&candidate.zone, weights.zone_quality);
    let volatility_regime = score_volatility_regime(market, weights.volatility_regime);
    let session_context = score_session_context(session, candidate.kind(), weights.session_context);
    let proximity_filter = score_proximity(current_price, liquidity, direction, weights.proximity_filter);

    let total = htf_bias
        + liquidity_sweep
        + displacement_quality
        + zone_quality
        + volatility_regime
        + session_context
        + proximity_filter;
    let max_possible = weights.max_possible();
    let normalized = if max_possible > 0.0 {
        (total / max_possible * 10.0).clamp(0.0, 10.0)
    } else {
        0.0
    };

    GateScore {
        htf_bias,
        liquidity_sweep,
        displacement_quality,
        zone_quality,
        volatility_regime,
        session_context,
        proximity_filter,
        total,
        max_possible,
        normalized,
    }
}

pub fn meets_threshold(score: &GateScore, kind: SetupKind, thresholds: &SetupThresholds) -> bool {
    score.normalized >= thresholds.for_kind(kind)
}
