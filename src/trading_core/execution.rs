//! Entry triggers and signal construction
//!
//! Once a setup clears its gate threshold it still needs a trigger: price
//! action on the lower timeframe (or a confirmed MTF close) showing the zone
//! is holding. The strongest trigger becomes the entry.
//!
//! Risk model:
//! - Stop: beyond the zone by 0.3 ATR(14) of the MTF series
//! - Targets: 1.5R / 2.5R / 4R

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bars::Candle;
use super::indicators::atr;
use super::liquidity::LiquiditySweep;
use super::scoring::GateScore;
use super::setup::{SetupType, SetupZone};
use super::structure::Structure;
use super::zones::{DisplacementCandle, OrbBox};
use crate::types::TrendDirection;

const ATR_PERIOD: usize = 14;
const STOP_BUFFER_ATR: f64 = 0.3;
const RECLAIM_HOLD_BARS: usize = 3;
const TARGET_MULTIPLES: [f64; 3] = [1.5, 2.5, 4.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTriggerKind {
    TapReject,
    ReclaimHold,
    LtfBos,
    LtfChoch,
    CandleClose,
    OrbBreakout,
}

impl std::fmt::Display for EntryTriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntryTriggerKind::TapReject => "tap_reject",
            EntryTriggerKind::ReclaimHold => "reclaim_hold",
            EntryTriggerKind::LtfBos => "ltf_bos",
            EntryTriggerKind::LtfChoch => "ltf_choch",
            EntryTriggerKind::CandleClose => "candle_close",
            EntryTriggerKind::OrbBreakout => "orb_breakout",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryTrigger {
    pub kind: EntryTriggerKind,
    pub price: f64,
    pub time: i64,
    pub confidence: f64,
    /// Fires before the bar closes
    pub intrabar: bool,
}

/// Previous LTF bar wicks into the zone, current bar closes back past the
/// zone midpoint with a directional body.
pub fn detect_tap_reject(
    ltf: &[Candle],
    zone: &SetupZone,
    direction: TrendDirection,
) -> Option<EntryTrigger> {
    if ltf.len() < 3 {
        return None;
    }

    let current = &ltf[ltf.len() - 1];
    let prev = &ltf[ltf.len() - 2];
    let (low, high) = zone.bounds();
    let mid = zone.midpoint();

    let fired = match direction {
        TrendDirection::Bullish => {
            let tapped = prev.low <= high && prev.low >= low;
            tapped && current.close > mid && current.close > prev.close && current.is_bullish()
        }
        TrendDirection::Bearish => {
            let tapped = prev.high >= low && prev.high <= high;
            tapped && current.close < mid && current.close < prev.close && current.is_bearish()
        }
        TrendDirection::Neutral => false,
    };

    fired.then(|| EntryTrigger {
        kind: EntryTriggerKind::TapReject,
        price: current.close,
        time: current.time,
        confidence: 0.7,
        intrabar: true,
    })
}

/// Close crosses `level`, then every following close holds beyond it
/// for `hold_bars` bars.
pub fn detect_reclaim_hold(
    ltf: &[Candle],
    level: f64,
    direction: TrendDirection,
    hold_bars: usize,
) -> Option<EntryTrigger> {
    if ltf.len() < hold_bars + 2 {
        return None;
    }

    let recent = &ltf[ltf.len() - (hold_bars + 2)..];
    let last = &recent[recent.len() - 1];

    let fired = match direction {
        TrendDirection::Bullish => {
            recent[0].close < level
                && recent[1].close > level
                && recent[2..].iter().all(|c| c.close > level)
        }
        TrendDirection::Bearish => {
            recent[0].close > level
                && recent[1].close < level
                && recent[2..].iter().all(|c| c.close < level)
        }
        TrendDirection::Neutral => false,
    };

    fired.then(|| EntryTrigger {
        kind: EntryTriggerKind::ReclaimHold,
        price: last.close,
        time: last.time,
        confidence: 0.65,
        intrabar: false,
    })
}

/// LTF CHOCH in the trade direction, else a BOS
pub fn detect_ltf_structure_break(
    ltf_structure: &Structure,
    direction: TrendDirection,
) -> Option<EntryTrigger> {
    if let Some(choch) = ltf_structure.last_choch.filter(|b| b.direction == direction) {
        return Some(EntryTrigger {
            kind: EntryTriggerKind::LtfChoch,
            price: choch.level,
            time: choch.time,
            confidence: 0.8,
            intrabar: true,
        });
    }

    ltf_structure
        .last_bos
        .filter(|b| b.direction == direction)
        .map(|bos| EntryTrigger {
            kind: EntryTriggerKind::LtfBos,
            price: bos.level,
            time: bos.time,
            confidence: 0.6,
            intrabar: true,
        })
}

/// Previous MTF bar touched the zone and the current bar closes beyond it
pub fn detect_candle_close(
    mtf: &[Candle],
    zone: &SetupZone,
    direction: TrendDirection,
) -> Option<EntryTrigger> {
    if mtf.len() < 2 {
        return None;
    }

    let current = &mtf[mtf.len() - 1];
    let prev = &mtf[mtf.len() - 2];
    let (low, high) = zone.bounds();

    let fired = match direction {
        TrendDirection::Bullish => {
            prev.low <= high && prev.low >= low && current.close > high && current.is_bullish()
        }
        TrendDirection::Bearish => {
            prev.high >= low && prev.high <= high && current.close < low && current.is_bearish()
        }
        TrendDirection::Neutral => false,
    };

    fired.then(|| EntryTrigger {
        kind: EntryTriggerKind::CandleClose,
        price: current.close,
        time: current.time,
        confidence: 0.75,
        intrabar: false,
    })
}

/// The box's own breakout/retest flags. A completed retest is treated as
/// close-confirmed.
pub fn detect_orb_breakout(mtf: &[Candle], orb: &OrbBox) -> Option<EntryTrigger> {
    if !orb.breakout_confirmed || orb.breakout_direction.is_none() {
        return None;
    }
    let current = mtf.last()?;

    Some(EntryTrigger {
        kind: EntryTriggerKind::OrbBreakout,
        price: orb.breakout_price.unwrap_or(current.close),
        time: current.time,
        confidence: if orb.retest_complete { 0.8 } else { 0.65 },
        intrabar: !orb.retest_complete,
    })
}

/// Every trigger that fires for `zone`, in detector order
pub fn collect_triggers(
    mtf: &[Candle],
    ltf: &[Candle],
    zone: &SetupZone,
    direction: TrendDirection,
    ltf_structure: &Structure,
) -> Vec<EntryTrigger> {
    if let SetupZone::Orb(orb) = zone {
        return detect_orb_breakout(mtf, orb).into_iter().collect();
    }

    [
        detect_tap_reject(ltf, zone, direction),
        detect_reclaim_hold(ltf, zone.midpoint(), direction, RECLAIM_HOLD_BARS),
        detect_ltf_structure_break(ltf_structure, direction),
        detect_candle_close(mtf, zone, direction),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Highest-confidence trigger; the earlier detector wins a tie.
/// With `require_candle_close` only close-confirmed triggers count.
pub fn find_best_trigger(
    mtf: &[Candle],
    ltf: &[Candle],
    zone: &SetupZone,
    direction: TrendDirection,
    ltf_structure: &Structure,
    require_candle_close: bool,
) -> Option<EntryTrigger> {
    collect_triggers(mtf, ltf, zone, direction, ltf_structure)
        .into_iter()
        .filter(|t| !require_candle_close || !t.intrabar)
        .fold(None, |best: Option<EntryTrigger>, t| match best {
            Some(b) if b.confidence >= t.confidence => Some(b),
            _ => Some(t),
        })
}

/// Stop beyond the zone by a 0.3 ATR buffer, or one ATR from entry without a
/// zone. A stop that does not sit strictly on the loss side of entry falls
/// back to one ATR. None without a usable ATR or direction.
pub fn calculate_stop_loss(
    entry: f64,
    zone: Option<&SetupZone>,
    direction: TrendDirection,
    atr: f64,
) -> Option<f64> {
    if !(atr.is_finite() && atr > 0.0) || direction == TrendDirection::Neutral {
        return None;
    }

    let sign = direction.sign();
    let fallback = entry - sign * atr;

    let stop = match zone {
        Some(z) => {
            let (low, high) = z.bounds();
            let buffer = atr * STOP_BUFFER_ATR;
            match direction {
                TrendDirection::Bullish => low - buffer,
                _ => high + buffer,
            }
        }
        None => fallback,
    };

    let on_loss_side = (entry - stop) * sign > 0.0;
    Some(if on_loss_side { stop } else { fallback })
}

/// (target1, target2, target3) at 1.5R, 2.5R and 4R from entry
pub fn calculate_targets(entry: f64, stop: f64, direction: TrendDirection) -> (f64, f64, f64) {
    let risk = (entry - stop).abs();
    let sign = direction.sign();
    let [t1, t2, t3] = TARGET_MULTIPLES.map(|m| entry + sign * risk * m);
    (t1, t2, t3)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    /// Stable for the same symbol, time and setup
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: String,
    pub setup_type: SetupType,
    pub direction: TrendDirection,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target1: f64,
    pub target2: f64,
    pub target3: f64,
    pub risk_reward_ratio: f64,
    pub gate_score: GateScore,
    pub trigger: EntryTrigger,
    pub zone: SetupZone,
    pub displacement: Option<DisplacementCandle>,
    pub sweep: Option<LiquiditySweep>,
    pub reasoning: Vec<String>,
    pub timestamp: i64,
    pub risk_per_trade: f64,
}

impl EntrySignal {
    /// Price distance from entry to stop
    pub fn risk(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    /// Units to trade so a stop-out costs `risk_per_trade` of `equity`
    pub fn position_size(&self, equity: f64) -> f64 {
        let risk = self.risk();
        if risk <= 0.0 || equity <= 0.0 {
            return 0.0;
        }
        equity * self.risk_per_trade / risk
    }

    /// Price moved against the position relative to entry
    pub fn is_adverse(&self, price: f64) -> bool {
        (price - self.entry_price) * self.direction.sign() < 0.0
    }
}

/// Everything needed to turn a triggered setup into a signal
pub struct SignalRequest<'a> {
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub time: i64,
    pub setup_type: SetupType,
    pub trigger: EntryTrigger,
    pub zone: SetupZone,
    pub displacement: Option<DisplacementCandle>,
    pub sweep: Option<LiquiditySweep>,
    pub gate_score: GateScore,
    pub risk_per_trade: f64,
}

pub fn signal_id(symbol: &str, time: i64, setup_type: SetupType) -> Uuid {
    let key = format!("{}:{}:{}", symbol, time, setup_type);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

/// Entry at the trigger price with the stop and targets sized off the MTF
/// ATR. None when no valid stop can be placed.
pub fn build_entry_signal(request: SignalRequest<'_>, mtf: &[Candle]) -> Option<EntrySignal> {
    let direction = request.setup_type.direction();
    let entry_price = request.trigger.price;
    if !entry_price.is_finite() {
        return None;
    }

    let atr = atr(mtf, ATR_PERIOD);
    let stop_loss = calculate_stop_loss(entry_price, Some(&request.zone), direction, atr)?;
    let (target1, target2, target3) = calculate_targets(entry_price, stop_loss, direction);

    let risk = (entry_price - stop_loss).abs();
    let reward = (target1 - entry_price).abs();
    let risk_reward_ratio = if risk > 0.0 { reward / risk } else { 0.0 };

    let mut reasoning = vec![
        format!(
            "{} detected with {:.1}/10 gate score",
            request.setup_type, request.gate_score.normalized
        ),
        format!(
            "Trigger: {} at {:.4} ({:.0}% confidence)",
            request.trigger.kind,
            request.trigger.price,
            request.trigger.confidence * 100.0
        ),
    ];
    if let Some(sweep) = &request.sweep {
        reasoning.push(format!(
            "Liquidity sweep: {:?} at {:.4}",
            sweep.level.kind, sweep.sweep_price
        ));
    }
    if let Some(d) = &request.displacement {
        reasoning.push(format!(
            "Displacement: {:.1}x body, {:.1}x range",
            d.body_multiplier, d.range_multiplier
        ));
    }
    reasoning.push(format!("R:R = 1:{:.2}", risk_reward_ratio));

    Some(EntrySignal {
        id: signal_id(request.symbol, request.time, request.setup_type),
        symbol: request.symbol.to_string(),
        timeframe: request.timeframe.to_string(),
        setup_type: request.setup_type,
        direction,
        entry_price,
        stop_loss,
        target1,
        target2,
        target3,
        risk_reward_ratio,
        gate_score: request.gate_score,
        trigger: request.trigger,
        zone: request.zone,
        displacement: request.displacement,
        sweep: request.sweep,
        reasoning,
        timestamp: request.time,
        risk_per_trade: request.risk_per_trade,
    })
}
