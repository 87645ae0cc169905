//! Exit monitoring and the loss-streak circuit breaker
//!
//! While a signal is open every step checks four invalidation flags on the
//! MTF series:
//! - candle mismatch: a strong candle against the position
//! - MACD(12,26,9) momentum loss or crossover against the position
//! - FVG breach: close through the gap the trade came from
//! - structure break: close through the latest swing against the position
//!
//! Structure break or FVG breach exits outright; the softer flags exit only
//! when at least two flags agree.

use serde::{Deserialize, Serialize};

use super::bars::Candle;
use super::execution::EntrySignal;
use super::indicators::macd;
use super::zones::FvgZone;
use crate::types::TrendDirection;

const MISMATCH_BODY_RATIO: f64 = 0.6;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const MACD_MIN_CANDLES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    CandleMismatch,
    MacdLoss,
    FvgBreach,
    StructureBreak,
    StaleSignal,
    TargetHit,
    StopHit,
    /// Closed by the caller
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitReason::CandleMismatch => "candle_mismatch",
            ExitReason::MacdLoss => "macd_loss",
            ExitReason::FvgBreach => "fvg_breach",
            ExitReason::StructureBreak => "structure_break",
            ExitReason::StaleSignal => "stale_signal",
            ExitReason::TargetHit => "target_hit",
            ExitReason::StopHit => "stop_hit",
            ExitReason::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSeverity {
    Warning,
    /// Always closes the active signal
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub severity: ExitSeverity,
    pub price: f64,
    pub description: String,
    pub timestamp: i64,
}

impl ExitSignal {
    pub fn new(reason: ExitReason, severity: ExitSeverity, price: f64, description: String, timestamp: i64) -> Self {
        Self {
            reason,
            severity,
            price,
            description,
            timestamp,
        }
    }

    pub fn is_exit(&self) -> bool {
        self.severity == ExitSeverity::Exit
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MismatchState {
    pub candle_mismatch: bool,
    pub macd_momentum_loss: bool,
    pub fvg_breach: bool,
    pub structure_break: bool,
    pub mismatch_count: u32,
    pub should_exit: bool,
}

/// Latest candle closes against the position with a body of at least 60%
/// of its range
pub fn detect_candle_mismatch(candles: &[Candle], direction: TrendDirection) -> bool {
    if candles.len() < 2 {
        return false;
    }
    let current = &candles[candles.len() - 1];

    let against = match direction {
        TrendDirection::Bullish => !current.is_bullish(),
        TrendDirection::Bearish => current.is_bullish(),
        TrendDirection::Neutral => false,
    };
    against && current.body_ratio() >= MISMATCH_BODY_RATIO
}

/// Long: histogram shrinking below zero, or MACD crossing under its signal.
/// Short mirrors.
pub fn detect_macd_momentum_loss(candles: &[Candle], direction: TrendDirection) -> bool {
    if candles.len() < MACD_MIN_CANDLES {
        return false;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let current = macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let previous = macd(&closes[..closes.len() - 1], MACD_FAST, MACD_SLOW, MACD_SIGNAL);

    match direction {
        TrendDirection::Bullish => {
            let fading = current.histogram < previous.histogram && current.histogram < 0.0;
            let crossed = previous.macd_line > previous.signal_line
                && current.macd_line < current.signal_line;
            fading || crossed
        }
        TrendDirection::Bearish => {
            let fading = current.histogram > previous.histogram && current.histogram > 0.0;
            let crossed = previous.macd_line < previous.signal_line
                && current.macd_line > current.signal_line;
            fading || crossed
        }
        TrendDirection::Neutral => false,
    }
}

/// Latest close beyond the far edge of the originating gap
pub fn detect_fvg_breach(candles: &[Candle], fvg: Option<&FvgZone>, direction: TrendDirection) -> bool {
    let (Some(fvg), Some(current)) = (fvg, candles.last()) else {
        return false;
    };

    match (direction, fvg.direction) {
        (TrendDirection::Bullish, TrendDirection::Bullish) => current.close < fvg.low,
        (TrendDirection::Bearish, TrendDirection::Bearish) => current.close > fvg.high,
        _ => false,
    }
}

pub fn detect_structure_break_against(
    candles: &[Candle],
    direction: TrendDirection,
    swing_high: f64,
    swing_low: f64,
) -> bool {
    let Some(current) = candles.last() else {
        return false;
    };

    match direction {
        TrendDirection::Bullish => current.close < swing_low,
        TrendDirection::Bearish => current.close > swing_high,
        TrendDirection::Neutral => false,
    }
}

pub fn analyze_mismatch_state(
    candles: &[Candle],
    direction: TrendDirection,
    fvg: Option<&FvgZone>,
    swing_high: f64,
    swing_low: f64,
) -> MismatchState {
    let candle_mismatch = detect_candle_mismatch(candles, direction);
    let macd_momentum_loss = detect_macd_momentum_loss(candles, direction);
    let fvg_breach = detect_fvg_breach(candles, fvg, direction);
    let structure_break = detect_structure_break_against(candles, direction, swing_high, swing_low);

    let mismatch_count = [candle_mismatch, macd_momentum_loss, fvg_breach, structure_break]
        .iter()
        .filter(|&&flag| flag)
        .count() as u32;

    MismatchState {
        candle_mismatch,
        macd_momentum_loss,
        fvg_breach,
        structure_break,
        mismatch_count,
        should_exit: structure_break || fvg_breach || mismatch_count >= 2,
    }
}

/// Exit signals for an open position at `price`, stamped with `time`
pub fn generate_exit_signals(
    mismatch: &MismatchState,
    signal: &EntrySignal,
    price: f64,
    time: i64,
) -> Vec<ExitSignal> {
    let mut exits = Vec::new();
    let soft_severity = if mismatch.mismatch_count >= 2 {
        ExitSeverity::Exit
    } else {
        ExitSeverity::Warning
    };

    if mismatch.structure_break {
        exits.push(ExitSignal::new(
            ExitReason::StructureBreak,
            ExitSeverity::Exit,
            price,
            "Structure break against position".to_string(),
            time,
        ));
    }

    if mismatch.fvg_breach {
        exits.push(ExitSignal::new(
            ExitReason::FvgBreach,
            ExitSeverity::Exit,
            price,
            "Price closed through the originating FVG".to_string(),
            time,
        ));
    }

    if mismatch.candle_mismatch && !mismatch.structure_break && !mismatch.fvg_breach {
        exits.push(ExitSignal::new(
            ExitReason::CandleMismatch,
            soft_severity,
            price,
            "Candle color mismatch with trade direction".to_string(),
            time,
        ));
    }

    if mismatch.macd_momentum_loss && !mismatch.structure_break {
        exits.push(ExitSignal::new(
            ExitReason::MacdLoss,
            soft_severity,
            price,
            "MACD momentum fading against position".to_string(),
            time,
        ));
    }

    let sign = signal.direction.sign();
    if (price - signal.stop_loss) * sign <= 0.0 {
        exits.push(ExitSignal::new(
            ExitReason::StopHit,
            ExitSeverity::Exit,
            price,
            format!("Stop loss hit at {:.4}", signal.stop_loss),
            time,
        ));
    }

    if (price - signal.target1) * sign >= 0.0 {
        exits.push(ExitSignal::new(
            ExitReason::TargetHit,
            ExitSeverity::Exit,
            price,
            format!("Target 1 reached at {:.4}", signal.target1),
            time,
        ));
    }

    exits
}

/// Exit at entry once the signal has been open `stale_bars` engine steps
pub fn check_stale_signal(
    signal: &EntrySignal,
    current_bar: u64,
    entry_bar: u64,
    stale_bars: u64,
    time: i64,
) -> Option<ExitSignal> {
    let bars_open = current_bar.saturating_sub(entry_bar);
    (bars_open >= stale_bars).then(|| {
        ExitSignal::new(
            ExitReason::StaleSignal,
            ExitSeverity::Exit,
            signal.entry_price,
            format!("Signal stale after {} bars without progress", stale_bars),
            time,
        )
    })
}

/// The exit that closes the position: stop first, then target, then the
/// first other exit-severity signal
pub fn closing_exit(exits: &[ExitSignal]) -> Option<&ExitSignal> {
    let exit_only = || exits.iter().filter(|e| e.is_exit());
    exit_only()
        .find(|e| e.reason == ExitReason::StopHit)
        .or_else(|| exit_only().find(|e| e.reason == ExitReason::TargetHit))
        .or_else(|| exit_only().next())
}

/// Stop hits lose, target hits win, anything else loses only when closed
/// adverse to entry
pub fn is_loss(signal: &EntrySignal, exit: &ExitSignal) -> bool {
    match exit.reason {
        ExitReason::StopHit => true,
        ExitReason::TargetHit => false,
        _ => signal.is_adverse(exit.price),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossStreakState {
    pub current_streak: u32,
    pub max_streak: u32,
    pub is_locked: bool,
    /// Epoch-ms at which the lock lifts
    pub lock_until: Option<i64>,
}

impl LossStreakState {
    pub fn new(max_streak: u32) -> Self {
        Self {
            current_streak: 0,
            max_streak,
            is_locked: false,
            lock_until: None,
        }
    }

    /// Count a closed signal. Returns true when this loss engaged the lock.
    pub fn record(&mut self, is_loss: bool, now: i64, lock_ms: i64) -> bool {
        if !is_loss {
            *self = Self::new(self.max_streak);
            return false;
        }

        self.current_streak += 1;
        if self.current_streak >= self.max_streak && !self.is_locked {
            self.is_locked = true;
            self.lock_until = Some(now + lock_ms);
            return true;
        }
        false
    }

    pub fn is_locked_at(&self, now: i64) -> bool {
        match (self.is_locked, self.lock_until) {
            (false, _) => false,
            (true, Some(until)) => now < until,
            (true, None) => true,
        }
    }

    /// Lift an expired lock and reset the streak. Returns true when a lock
    /// was lifted.
    pub fn refresh(&mut self, now: i64) -> bool {
        if self.is_locked && !self.is_locked_at(now) {
            *self = Self::new(self.max_streak);
            return true;
        }
        false
    }
}
