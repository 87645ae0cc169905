//! Configuration for the signal engine

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::setup::SetupKind;
use crate::error::{EngineError, EngineResult};

/// Weight of each gate in the composite score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateWeights {
    /// Agreement of HTF/MTF/LTF trend with the trade direction
    pub htf_bias: f64,
    /// Quality of the best liquidity sweep in the trade direction
    pub liquidity_sweep: f64,
    /// Strength of the displacement candle behind the setup
    pub displacement_quality: f64,
    /// Setup-specific zone quality (FVG, wick or opening range)
    pub zone_quality: f64,
    pub volatility_regime: f64,
    pub session_context: f64,
    /// Room to run before the nearest opposing liquidity
    pub proximity_filter: f64,
}

impl Default for GateWeights {
    fn default() -> Self {
        Self {
            htf_bias: 2.0,
            liquidity_sweep: 2.0,
            displacement_quality: 2.0,
            zone_quality: 1.5,
            volatility_regime: 1.0,
            session_context: 1.0,
            proximity_filter: 0.5,
        }
    }
}

impl GateWeights {
    pub fn max_possible(&self) -> f64 {
        self.as_array().iter().sum()
    }

    fn as_array(&self) -> [f64; 7] {
        [
            self.htf_bias,
            self.liquidity_sweep,
            self.displacement_quality,
            self.zone_quality,
            self.volatility_regime,
            self.session_context,
            self.proximity_filter,
        ]
    }
}

/// Minimum normalized gate score (0-10) per setup kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupThresholds {
    pub icc: f64,
    pub wick_fill: f64,
    pub orb: f64,
}

impl Default for SetupThresholds {
    fn default() -> Self {
        Self {
            icc: 6.0,
            wick_fill: 5.0,
            orb: 5.0,
        }
    }
}

impl SetupThresholds {
    pub fn for_kind(&self, kind: SetupKind) -> f64 {
        match kind {
            SetupKind::Icc => self.icc,
            SetupKind::WickFill => self.wick_fill,
            SetupKind::Orb => self.orb,
        }
    }
}

/// Engine configuration. Every field has a default, so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeframe label of the higher timeframe series (bias only)
    pub htf_timeframe: String,
    /// Timeframe label of the series all setups are detected on
    pub mtf_timeframe: String,
    /// Timeframe label of the trigger series
    pub ltf_timeframe: String,

    /// Only accept triggers confirmed by a candle close
    pub require_candle_close: bool,

    pub thresholds: SetupThresholds,
    pub gate_weights: GateWeights,

    /// Fraction of equity risked per signal, carried on the signal for sizing
    pub risk_per_trade: f64,

    /// Consecutive losing signals before new setups are locked out
    pub max_loss_streak: u32,
    /// Engine steps an open signal may go without a stop/target hit
    pub stale_signal_bars: u64,
    pub lock_duration_minutes: i64,

    /// Length of the opening range capture window after a session open
    pub orb_window_minutes: u32,

    /// Per-step log lines kept in the debug snapshot
    pub max_log_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            htf_timeframe: "1h".to_string(),
            mtf_timeframe: "15m".to_string(),
            ltf_timeframe: "1m".to_string(),
            require_candle_close: false,
            thresholds: SetupThresholds::default(),
            gate_weights: GateWeights::default(),
            risk_per_trade: 0.01,
            max_loss_streak: 3,
            stale_signal_bars: 10,
            lock_duration_minutes: 30,
            orb_window_minutes: 15,
            max_log_lines: 100,
        }
    }
}

impl EngineConfig {
    /// Higher thresholds, close-confirmed triggers only, quicker lockout
    pub fn conservative() -> Self {
        Self {
            require_candle_close: true,
            thresholds: SetupThresholds {
                icc: 7.0,
                wick_fill: 6.0,
                orb: 6.0,
            },
            max_loss_streak: 2,
            lock_duration_minutes: 60,
            ..Default::default()
        }
    }

    /// Lower thresholds and more patience for open signals
    pub fn aggressive() -> Self {
        Self {
            thresholds: SetupThresholds {
                icc: 5.0,
                wick_fill: 4.0,
                orb: 4.0,
            },
            stale_signal_bars: 15,
            lock_duration_minutes: 15,
            ..Default::default()
        }
    }

    pub fn lock_duration_ms(&self) -> i64 {
        self.lock_duration_minutes * 60_000
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        for (label, value) in [
            ("htf_timeframe", &self.htf_timeframe),
            ("mtf_timeframe", &self.mtf_timeframe),
            ("ltf_timeframe", &self.ltf_timeframe),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("{} must not be empty", label));
            }
        }

        if self
            .gate_weights
            .as_array()
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return invalid("gate weights must be finite and non-negative".to_string());
        }

        for (label, value) in [
            ("icc", self.thresholds.icc),
            ("wick_fill", self.thresholds.wick_fill),
            ("orb", self.thresholds.orb),
        ] {
            if !(0.0..=10.0).contains(&value) {
                return invalid(format!("{} threshold {} outside 0-10", label, value));
            }
        }

        if !(self.risk_per_trade > 0.0 && self.risk_per_trade <= 1.0) {
            return invalid(format!("risk_per_trade {} outside (0, 1]", self.risk_per_trade));
        }
        if self.max_loss_streak == 0 {
            return invalid("max_loss_streak must be at least 1".to_string());
        }
        if self.stale_signal_bars == 0 {
            return invalid("stale_signal_bars must be at least 1".to_string());
        }
        if self.lock_duration_minutes < 0 {
            return invalid("lock_duration_minutes must not be negative".to_string());
        }
        if self.orb_window_minutes == 0 {
            return invalid("orb_window_minutes must be at least 1".to_string());
        }

        Ok(())
    }

    /// Parse and validate a JSON config; missing fields take defaults
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("Invalid config {}", path.display()))
    }
}
