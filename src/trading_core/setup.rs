//! Setup types and candidate detection
//!
//! A setup is a kind (ICC, wick fill, ORB) plus a direction, carrying the
//! zone that produced it.

use super::structure::Structure;
use super::zones::{DisplacementCandle, FvgZone, OrbBox, WickZone, Zones};
use crate::types::TrendDirection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupKind {
    /// Institutional candle continuation: first return into a displacement FVG
    Icc,
    WickFill,
    Orb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupType {
    IccLong,
    IccShort,
    WickFillLong,
    WickFillShort,
    OrbLong,
    OrbShort,
}

impl SetupType {
    /// None for a neutral direction
    pub fn new(kind: SetupKind, direction: TrendDirection) -> Option<Self> {
        let long = match direction {
            TrendDirection::Bullish => true,
            TrendDirection::Bearish => false,
            TrendDirection::Neutral => return None,
        };
        Some(match (kind, long) {
            (SetupKind::Icc, true) => SetupType::IccLong,
            (SetupKind::Icc, false) => SetupType::IccShort,
            (SetupKind::WickFill, true) => SetupType::WickFillLong,
            (SetupKind::WickFill, false) => SetupType::WickFillShort,
            (SetupKind::Orb, true) => SetupType::OrbLong,
            (SetupKind::Orb, false) => SetupType::OrbShort,
        })
    }

    pub fn kind(self) -> SetupKind {
        match self {
            SetupType::IccLong | SetupType::IccShort => SetupKind::Icc,
            SetupType::WickFillLong | SetupType::WickFillShort => SetupKind::WickFill,
            SetupType::OrbLong | SetupType::OrbShort => SetupKind::Orb,
        }
    }

    pub fn direction(self) -> TrendDirection {
        match self {
            SetupType::IccLong | SetupType::WickFillLong | SetupType::OrbLong => TrendDirection::Bullish,
            _ => TrendDirection::Bearish,
        }
    }
}

impl std::fmt::Display for SetupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SetupType::IccLong => "ICC_LONG",
            SetupType::IccShort => "ICC_SHORT",
            SetupType::WickFillLong => "WICK_FILL_LONG",
            SetupType::WickFillShort => "WICK_FILL_SHORT",
            SetupType::OrbLong => "ORB_LONG",
            SetupType::OrbShort => "ORB_SHORT",
        };
        write!(f, "{}", name)
    }
}

/// Zone data behind a setup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "zone_type", rename_all = "snake_case")]
pub enum SetupZone {
    Fvg(FvgZone),
    Wick(WickZone),
    Orb(OrbBox),
}

impl SetupZone {
    /// (low, high) of the zone
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            SetupZone::Fvg(z) => (z.low, z.high),
            SetupZone::Wick(z) => (z.zone_low, z.zone_high),
            SetupZone::Orb(b) => (b.low, b.high),
        }
    }

    pub fn midpoint(&self) -> f64 {
        let (low, high) = self.bounds();
        (low + high) / 2.0
    }

    pub fn as_fvg(&self) -> Option<&FvgZone> {
        match self {
            SetupZone::Fvg(z) => Some(z),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSetup {
    pub setup_type: SetupType,
    pub zone: SetupZone,
    pub displacement: Option<DisplacementCandle>,
}

impl CandidateSetup {
    pub fn kind(&self) -> SetupKind {
        self.setup_type.kind()
    }

    pub fn direction(&self) -> TrendDirection {
        self.setup_type.direction()
    }
}

/// Candidate setups in detection order: ICC, wick fill, ORB.
///
/// ICC needs an active first-touch FVG, a displacement candle in the same
/// direction, and a pullback that is slow or at least three bars long.
pub fn detect_candidate_setups(
    zones: &Zones,
    structure: &Structure,
    displacement: Option<&DisplacementCandle>,
) -> Vec<CandidateSetup> {
    let mut setups = Vec::new();

    if let (Some(fvg), Some(disp)) = (zones.active_fvg, displacement) {
        let patient_pullback = structure
            .pullback
            .map(|p| p.is_slow_correction || p.candle_count >= 3)
            .unwrap_or(false);

        if disp.direction == fvg.direction && patient_pullback {
            if let Some(setup_type) = SetupType::new(SetupKind::Icc, fvg.direction) {
                setups.push(CandidateSetup {
                    setup_type,
                    zone: SetupZone::Fvg(fvg),
                    displacement: Some(*disp),
                });
            }
        }
    }

    if let Some(wick) = zones.active_wick_zone {
        if let Some(setup_type) = SetupType::new(SetupKind::WickFill, wick.direction) {
            setups.push(CandidateSetup {
                setup_type,
                zone: SetupZone::Wick(wick),
                displacement: None,
            });
        }
    }

    if let Some(orb) = zones.orb_box {
        if let Some(direction) = orb.breakout_direction.filter(|_| orb.breakout_confirmed) {
            if let Some(setup_type) = SetupType::new(SetupKind::Orb, direction) {
                setups.push(CandidateSetup {
                    setup_type,
                    zone: SetupZone::Orb(orb),
                    displacement: None,
                });
            }
        }
    }

    setups
}
