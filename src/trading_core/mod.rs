//! Trading Core - the signal engine and its analyzers
//!
//! Each step runs the analyzers over the caller's candle windows:
//! - Market state (bias, volatility regime, phase)
//! - Structure (swings, BOS/CHOCH, pullbacks)
//! - Liquidity levels and sweeps
//! - Zones (displacement, FVG, wick zones, ORB box)
//! - Order flow (CVD, imbalances, absorption) and order book imbalance
//!
//! Candidate setups built from those are gate-scored, triggered on the LTF
//! and turned into entry signals, or monitored for exits while one is open.

pub mod bars;
pub mod indicators;
pub mod session;
pub mod market_state;
pub mod structure;
pub mod liquidity;
pub mod zones;
pub mod orderflow;
pub mod setup;
pub mod scoring;
pub mod execution;
pub mod exits;
pub mod sentiment;
pub mod config;
pub mod engine;
pub mod registry;

#[cfg(test)]
pub mod fixtures;

// Re-export commonly used types
pub use bars::Candle;
pub use session::{SessionInfo, SessionName};
pub use market_state::{MarketPhase, MarketState, VolatilityRegime};
pub use structure::{Structure, StructureBreak, SwingPoint};
pub use liquidity::{Liquidity, LiquidityLevel, LiquiditySweep};
pub use zones::{DisplacementCandle, FvgZone, OrbBox, WickZone, Zones};
pub use orderflow::{ObiResult, OrderBookLevel, OrderBookSnapshot, OrderFlow, Pressure, PressureMeter};
pub use setup::{CandidateSetup, SetupKind, SetupType, SetupZone};
pub use scoring::GateScore;
pub use execution::{EntrySignal, EntryTrigger, EntryTriggerKind};
pub use exits::{ExitReason, ExitSeverity, ExitSignal, LossStreakState, MismatchState};
pub use sentiment::{KeywordSentiment, SentimentProvider, SentimentVerdict};
pub use config::{EngineConfig, GateWeights, SetupThresholds};
pub use engine::{DebugState, EngineInput, EngineOutput, StrategyEngine, MIN_MTF_CANDLES};
pub use registry::EngineRegistry;
