// Library crate - the gate engine and its analyzers

pub mod error;
pub mod types;
pub mod trading_core;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};
pub use types::TrendDirection;
pub use trading_core::{EngineConfig, EngineInput, EngineOutput, EngineRegistry, StrategyEngine};
