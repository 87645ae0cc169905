//! Error types for the signal engine

use thiserror::Error;

/// Errors raised when the engine is handed input it refuses to analyze.
///
/// Insufficient history is not an error: the engine degrades to an empty
/// result instead. Only malformed data and bad configuration are rejected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid candle in {timeframe} at index {index}: {reason}")]
    InvalidCandle {
        timeframe: String,
        index: usize,
        reason: String,
    },

    #[error("candle times in {timeframe} are not strictly increasing at index {index} ({previous} -> {current})")]
    NonMonotonicTime {
        timeframe: String,
        index: usize,
        previous: i64,
        current: i64,
    },

    #[error("invalid price for {symbol}: {value}")]
    InvalidPrice { symbol: String, value: f64 },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("engine lock poisoned for {0}")]
    LockPoisoned(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
