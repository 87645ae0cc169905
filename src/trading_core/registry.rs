//! Per-symbol engine registry
//!
//! Each symbol gets its own engine behind its own mutex, so different symbols
//! can be processed in parallel while steps for one symbol stay serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use super::config::EngineConfig;
use super::engine::{EngineInput, EngineOutput, StrategyEngine};
use super::sentiment::SentimentProvider;
use crate::error::{EngineError, EngineResult};

pub struct EngineRegistry {
    config: EngineConfig,
    sentiment: Option<Arc<dyn SentimentProvider>>,
    engines: RwLock<HashMap<String, Arc<Mutex<StrategyEngine>>>>,
}

impl EngineRegistry {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sentiment: None,
            engines: RwLock::new(HashMap::new()),
        })
    }

    /// Provider handed to every engine created from now on
    pub fn with_sentiment(mut self, provider: Arc<dyn SentimentProvider>) -> Self {
        self.sentiment = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine for `symbol`, created on first use. Symbols are case-insensitive.
    pub fn engine(&self, symbol: &str) -> EngineResult<Arc<Mutex<StrategyEngine>>> {
        let key = symbol.to_uppercase();

        {
            let engines = self
                .engines
                .read()
                .map_err(|_| EngineError::LockPoisoned("registry".to_string()))?;
            if let Some(engine) = engines.get(&key) {
                return Ok(Arc::clone(engine));
            }
        }

        let mut engines = self
            .engines
            .write()
            .map_err(|_| EngineError::LockPoisoned("registry".to_string()))?;
        if let Some(engine) = engines.get(&key) {
            return Ok(Arc::clone(engine));
        }

        let mut engine = StrategyEngine::new(self.config.clone())?;
        if let Some(provider) = &self.sentiment {
            engine = engine.with_sentiment(Arc::clone(provider));
        }
        info!("Created engine for {}", key);

        let engine = Arc::new(Mutex::new(engine));
        engines.insert(key, Arc::clone(&engine));
        Ok(engine)
    }

    /// Route one step to the input symbol's engine
    pub fn process(&self, input: &EngineInput) -> EngineResult<EngineOutput> {
        let engine = self.engine(&input.symbol)?;
        let mut engine = engine
            .lock()
            .map_err(|_| EngineError::LockPoisoned(input.symbol.to_uppercase()))?;
        engine.process(input)
    }

    pub fn symbols(&self) -> EngineResult<Vec<String>> {
        let engines = self
            .engines
            .read()
            .map_err(|_| EngineError::LockPoisoned("registry".to_string()))?;
        let mut symbols: Vec<String> = engines.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    /// Drop a symbol's engine and all its state
    pub fn remove(&self, symbol: &str) -> EngineResult<bool> {
        let mut engines = self
            .engines
            .write()
            .map_err(|_| EngineError::LockPoisoned("registry".to_string()))?;
        Ok(engines.remove(&symbol.to_uppercase()).is_some())
    }

    pub fn len(&self) -> usize {
        self.engines.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
