//! Strategy engine: one `process()` step per symbol per bar
//!
//! States:
//! - IDLE: no open signal, looking for setups
//! - ACTIVE: one signal open, only the exit monitor runs
//! - LOCKED: loss streak hit, setups ignored until the lock lifts
//!
//! The engine is synchronous and does no I/O. Time only moves through the
//! caller-supplied input, so replaying the same inputs from the same state
//! yields identical output.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bars::{validate_series, Candle};
use super::config::EngineConfig;
use super::execution::{build_entry_signal, find_best_trigger, EntrySignal, EntryTrigger, SignalRequest};
use super::exits::{
    analyze_mismatch_state, check_stale_signal, closing_exit, generate_exit_signals, is_loss,
    ExitReason, ExitSeverity, ExitSignal, LossStreakState, MismatchState,
};
use super::liquidity::{analyze_liquidity, Liquidity};
use super::market_state::{analyze_market_state, MarketState};
use super::orderflow::{
    analyze_order_flow, calculate_obi, obi_pressure_label, ObiResult, OrderBookSnapshot, OrderFlow,
    OBI_TOP_LEVELS,
};
use super::scoring::{calculate_gate_score, meets_threshold, GateScore};
use super::sentiment::{SentimentProvider, SentimentVerdict};
use super::session::{utc_datetime, SessionInfo};
use super::setup::{detect_candidate_setups, SetupType};
use super::structure::{analyze_structure, Structure};
use super::zones::{
    analyze_zones, detect_displacement, DisplacementCandle, Zones, DISPLACEMENT_BODY_MULT,
    DISPLACEMENT_LOOKBACK, DISPLACEMENT_RANGE_MULT,
};
use crate::error::{EngineError, EngineResult};

/// MTF bars required before any analysis runs
pub const MIN_MTF_CANDLES: usize = 30;
const MTF_SWING_LOOKBACK: usize = 5;
const LTF_SWING_LOOKBACK: usize = 3;

/// One engine step's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInput {
    pub symbol: String,
    /// Epoch-ms of this step
    pub time: i64,
    pub last_price: f64,
    /// Candle series keyed by timeframe label ("1h", "15m", ...)
    pub candles_by_timeframe: HashMap<String, Vec<Candle>>,
    /// Derived from `time` when absent
    #[serde(default)]
    pub session: Option<SessionInfo>,
    #[serde(default)]
    pub headlines: Vec<String>,
    /// Latest depth snapshot, when the feed has one
    #[serde(default)]
    pub order_book: Option<OrderBookSnapshot>,
}

impl EngineInput {
    pub fn candles(&self, timeframe: &str) -> &[Candle] {
        self.candles_by_timeframe
            .get(timeframe)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Reject non-finite or non-positive prices and malformed series
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.last_price.is_finite() && self.last_price > 0.0) {
            return Err(EngineError::InvalidPrice {
                symbol: self.symbol.clone(),
                value: self.last_price,
            });
        }

        let mut timeframes: Vec<&String> = self.candles_by_timeframe.keys().collect();
        timeframes.sort();
        for timeframe in timeframes {
            validate_series(timeframe, self.candles(timeframe))?;
        }
        Ok(())
    }
}

/// How one candidate setup fared this step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvaluation {
    pub setup_type: SetupType,
    pub gate_score: GateScore,
    pub passed_threshold: bool,
    pub trigger: Option<EntryTrigger>,
    pub rejected_reason: Option<String>,
}

/// Introspection snapshot returned with every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugState {
    pub session: Option<SessionInfo>,
    pub market_state: Option<MarketState>,
    pub structure: Option<Structure>,
    pub liquidity: Option<Liquidity>,
    pub zones: Option<Zones>,
    /// The emitted signal's score, else the best score evaluated
    pub gate_score: Option<GateScore>,
    pub displacement: Option<DisplacementCandle>,
    pub order_flow: Option<OrderFlow>,
    pub obi: Option<ObiResult>,
    pub mismatch: MismatchState,
    pub loss_streak: LossStreakState,
    pub active_setup_type: Option<SetupType>,
    pub candidates: Vec<CandidateEvaluation>,
    pub sentiment: Option<SentimentVerdict>,
    pub current_bar: u64,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub signal: Option<EntrySignal>,
    pub exits: Vec<ExitSignal>,
    pub debug: DebugState,
}

/// Bounded per-step log, stamped with the step time and mirrored to tracing
struct StepLog {
    stamp: String,
    symbol: String,
    cap: usize,
    lines: VecDeque<String>,
}

impl StepLog {
    fn new(symbol: &str, time: i64, cap: usize) -> Self {
        let stamp = utc_datetime(time)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| time.to_string());
        Self {
            stamp,
            symbol: symbol.to_string(),
            cap,
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, message: String) {
        debug!("[{}] {}", self.symbol, message);
        if self.cap == 0 {
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(format!("[{}] {}", self.stamp, message));
    }
}

/// Analyses shared by the exit monitor and setup detection
struct StepAnalysis {
    session: SessionInfo,
    market_state: MarketState,
    structure: Structure,
    liquidity: Liquidity,
    zones: Zones,
    displacement: Option<DisplacementCandle>,
    order_flow: OrderFlow,
    obi: Option<ObiResult>,
}

pub struct StrategyEngine {
    config: EngineConfig,
    active_signal: Option<EntrySignal>,
    entry_bar: u64,
    current_bar: u64,
    loss_streak: LossStreakState,
    sentiment: Option<Arc<dyn SentimentProvider>>,
}

impl StrategyEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let loss_streak = LossStreakState::new(config.max_loss_streak);
        Ok(Self {
            config,
            active_signal: None,
            entry_bar: 0,
            current_bar: 0,
            loss_streak,
            sentiment: None,
        })
    }

    pub fn with_sentiment(mut self, provider: Arc<dyn SentimentProvider>) -> Self {
        self.sentiment = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Swap the configuration. Open signals and the streak count are kept.
    pub fn update_config(&mut self, config: EngineConfig) -> EngineResult<()> {
        config.validate()?;
        self.loss_streak.max_streak = config.max_loss_streak;
        self.config = config;
        Ok(())
    }

    pub fn active_signal(&self) -> Option<&EntrySignal> {
        self.active_signal.as_ref()
    }

    pub fn loss_streak(&self) -> &LossStreakState {
        &self.loss_streak
    }

    pub fn current_bar(&self) -> u64 {
        self.current_bar
    }

    /// Back to a fresh IDLE engine with the same config and provider
    pub fn reset(&mut self) {
        self.active_signal = None;
        self.entry_bar = 0;
        self.current_bar = 0;
        self.loss_streak = LossStreakState::new(self.config.max_loss_streak);
    }

    /// Close the open signal on the caller's behalf, counting it toward the
    /// loss streak. None when nothing is open.
    pub fn close_active_signal(&mut self, reason: ExitReason, price: f64, time: i64) -> Option<ExitSignal> {
        let signal = self.active_signal.clone()?;
        let exit = ExitSignal::new(
            reason,
            ExitSeverity::Exit,
            price,
            format!("Closed by caller ({})", reason),
            time,
        );
        self.settle(&signal, &exit, time);
        Some(exit)
    }

    fn settle(&mut self, signal: &EntrySignal, exit: &ExitSignal, time: i64) {
        let loss = is_loss(signal, exit);
        let locked = self
            .loss_streak
            .record(loss, time, self.config.lock_duration_ms());

        info!(
            "[{}] CLOSED: {} @ {:.4} | reason: {} | {}",
            signal.symbol,
            signal.setup_type,
            exit.price,
            exit.reason,
            if loss { "loss" } else { "win/flat" }
        );
        if locked {
            warn!(
                "[{}] LOCKED: {} consecutive losses, no new setups for {} min",
                signal.symbol, self.loss_streak.current_streak, self.config.lock_duration_minutes
            );
        }
        self.active_signal = None;
    }

    pub fn process(&mut self, input: &EngineInput) -> EngineResult<EngineOutput> {
        if let Err(e) = input.validate() {
            warn!("[{}] Rejected input: {}", input.symbol, e);
            return Err(e);
        }

        let mut log = StepLog::new(&input.symbol, input.time, self.config.max_log_lines);
        let htf = input.candles(&self.config.htf_timeframe);
        let mtf = input.candles(&self.config.mtf_timeframe);
        let ltf = input.candles(&self.config.ltf_timeframe);
        let session = input
            .session
            .unwrap_or_else(|| SessionInfo::from_timestamp_ms(input.time));

        log.push(format!("Processing {} at price {:.4}", input.symbol, input.last_price));

        if mtf.len() < MIN_MTF_CANDLES {
            log.push(format!("Insufficient data: {} MTF candles", mtf.len()));
            let mut debug = self.empty_debug();
            debug.session = Some(session);
            return Ok(self.output(None, Vec::new(), debug, log));
        }

        self.current_bar += 1;
        if self.loss_streak.refresh(input.time) {
            info!("[{}] Loss streak lock lifted", input.symbol);
            log.push("Loss streak lock lifted".to_string());
        }

        let analysis = self.analyze(htf, mtf, ltf, session, input.order_book.as_ref());
        log.push(format!(
            "Market: {} bias, {:?} volatility, {:?} phase",
            analysis.market_state.htf_bias,
            analysis.market_state.volatility_regime,
            analysis.market_state.market_phase
        ));
        log.push(format!(
            "Structure: {} trend, {} breaks",
            analysis.structure.current_trend,
            analysis.structure.recent_breaks.len()
        ));
        log.push(format!(
            "Liquidity: {} levels, {} sweeps",
            analysis.liquidity.levels.len(),
            analysis.liquidity.recent_sweeps.len()
        ));
        log.push(format!(
            "Zones: {} FVG, {} wick, ORB: {}",
            analysis.zones.fvg_zones.len(),
            analysis.zones.wick_zones.len(),
            if analysis.zones.orb_box.is_some() { "yes" } else { "no" }
        ));
        log.push(format!(
            "Order flow: {:?} pressure ({:.0}), CVD {:?}",
            analysis.order_flow.pressure, analysis.order_flow.pressure_score, analysis.order_flow.cvd_trend
        ));
        if let Some(obi) = &analysis.obi {
            log.push(format!("OBI {:.3}: {}", obi.obi, obi_pressure_label(obi.obi)));
        }

        if let Some(signal) = self.active_signal.clone() {
            let (exits, mismatch) = self.monitor(&signal, mtf, &analysis, input, &mut log);
            let mut debug = self.analysis_debug(analysis);
            debug.mismatch = mismatch;
            return Ok(self.output(None, exits, debug, log));
        }

        if self.loss_streak.is_locked_at(input.time) {
            log.push(format!(
                "Trading locked after {} consecutive losses",
                self.loss_streak.current_streak
            ));
            let debug = self.analysis_debug(analysis);
            return Ok(self.output(None, Vec::new(), debug, log));
        }

        let verdict = self
            .sentiment
            .as_ref()
            .map(|provider| provider.evaluate(&input.symbol, &input.headlines));
        if let Some(v) = verdict.filter(|v| v.locked) {
            log.push(format!("Sentiment lock (score {:.2})", v.score));
            let mut debug = self.analysis_debug(analysis);
            debug.sentiment = verdict;
            return Ok(self.output(None, Vec::new(), debug, log));
        }

        let (signal, candidates, best_score) = self.evaluate_setups(mtf, ltf, &analysis, input, &mut log);

        if let Some(signal) = &signal {
            self.active_signal = Some(signal.clone());
            self.entry_bar = self.current_bar;
            info!(
                "[{}] SIGNAL: {} @ {:.4} | stop {:.4} | T1 {:.4} | score {:.1}/10",
                signal.symbol,
                signal.setup_type,
                signal.entry_price,
                signal.stop_loss,
                signal.target1,
                signal.gate_score.normalized
            );
            log.push(format!(
                "Signal generated: {} at {:.4}",
                signal.setup_type, signal.entry_price
            ));
        }

        let mut debug = self.analysis_debug(analysis);
        debug.sentiment = verdict;
        debug.candidates = candidates;
        debug.gate_score = signal.as_ref().map(|s| s.gate_score).or(best_score);
        Ok(self.output(signal, Vec::new(), debug, log))
    }

    fn analyze(
        &self,
        htf: &[Candle],
        mtf: &[Candle],
        ltf: &[Candle],
        session: SessionInfo,
        order_book: Option<&OrderBookSnapshot>,
    ) -> StepAnalysis {
        let market_state = analyze_market_state(htf, mtf, ltf);
        let structure = analyze_structure(mtf, MTF_SWING_LOOKBACK);
        let liquidity = analyze_liquidity(mtf, &structure.swing_highs, &structure.swing_lows);
        let zones = analyze_zones(mtf, &session, self.config.orb_window_minutes);
        let displacement = detect_displacement(
            mtf,
            DISPLACEMENT_LOOKBACK,
            DISPLACEMENT_BODY_MULT,
            DISPLACEMENT_RANGE_MULT,
        );
        let order_flow = analyze_order_flow(mtf, !liquidity.recent_sweeps.is_empty());
        let obi = order_book.map(|book| calculate_obi(book, OBI_TOP_LEVELS));

        StepAnalysis {
            session,
            market_state,
            structure,
            liquidity,
            zones,
            displacement,
            order_flow,
            obi,
        }
    }

    /// Exit checks for the open signal; clears it on any exit-severity signal
    fn monitor(
        &mut self,
        signal: &EntrySignal,
        mtf: &[Candle],
        analysis: &StepAnalysis,
        input: &EngineInput,
        log: &mut StepLog,
    ) -> (Vec<ExitSignal>, MismatchState) {
        let swing_high = analysis
            .structure
            .last_swing_high()
            .map(|s| s.price)
            .unwrap_or(input.last_price * 1.1);
        let swing_low = analysis
            .structure
            .last_swing_low()
            .map(|s| s.price)
            .unwrap_or(input.last_price * 0.9);

        let mismatch = analyze_mismatch_state(
            mtf,
            signal.direction,
            signal.zone.as_fvg(),
            swing_high,
            swing_low,
        );
        let mut exits = generate_exit_signals(&mismatch, signal, input.last_price, input.time);
        if let Some(stale) = check_stale_signal(
            signal,
            self.current_bar,
            self.entry_bar,
            self.config.stale_signal_bars,
            input.time,
        ) {
            exits.push(stale);
        }

        for exit in exits.iter().filter(|e| !e.is_exit()) {
            log.push(format!("Warning: {}", exit.description));
        }

        if let Some(closing) = closing_exit(&exits).cloned() {
            log.push(format!("Exit signal triggered: {}", closing.reason));
            self.settle(signal, &closing, input.time);
        }

        (exits, mismatch)
    }

    /// Score, threshold and trigger every candidate. The highest normalized
    /// score wins; ties keep detection order.
    fn evaluate_setups(
        &self,
        mtf: &[Candle],
        ltf: &[Candle],
        analysis: &StepAnalysis,
        input: &EngineInput,
        log: &mut StepLog,
    ) -> (Option<EntrySignal>, Vec<CandidateEvaluation>, Option<GateScore>) {
        let candidates = detect_candidate_setups(
            &analysis.zones,
            &analysis.structure,
            analysis.displacement.as_ref(),
        );
        for candidate in &candidates {
            log.push(format!("{} setup detected", candidate.setup_type));
        }
        if candidates.is_empty() {
            return (None, Vec::new(), None);
        }

        let ltf_structure = analyze_structure(ltf, LTF_SWING_LOOKBACK);
        let mut evaluations = Vec::with_capacity(candidates.len());
        let mut best_signal: Option<EntrySignal> = None;
        let mut best_score: Option<GateScore> = None;

        for candidate in candidates {
            let direction = candidate.direction();
            let gate_score = calculate_gate_score(
                &candidate,
                &analysis.market_state,
                &analysis.liquidity,
                &analysis.session,
                input.last_price,
                &self.config.gate_weights,
            );
            log.push(format!(
                "{} score: {:.1}/10",
                candidate.setup_type, gate_score.normalized
            ));
            if best_score.map_or(true, |b| gate_score.normalized > b.normalized) {
                best_score = Some(gate_score);
            }

            let mut evaluation = CandidateEvaluation {
                setup_type: candidate.setup_type,
                gate_score,
                passed_threshold: meets_threshold(&gate_score, candidate.kind(), &self.config.thresholds),
                trigger: None,
                rejected_reason: None,
            };

            if !evaluation.passed_threshold {
                let threshold = self.config.thresholds.for_kind(candidate.kind());
                log.push(format!("{} below threshold ({})", candidate.setup_type, threshold));
                evaluation.rejected_reason = Some(format!("below threshold ({})", threshold));
                evaluations.push(evaluation);
                continue;
            }

            let Some(trigger) = find_best_trigger(
                mtf,
                ltf,
                &candidate.zone,
                direction,
                &ltf_structure,
                self.config.require_candle_close,
            ) else {
                log.push(format!("{}: no valid trigger found", candidate.setup_type));
                evaluation.rejected_reason = Some("no valid trigger".to_string());
                evaluations.push(evaluation);
                continue;
            };
            evaluation.trigger = Some(trigger);

            let sweep = analysis
                .liquidity
                .recent_sweeps
                .iter()
                .find(|s| s.direction == direction)
                .copied();

            let request = SignalRequest {
                symbol: &input.symbol,
                timeframe: &self.config.mtf_timeframe,
                time: input.time,
                setup_type: candidate.setup_type,
                trigger,
                zone: candidate.zone,
                displacement: candidate.displacement,
                sweep,
                gate_score,
                risk_per_trade: self.config.risk_per_trade,
            };
            let Some(signal) = build_entry_signal(request, mtf) else {
                log.push(format!("{}: no valid stop (ATR unavailable)", candidate.setup_type));
                evaluation.rejected_reason = Some("no valid stop".to_string());
                evaluations.push(evaluation);
                continue;
            };

            let better = best_signal
                .as_ref()
                .map_or(true, |best| gate_score.normalized > best.gate_score.normalized);
            if better {
                best_signal = Some(signal);
            }
            evaluations.push(evaluation);
        }

        (best_signal, evaluations, best_score)
    }

    fn empty_debug(&self) -> DebugState {
        DebugState {
            session: None,
            market_state: None,
            structure: None,
            liquidity: None,
            zones: None,
            gate_score: None,
            displacement: None,
            order_flow: None,
            obi: None,
            mismatch: MismatchState::default(),
            loss_streak: self.loss_streak,
            active_setup_type: self.active_signal.as_ref().map(|s| s.setup_type),
            candidates: Vec::new(),
            sentiment: None,
            current_bar: self.current_bar,
            logs: Vec::new(),
        }
    }

    fn analysis_debug(&self, analysis: StepAnalysis) -> DebugState {
        DebugState {
            session: Some(analysis.session),
            market_state: Some(analysis.market_state),
            structure: Some(analysis.structure),
            liquidity: Some(analysis.liquidity),
            zones: Some(analysis.zones),
            displacement: analysis.displacement,
            order_flow: Some(analysis.order_flow),
            obi: analysis.obi,
            ..self.empty_debug()
        }
    }

    /// Final snapshot; streak and active setup reflect end-of-step state
    fn output(
        &self,
        signal: Option<EntrySignal>,
        exits: Vec<ExitSignal>,
        mut debug: DebugState,
        log: StepLog,
    ) -> EngineOutput {
        debug.loss_streak = self.loss_streak;
        debug.active_setup_type = self.active_signal.as_ref().map(|s| s.setup_type);
        debug.current_bar = self.current_bar;
        debug.logs = log.lines.into();
        EngineOutput { signal, exits, debug }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::fixtures::{
        candle, path_bars, retime, trending_bars, zigzag_closes, BASE_TIME_MS, FIFTEEN_MIN_MS,
        MINUTE_MS,
    };
    use crate::trading_core::orderflow::OrderBookLevel;
    use crate::trading_core::sentiment::KeywordSentiment;
    use crate::types::TrendDirection;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// 05:00 UTC, so the 40th bar opens at 14:45 inside the London/New York overlap
    const SCENARIO_START_MS: i64 = BASE_TIME_MS + 5 * 60 * MINUTE_MS;

    /// 40 MTF bars: an uptrend (higher highs 104.1/106.1/106.6, higher lows
    /// 100.9/102.9), a pullback to 103.9, then a bar that sweeps the 102.9
    /// swing low and displaces to 106.0 leaving a 104.3-105.2 gap. The last
    /// three bars pull back into the gap.
    fn icc_mtf() -> Vec<Candle> {
        let mut closes = zigzag_closes(&[100.0, 104.0, 101.0, 106.0, 103.0, 106.5], 6);
        closes.extend([105.9, 105.2, 104.5, 103.9]);
        let mut bars = path_bars(0, &closes, 0.1);
        bars.push(candle(35, 103.9, 106.2, 102.6, 106.0));
        bars.push(candle(36, 106.0, 106.3, 105.2, 105.6));
        bars.push(candle(37, 105.6, 105.7, 104.9, 105.0));
        bars.push(candle(38, 105.0, 105.1, 104.6, 104.8));
        bars.push(candle(39, 104.8, 105.0, 104.5, 104.7));
        retime(&mut bars, SCENARIO_START_MS, FIFTEEN_MIN_MS);
        bars
    }

    /// 1m uptrend ending with a tap into the gap and a bullish rejection
    fn icc_ltf(end_time: i64) -> Vec<Candle> {
        let mut bars: Vec<Candle> = (0..28)
            .map(|i| {
                let open = 103.0 + 0.06 * i as f64;
                let close = open + 0.05;
                Candle::new(0, open, close + 0.03, open - 0.03, close, 100.0)
            })
            .collect();
        bars.push(Candle::new(0, 104.70, 104.75, 104.40, 104.50, 100.0));
        bars.push(Candle::new(0, 104.50, 104.90, 104.45, 104.85, 100.0));
        retime(&mut bars, end_time - 29 * MINUTE_MS, MINUTE_MS);
        bars
    }

    fn input_with(mtf: Vec<Candle>, time: i64, last_price: f64) -> EngineInput {
        let mut candles = HashMap::new();
        candles.insert("1h".to_string(), trending_bars(0, 30, 90.0, 1.0));
        candles.insert("1m".to_string(), icc_ltf(time.min(mtf.last().map(|c| c.time).unwrap_or(time))));
        candles.insert("15m".to_string(), mtf);
        EngineInput {
            symbol: "ES".to_string(),
            time,
            last_price,
            candles_by_timeframe: candles,
            session: None,
            headlines: Vec::new(),
            order_book: None,
        }
    }

    fn icc_input() -> EngineInput {
        let mtf = icc_mtf();
        let time = mtf[39].time;
        input_with(mtf, time, 104.7)
    }

    /// The scenario plus a bar closing at 104.2, below the gap's 104.3 low
    fn breach_input() -> EngineInput {
        let mut mtf = icc_mtf();
        let time = mtf[39].time + FIFTEEN_MIN_MS;
        mtf.push(Candle::new(time, 104.7, 104.75, 104.1, 104.2, 100.0));
        input_with(mtf, time, 104.2)
    }

    fn engine() -> StrategyEngine {
        StrategyEngine::new(EngineConfig::default()).unwrap()
    }

    fn random_walk(seed: u64, count: usize) -> Vec<Candle> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price: f64 = 100.0;
        (0..count)
            .map(|i| {
                let open = price;
                let close = open + rng.gen_range(-1.0..1.0);
                let high = open.max(close) + rng.gen_range(0.0..0.5);
                let low = open.min(close) - rng.gen_range(0.0..0.5);
                price = close;
                Candle::new(SCENARIO_START_MS + i as i64 * FIFTEEN_MIN_MS, open, high, low, close, 100.0)
            })
            .collect()
    }

    #[test]
    fn test_bullish_icc_scenario() {
        let mut engine = engine();
        let output = engine.process(&icc_input()).unwrap();
        let debug = &output.debug;

        let structure = debug.structure.as_ref().unwrap();
        assert_eq!(structure.current_trend, TrendDirection::Bullish);

        let liquidity = debug.liquidity.as_ref().unwrap();
        assert!(liquidity
            .recent_sweeps
            .iter()
            .any(|s| s.direction == TrendDirection::Bullish));

        let active_fvg = debug.zones.as_ref().unwrap().active_fvg.unwrap();
        assert_eq!(active_fvg.direction, TrendDirection::Bullish);
        assert!((active_fvg.low - 104.3).abs() < 1e-9);
        assert!((active_fvg.high - 105.2).abs() < 1e-9);

        let icc = debug
            .candidates
            .iter()
            .find(|c| c.setup_type == SetupType::IccLong)
            .unwrap();
        assert!(icc.passed_threshold);
        assert!(icc.gate_score.normalized >= 6.0);

        let signal = output.signal.unwrap();
        assert_eq!(signal.setup_type, SetupType::IccLong);
        assert_eq!(signal.trigger.kind, crate::trading_core::execution::EntryTriggerKind::TapReject);
        assert_eq!(signal.entry_price, 104.85);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.entry_price < signal.target1);
        assert!(signal.sweep.is_some());
        assert_eq!(debug.active_setup_type, Some(SetupType::IccLong));
        assert_eq!(engine.active_signal().map(|s| s.id), Some(signal.id));
    }

    #[test]
    fn test_order_flow_and_book_in_debug() {
        let output = engine().process(&icc_input()).unwrap();
        let flow = output.debug.order_flow.as_ref().unwrap();
        // Every scenario bar trades 100, so recent buy + sell is 5 bars of it
        assert!((flow.buy_volume + flow.sell_volume - 500.0).abs() < 1e-9);
        assert!(!flow.absorption_detected);
        assert!(output.debug.obi.is_none());
        assert!(output.debug.logs.iter().any(|l| l.contains("Order flow:")));

        let mut input = icc_input();
        input.order_book = Some(OrderBookSnapshot {
            symbol: "ES".to_string(),
            timestamp: input.time,
            bids: vec![
                OrderBookLevel { price: 104.70, size: 50.0, orders: None },
                OrderBookLevel { price: 104.65, size: 40.0, orders: None },
                OrderBookLevel { price: 104.60, size: 30.0, orders: Some(4) },
            ],
            asks: vec![
                OrderBookLevel { price: 104.75, size: 10.0, orders: None },
                OrderBookLevel { price: 104.80, size: 5.0, orders: None },
            ],
        });
        let output = engine().process(&input).unwrap();
        let obi = output.debug.obi.unwrap();
        assert_eq!(obi.obi, 0.778);
        assert!(obi.passed_gate);
        assert!(output.debug.logs.iter().any(|l| l.contains("STRONG BUY PRESSURE")));
        // Informational only: the signal is unchanged
        assert_eq!(output.signal.map(|s| s.entry_price), Some(104.85));

        // Older inputs without the field still deserialize
        let mut json = serde_json::to_value(icc_input()).unwrap();
        json.as_object_mut().unwrap().remove("order_book");
        let parsed: EngineInput = serde_json::from_value(json).unwrap();
        assert!(parsed.order_book.is_none());
    }

    #[test]
    fn test_insufficient_data() {
        let mut engine = engine();
        let mut mtf = icc_mtf();
        mtf.truncate(29);
        let time = mtf[28].time;
        let output = engine.process(&input_with(mtf, time, 104.0)).unwrap();

        assert!(output.signal.is_none());
        assert!(output.exits.is_empty());
        assert!(output
            .debug
            .logs
            .iter()
            .any(|l| l.contains("Insufficient data: 29 MTF candles")));
        assert!(output.debug.structure.is_none());
        assert_eq!(engine.current_bar(), 0);
    }

    #[test]
    fn test_fvg_breach_exit() {
        let mut engine = engine();
        let entry = engine.process(&icc_input()).unwrap();
        assert!(entry.signal.is_some());

        let output = engine.process(&breach_input()).unwrap();
        let breach = output
            .exits
            .iter()
            .find(|e| e.reason == ExitReason::FvgBreach)
            .unwrap();
        assert_eq!(breach.severity, ExitSeverity::Exit);
        assert!(output.signal.is_none());
        assert!(output.debug.mismatch.fvg_breach);

        // Closed below entry counts as a loss
        assert!(engine.active_signal().is_none());
        assert_eq!(engine.loss_streak().current_streak, 1);

        let next = engine.process(&breach_input()).unwrap();
        assert!(next.exits.is_empty());
    }

    #[test]
    fn test_single_active_signal() {
        let mut engine = engine();
        let first = engine.process(&icc_input()).unwrap();
        let id = first.signal.unwrap().id;

        // Same setup again while the signal is open: monitor only
        let second = engine.process(&icc_input()).unwrap();
        assert!(second.signal.is_none());
        assert!(second.exits.iter().all(|e| !e.is_exit()));
        assert_eq!(engine.active_signal().map(|s| s.id), Some(id));

        // Random walk: a signal only ever appears from IDLE
        let mut engine = StrategyEngine::new(EngineConfig::aggressive()).unwrap();
        let walk = random_walk(7, 120);
        for end in MIN_MTF_CANDLES..=walk.len() {
            let window = walk[..end].to_vec();
            let time = window[end - 1].time;
            let price = window[end - 1].close;
            let was_active = engine.active_signal().is_some();
            let output = engine.process(&input_with(window, time, price)).unwrap();
            if was_active {
                assert!(output.signal.is_none());
            }
            if output.signal.is_some() {
                assert!(engine.active_signal().is_some());
            }
        }
    }

    #[test]
    fn test_stale_signal_exit() {
        let config = EngineConfig {
            stale_signal_bars: 2,
            ..Default::default()
        };
        let mut engine = StrategyEngine::new(config).unwrap();
        engine.process(&icc_input()).unwrap();

        let first = engine.process(&icc_input()).unwrap();
        assert!(first.exits.iter().all(|e| e.reason != ExitReason::StaleSignal));

        let second = engine.process(&icc_input()).unwrap();
        let stale = second
            .exits
            .iter()
            .find(|e| e.reason == ExitReason::StaleSignal)
            .unwrap();
        assert_eq!(stale.price, 104.85);
        assert!(engine.active_signal().is_none());
        // Exit at entry is flat, not a loss
        assert_eq!(engine.loss_streak().current_streak, 0);
    }

    #[test]
    fn test_circuit_breaker() {
        let config = EngineConfig {
            max_loss_streak: 1,
            lock_duration_minutes: 30,
            ..Default::default()
        };
        let mut engine = StrategyEngine::new(config).unwrap();

        assert!(engine.process(&icc_input()).unwrap().signal.is_some());
        let breach = breach_input();
        engine.process(&breach).unwrap();

        let lock_until = breach.time + 30 * MINUTE_MS;
        assert!(engine.loss_streak().is_locked);
        assert_eq!(engine.loss_streak().lock_until, Some(lock_until));

        // A qualifying setup while locked is ignored
        let mut locked = icc_input();
        locked.time = lock_until - FIFTEEN_MIN_MS;
        let output = engine.process(&locked).unwrap();
        assert!(output.signal.is_none());
        assert!(output.debug.logs.iter().any(|l| l.contains("Trading locked")));

        // Lock lifts lazily at lock_until and the streak resets
        let mut unlocked = icc_input();
        unlocked.time = lock_until;
        let output = engine.process(&unlocked).unwrap();
        assert!(output.signal.is_some());
        assert_eq!(output.debug.loss_streak.current_streak, 0);
        assert!(!output.debug.loss_streak.is_locked);
    }

    #[test]
    fn test_sentiment_lock_blocks_setups() {
        let provider = Arc::new(KeywordSentiment::default());
        let mut engine = engine().with_sentiment(provider);

        let mut input = icc_input();
        input.headlines = vec!["Exchange declares trading halt".to_string()];
        let output = engine.process(&input).unwrap();
        assert!(output.signal.is_none());
        assert!(output.debug.sentiment.unwrap().locked);

        input.headlines.clear();
        assert!(engine.process(&input).unwrap().signal.is_some());
    }

    #[test]
    fn test_determinism() {
        let mut a = engine();
        let mut b = engine();
        let first = serde_json::to_string(&a.process(&icc_input()).unwrap()).unwrap();
        let second = serde_json::to_string(&b.process(&icc_input()).unwrap()).unwrap();
        assert_eq!(first, second);

        let walk = random_walk(42, 80);
        let (mut a, mut b) = (engine(), engine());
        for end in MIN_MTF_CANDLES..=walk.len() {
            let window = walk[..end].to_vec();
            let input = input_with(window, walk[end - 1].time, walk[end - 1].close);
            let first = serde_json::to_string(&a.process(&input).unwrap()).unwrap();
            let second = serde_json::to_string(&b.process(&input).unwrap()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_rejects_malformed_input() {
        let mut engine = engine();

        let mut input = icc_input();
        input.last_price = f64::NAN;
        assert!(matches!(engine.process(&input), Err(EngineError::InvalidPrice { .. })));

        let mut mtf = icc_mtf();
        mtf[10].time = mtf[9].time;
        let input = input_with(mtf, BASE_TIME_MS + 15 * 60 * MINUTE_MS, 104.0);
        assert!(matches!(
            engine.process(&input),
            Err(EngineError::NonMonotonicTime { .. })
        ));
        assert_eq!(engine.current_bar(), 0);
    }

    #[test]
    fn test_manual_close_and_reset() {
        let mut engine = engine();
        assert!(engine.close_active_signal(ExitReason::Manual, 100.0, 0).is_none());

        engine.process(&icc_input()).unwrap();
        let exit = engine
            .close_active_signal(ExitReason::Manual, 104.0, icc_input().time)
            .unwrap();
        assert_eq!(exit.reason, ExitReason::Manual);
        assert!(engine.active_signal().is_none());
        assert_eq!(engine.loss_streak().current_streak, 1);

        engine.reset();
        assert_eq!(engine.loss_streak().current_streak, 0);
        assert_eq!(engine.current_bar(), 0);

        let bad = EngineConfig {
            max_loss_streak: 0,
            ..Default::default()
        };
        assert!(engine.update_config(bad).is_err());
        assert!(engine.update_config(EngineConfig::conservative()).is_ok());
        assert!(engine.config().require_candle_close);
    }

    #[test]
    fn test_step_log_keeps_newest_lines() {
        let mut log = StepLog::new("ES", BASE_TIME_MS, 3);
        for n in 0..10_000 {
            log.push(format!("line {}", n));
        }
        let lines: Vec<String> = log.lines.into();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line 9997"));
        assert!(lines[2].ends_with("line 9999"));

        let mut silent = StepLog::new("ES", BASE_TIME_MS, 0);
        silent.push("dropped".to_string());
        assert!(silent.lines.is_empty());

        let config = EngineConfig {
            max_log_lines: 2,
            ..Default::default()
        };
        let output = StrategyEngine::new(config).unwrap().process(&icc_input()).unwrap();
        assert_eq!(output.debug.logs.len(), 2);
        assert!(output.debug.logs[1].contains("Signal generated"));
    }
}
