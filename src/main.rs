//! gate-engine replay CLI
//!
//! Reads `<data_dir>/<SYMBOL>/<timeframe>.csv` for the configured HTF, MTF
//! and LTF labels, steps every symbol's engine once per closed MTF bar and
//! prints signals and exits as JSON lines.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use gate_engine::trading_core::{
    Candle, EngineConfig, EngineInput, EngineRegistry, EntrySignal, ExitSignal, KeywordSentiment,
    MIN_MTF_CANDLES,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Conservative,
    Aggressive,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding one sub-directory of candle CSVs per symbol
    #[arg(short, long, env = "GATE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Symbols to replay (comma-separated). Defaults to every sub-directory.
    #[arg(short, long)]
    symbols: Option<String>,

    /// JSON config file; overrides the preset
    #[arg(short, long, env = "GATE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// Headline keywords that lock out new setups (comma-separated)
    #[arg(long)]
    halt_keywords: Option<String>,

    /// Include the debug snapshot with every event
    #[arg(short, long)]
    verbose: bool,
}

/// One line of output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ReplayEvent {
    Signal {
        symbol: String,
        time: i64,
        signal: EntrySignal,
        #[serde(skip_serializing_if = "Option::is_none")]
        debug: Option<serde_json::Value>,
    },
    Exit {
        symbol: String,
        time: i64,
        exits: Vec<ExitSignal>,
    },
}

struct SymbolData {
    symbol: String,
    candles: HashMap<String, Vec<Candle>>,
    /// (epoch-ms, headline), time-ordered
    headlines: Vec<(i64, String)>,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn load_candles(path: &Path) -> Result<Vec<Candle>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));

    let mut candles = Vec::new();
    for row in reader.deserialize() {
        let candle: Candle = row.with_context(|| format!("Failed to parse row in {}", path.display()))?;
        candles.push(candle);
    }
    Ok(candles)
}

/// `headlines.txt`: one `epoch_ms<TAB>headline` per line, optional
fn load_headlines(path: &Path) -> Result<Vec<(i64, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut headlines = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let Some((time, text)) = line.split_once('\t') else {
            warn!("{}:{}: missing tab separator, skipped", path.display(), n + 1);
            continue;
        };
        let time: i64 = time
            .trim()
            .parse()
            .with_context(|| format!("{}:{}: bad timestamp", path.display(), n + 1))?;
        headlines.push((time, text.trim().to_string()));
    }
    headlines.sort_by_key(|(time, _)| *time);
    Ok(headlines)
}

fn load_symbol(data_dir: &Path, symbol: &str, config: &EngineConfig) -> Result<SymbolData> {
    let dir = data_dir.join(symbol);
    let mut candles = HashMap::new();

    for timeframe in [&config.htf_timeframe, &config.mtf_timeframe, &config.ltf_timeframe] {
        let path = dir.join(format!("{}.csv", timeframe));
        if !path.exists() && timeframe != &config.mtf_timeframe {
            warn!("{}: no {} data, continuing without it", symbol, timeframe);
            continue;
        }
        candles.insert(timeframe.clone(), load_candles(&path)?);
    }

    Ok(SymbolData {
        symbol: symbol.to_uppercase(),
        candles,
        headlines: load_headlines(&dir.join("headlines.txt"))?,
    })
}

fn discover_symbols(data_dir: &Path) -> Result<Vec<String>> {
    let mut symbols = Vec::new();
    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read data dir {}", data_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            symbols.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    symbols.sort();
    Ok(symbols)
}

/// Candles closed at or before `time`
fn up_to(candles: &[Candle], time: i64) -> Vec<Candle> {
    let end = candles.partition_point(|c| c.time <= time);
    candles[..end].to_vec()
}

fn replay_symbol(
    registry: &EngineRegistry,
    data: &SymbolData,
    verbose: bool,
) -> Result<Vec<ReplayEvent>> {
    let config = registry.config();
    let mtf = data
        .candles
        .get(&config.mtf_timeframe)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut events = Vec::new();
    let mut prev_time = i64::MIN;

    for bar in mtf.iter().skip(MIN_MTF_CANDLES.saturating_sub(1)) {
        let candles_by_timeframe = data
            .candles
            .iter()
            .map(|(tf, series)| (tf.clone(), up_to(series, bar.time)))
            .collect();
        let headlines = data
            .headlines
            .iter()
            .filter(|(t, _)| *t > prev_time && *t <= bar.time)
            .map(|(_, h)| h.clone())
            .collect();
        prev_time = bar.time;

        let input = EngineInput {
            symbol: data.symbol.clone(),
            time: bar.time,
            last_price: bar.close,
            candles_by_timeframe,
            session: None,
            headlines,
            order_book: None,
        };
        let output = registry
            .process(&input)
            .with_context(|| format!("{} step at {} failed", data.symbol, bar.time))?;

        if let Some(signal) = output.signal {
            let debug = if verbose {
                Some(serde_json::to_value(&output.debug)?)
            } else {
                None
            };
            events.push(ReplayEvent::Signal {
                symbol: data.symbol.clone(),
                time: bar.time,
                signal,
                debug,
            });
        }
        if !output.exits.is_empty() {
            events.push(ReplayEvent::Exit {
                symbol: data.symbol.clone(),
                time: bar.time,
                exits: output.exits,
            });
        }
    }

    info!("{}: replayed {} MTF bars, {} events", data.symbol, mtf.len(), events.len());
    Ok(events)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gate_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => match args.preset {
            Preset::Default => EngineConfig::default(),
            Preset::Conservative => EngineConfig::conservative(),
            Preset::Aggressive => EngineConfig::aggressive(),
        },
    };

    let symbols = match &args.symbols {
        Some(list) => split_list(list),
        None => discover_symbols(&args.data_dir)?,
    };
    if symbols.is_empty() {
        bail!("No symbols found in {}", args.data_dir.display());
    }

    info!("Replaying {} from {}", symbols.join(","), args.data_dir.display());
    info!(
        "Timeframes: {} / {} / {}",
        config.htf_timeframe, config.mtf_timeframe, config.ltf_timeframe
    );

    let mut registry = EngineRegistry::new(config.clone())?;
    if let Some(list) = &args.halt_keywords {
        registry = registry.with_sentiment(Arc::new(KeywordSentiment::with_lock_keywords(split_list(list))));
    }

    let data: Vec<SymbolData> = symbols
        .iter()
        .map(|s| load_symbol(&args.data_dir, s, &config))
        .collect::<Result<_>>()?;

    let results: Vec<Result<Vec<ReplayEvent>>> = data
        .par_iter()
        .map(|d| replay_symbol(&registry, d, args.verbose))
        .collect();

    let mut total = 0;
    for events in results {
        for event in events? {
            println!("{}", serde_json::to_string(&event)?);
            total += 1;
        }
    }

    info!("Done: {} events", total);
    Ok(())
}
