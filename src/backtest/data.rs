//! Historical event sources for replay.
//!
//! Events are loaded once into an [`EventCache`]; rewinding for the next
//! episode only resets a cursor.

use crate::market::{Bar, BookLevel, MarketEvent, Tick, Timeframe};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Pull-style, rewindable supply of ordered market events.
pub trait HistoricalSource: Send {
    /// Rewind to the first event.
    fn reset(&mut self);

    /// Next event, `None` once history is exhausted.
    fn next_event(&mut self) -> Option<MarketEvent>;
}

/// In-memory event sequence shared between clones.
///
/// Clones share the loaded events and keep their own cursor, so parallel
/// workers can replay one dataset without copying it.
#[derive(Debug, Clone, Default)]
pub struct EventCache {
    events: Arc<Vec<MarketEvent>>,
    cursor: usize,
}

impl EventCache {
    /// Build a cache, ordering events by timestamp (stable for ties).
    pub fn from_events(mut events: Vec<MarketEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp());
        Self {
            events: Arc::new(events),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events already handed out since the last rewind.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn symbols(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.events.iter().map(|e| e.symbol()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    pub fn available_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let first = self.events.first()?.timestamp();
        let last = self.events.last()?.timestamp();
        Some((first, last))
    }
}

impl HistoricalSource for EventCache {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_event(&mut self) -> Option<MarketEvent> {
        let event = self.events.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(event)
    }
}

/// CSV reader for bar and tick files.
///
/// Bar files:
/// ```csv
/// date,time,open,high,low,close,volume[,amount][,symbol][,exchange][,open_interest]
/// 2024/03/01,09:31,10.00,10.05,9.98,10.02,125300
/// ```
///
/// Tick files:
/// ```csv
/// date,time,price,volume,bid1,bid1_size,ask1,ask1_size[,symbol][,exchange][,prev_close]
/// ```
///
/// Rows without a `symbol` column take the loader's default symbol.
#[derive(Debug, Clone)]
pub struct CsvEventLoader {
    default_symbol: String,
    exchange: String,
    timeframe: Timeframe,
}

#[derive(Debug, Deserialize)]
struct BarRow {
    date: String,
    time: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    open_interest: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct TickRow {
    date: String,
    time: String,
    price: Decimal,
    volume: Decimal,
    bid1: Decimal,
    bid1_size: Decimal,
    ask1: Decimal,
    ask1_size: Decimal,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    prev_close: Option<Decimal>,
}

impl CsvEventLoader {
    pub fn new(default_symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            default_symbol: default_symbol.to_string(),
            exchange: String::new(),
            timeframe,
        }
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    /// Load a bar file.
    pub fn load_bars<P: AsRef<Path>>(&self, path: P) -> Result<Vec<MarketEvent>> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
        let events = self
            .bars_from_reader(file)
            .with_context(|| format!("Failed to parse bars from {}", path.display()))?;
        info!(path = %path.display(), events = events.len(), "Loaded bar file");
        Ok(events)
    }

    /// Load a tick file.
    pub fn load_ticks<P: AsRef<Path>>(&self, path: P) -> Result<Vec<MarketEvent>> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
        let events = self
            .ticks_from_reader(file)
            .with_context(|| format!("Failed to parse ticks from {}", path.display()))?;
        info!(path = %path.display(), events = events.len(), "Loaded tick file");
        Ok(events)
    }

    pub fn bars_from_reader<R: Read>(&self, reader: R) -> Result<Vec<MarketEvent>> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut events = Vec::new();
        for (index, record) in csv_reader.deserialize::<BarRow>().enumerate() {
            let row = record.with_context(|| format!("Invalid bar row {}", index + 1))?;
            let timestamp = parse_timestamp(&row.date, &row.time)
                .with_context(|| format!("Invalid timestamp in bar row {}", index + 1))?;
            let bar = Bar {
                symbol: row.symbol.unwrap_or_else(|| self.default_symbol.clone()),
                exchange: row.exchange.unwrap_or_else(|| self.exchange.clone()),
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                open_interest: row.open_interest.unwrap_or(Decimal::ZERO),
                timestamp,
            };
            events.push(MarketEvent::bar(self.timeframe, bar));
        }

        anyhow::ensure!(!events.is_empty(), "CSV contains no data rows");
        Ok(events)
    }

    pub fn ticks_from_reader<R: Read>(&self, reader: R) -> Result<Vec<MarketEvent>> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut events = Vec::new();
        for (index, record) in csv_reader.deserialize::<TickRow>().enumerate() {
            let row = record.with_context(|| format!("Invalid tick row {}", index + 1))?;
            let timestamp = parse_timestamp(&row.date, &row.time)
                .with_context(|| format!("Invalid timestamp in tick row {}", index + 1))?;
            let symbol = row.symbol.unwrap_or_else(|| self.default_symbol.clone());
            let mut tick = Tick::with_quote(
                &symbol,
                timestamp,
                row.price,
                row.volume,
                BookLevel { price: row.bid1, size: row.bid1_size },
                BookLevel { price: row.ask1, size: row.ask1_size },
            );
            tick.exchange = row.exchange.unwrap_or_else(|| self.exchange.clone());
            tick.prev_close = row.prev_close.unwrap_or(Decimal::ZERO);
            events.push(MarketEvent::Tick(tick));
        }

        anyhow::ensure!(!events.is_empty(), "CSV contains no data rows");
        Ok(events)
    }
}

/// Parse `2024-03-01`/`2024/03/01`/`20240301` plus `09:31`/`09:31:00`.
fn parse_timestamp(date: &str, time: &str) -> Result<NaiveDateTime> {
    let date = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date, fmt).ok())
        .with_context(|| format!("Unrecognized date '{}'", date))?;
    let time = ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(time, fmt).ok())
        .with_context(|| format!("Unrecognized time '{}'", time))?;
    Ok(date.and_time(time))
}
