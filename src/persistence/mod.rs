//! Append-only record sinks for replay output.
//!
//! The controller emits one [`RecordRow`] per order state change, fill,
//! daily position, daily result and episode summary. Sinks decide how the
//! rows are stored:
//! - [`MemoryRecorder`] keeps them in process (tests, embedding callers)
//! - [`NullRecorder`] drops them
//! - [`SqliteRecorder`] stores them as JSON in a SQLite database

mod sqlite;

pub use sqlite::{SqliteRecorder, StoredSummary};

use crate::backtest::EpisodeSummary;
use crate::ledger::{DailyPosition, DailyResult};
use crate::matching::{Order, Trade};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Row categories, one table/collection each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordCategory {
    Order,
    Trade,
    DailyPosition,
    DailyResult,
    EpisodeSummary,
}

impl RecordCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Trade => "trade",
            Self::DailyPosition => "daily_position",
            Self::DailyResult => "daily_result",
            Self::EpisodeSummary => "episode_summary",
        }
    }
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "row", rename_all = "snake_case")]
pub enum RecordRow {
    Order(Order),
    Trade(Trade),
    DailyPosition(DailyPosition),
    DailyResult(DailyResult),
    EpisodeSummary(EpisodeSummary),
}

impl RecordRow {
    pub fn category(&self) -> RecordCategory {
        match self {
            Self::Order(_) => RecordCategory::Order,
            Self::Trade(_) => RecordCategory::Trade,
            Self::DailyPosition(_) => RecordCategory::DailyPosition,
            Self::DailyResult(_) => RecordCategory::DailyResult,
            Self::EpisodeSummary(_) => RecordCategory::EpisodeSummary,
        }
    }

    /// When the row happened in replay time, as text.
    pub fn as_of(&self) -> Option<String> {
        match self {
            Self::Order(order) => Some(order.updated_time.to_string()),
            Self::Trade(trade) => Some(trade.timestamp.to_string()),
            Self::DailyPosition(row) => Some(row.date.to_string()),
            Self::DailyResult(row) => Some(row.date.to_string()),
            Self::EpisodeSummary(summary) => summary.end_date.map(|d| d.to_string()),
        }
    }

    /// The row's own fields as JSON, without the category tag.
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Order(order) => serde_json::to_string(order),
            Self::Trade(trade) => serde_json::to_string(trade),
            Self::DailyPosition(row) => serde_json::to_string(row),
            Self::DailyResult(row) => serde_json::to_string(row),
            Self::EpisodeSummary(summary) => serde_json::to_string(summary),
        }
    }
}

/// Sink for rows emitted during replay.
#[cfg_attr(test, mockall::automock)]
pub trait Recorder: Send {
    fn push(&mut self, episode_no: u32, row: &RecordRow) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn push(&mut self, _episode_no: u32, _row: &RecordRow) -> Result<()> {
        Ok(())
    }
}

/// Keeps rows in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecorder {
    rows: Arc<Mutex<Vec<(u32, RecordRow)>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row recorded so far.
    pub fn rows(&self) -> Vec<(u32, RecordRow)> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rows of one category, in emission order.
    pub fn rows_of(&self, category: RecordCategory) -> Vec<RecordRow> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, row)| row.category() == category)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn count(&self, category: RecordCategory) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, row)| row.category() == category)
            .count()
    }

    pub fn clear(&self) {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Recorder for MemoryRecorder {
    fn push(&mut self, episode_no: u32, row: &RecordRow) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("memory recorder lock poisoned"))?;
        rows.push((episode_no, row.clone()));
        Ok(())
    }
}
