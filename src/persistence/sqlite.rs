//! SQLite record store.
//!
//! Every row lands in `records` as JSON under its category. Episode
//! summaries are also written to `episode_summaries` with their headline
//! figures as columns, which is what the `report` command reads.

use super::{RecordCategory, RecordRow, Recorder};
use crate::backtest::EpisodeSummary;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info};

/// Summary row as stored, with the run it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSummary {
    pub run_label: String,
    pub summary: EpisodeSummary,
}

/// SQLite-backed [`Recorder`].
pub struct SqliteRecorder {
    conn: Connection,
    run_label: String,
}

impl SqliteRecorder {
    /// Open (or create) the database; rows are tagged with `run_label`.
    pub fn open<P: AsRef<Path>>(db_path: P, run_label: &str) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let recorder = Self {
            conn,
            run_label: run_label.to_string(),
        };
        recorder.init_schema()?;

        info!(run = %run_label, "Recorder database opened at {:?}", db_path.as_ref());
        Ok(recorder)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_label TEXT NOT NULL,
                episode_no INTEGER NOT NULL,
                category TEXT NOT NULL,
                as_of TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_category ON records(run_label, category);

            CREATE TABLE IF NOT EXISTS episode_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_label TEXT NOT NULL,
                episode_no INTEGER NOT NULL,
                end_balance TEXT NOT NULL,
                total_return TEXT NOT NULL,
                sharpe_ratio TEXT NOT NULL,
                reason TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_run ON episode_summaries(run_label);
            "#,
        )?;

        debug!("Recorder schema initialized");
        Ok(())
    }

    pub fn run_label(&self) -> &str {
        &self.run_label
    }

    /// Number of rows of one category recorded under this run.
    pub fn count(&self, category: RecordCategory) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE run_label = ?1 AND category = ?2",
            params![self.run_label, category.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// JSON payloads of one category recorded under this run, in insertion order.
    pub fn payloads(&self, category: RecordCategory) -> Result<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM records WHERE run_label = ?1 AND category = ?2 ORDER BY id",
        )?;
        let raw: Vec<String> = stmt
            .query_map(params![self.run_label, category.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        raw.iter()
            .map(|text| serde_json::from_str(text).context("Corrupt record payload"))
            .collect()
    }

    /// Every stored summary across runs, or only those of `run_label`.
    pub fn summaries(&self, run_label: Option<&str>) -> Result<Vec<StoredSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT run_label, payload FROM episode_summaries
            WHERE ?1 IS NULL OR run_label = ?1
            ORDER BY id
            "#,
        )?;
        let raw: Vec<(String, String)> = stmt
            .query_map(params![run_label], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|(run_label, payload)| {
                let summary = serde_json::from_str(&payload)
                    .with_context(|| format!("Corrupt summary payload in run {}", run_label))?;
                Ok(StoredSummary { run_label, summary })
            })
            .collect()
    }

    fn insert_summary(&self, episode_no: u32, summary: &EpisodeSummary, payload: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO episode_summaries (run_label, episode_no, end_balance, total_return,
                                           sharpe_ratio, reason, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                self.run_label,
                episode_no,
                summary.end_balance.to_string(),
                summary.total_return.to_string(),
                summary.sharpe_ratio.to_string(),
                summary.reason,
                payload,
            ],
        )?;
        Ok(())
    }
}

impl Recorder for SqliteRecorder {
    fn push(&mut self, episode_no: u32, row: &RecordRow) -> Result<()> {
        let payload = row
            .payload_json()
            .with_context(|| format!("Failed to serialize {} row", row.category()))?;

        self.conn.execute(
            r#"
            INSERT INTO records (run_label, episode_no, category, as_of, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                self.run_label,
                episode_no,
                row.category().as_str(),
                row.as_of(),
                payload,
            ],
        )?;

        if let RecordRow::EpisodeSummary(summary) = row {
            self.insert_summary(episode_no, summary, &payload)?;
        }
        Ok(())
    }
}
