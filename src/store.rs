//! SQLite result store for post-run analysis. The checkpoint file is the
//! source of truth for resumability; these tables are the queryable view
//! of every forecast and per-horizon outcome.

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::state::{now_ts, ForecastRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonStatus {
    Scored,
    NoResolution,
    Failed,
}

impl HorizonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HorizonStatus::Scored => "scored",
            HorizonStatus::NoResolution => "no_resolution",
            HorizonStatus::Failed => "failed",
        }
    }
}

/// One (question, horizon) outcome row. `record` is present unless the
/// session failed; `brier`/`actual` are present only when scored.
pub struct OutcomeRow<'a> {
    pub question_id: &'a str,
    pub horizon_days: u32,
    pub status: HorizonStatus,
    pub record: Option<&'a ForecastRecord>,
    pub brier: Option<f64>,
    pub actual: Option<f64>,
    pub reason: Option<&'a str>,
}

pub struct ResultStore {
    conn: Connection,
}

impl ResultStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS forecasts (
                ts INTEGER NOT NULL,
                question_id TEXT NOT NULL,
                horizon_days INTEGER NOT NULL,
                probability REAL NOT NULL,
                confidence TEXT NOT NULL,
                rationale TEXT NOT NULL,
                evidence_count INTEGER NOT NULL,
                search_count INTEGER NOT NULL,
                cutoff_date TEXT NOT NULL,
                resolution_date TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS outcomes (
                ts INTEGER NOT NULL,
                question_id TEXT NOT NULL,
                horizon_days INTEGER NOT NULL,
                status TEXT NOT NULL,
                brier REAL,
                actual REAL,
                reason TEXT
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Persist every horizon of one finished question in one transaction.
    pub fn persist_question(&mut self, rows: &[OutcomeRow]) -> Result<()> {
        let ts = now_ts() as i64;
        let tx = self.conn.transaction()?;
        for row in rows {
            if let Some(r) = row.record {
                tx.execute(
                    "INSERT INTO forecasts (ts, question_id, horizon_days, probability, confidence,
                     rationale, evidence_count, search_count, cutoff_date, resolution_date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        ts,
                        r.question_id,
                        r.horizon_days as i64,
                        r.probability,
                        r.confidence,
                        r.rationale,
                        r.evidence_count as i64,
                        r.search_count as i64,
                        r.cutoff_date,
                        r.resolution_date
                    ],
                )?;
            }
            tx.execute(
                "INSERT INTO outcomes (ts, question_id, horizon_days, status, brier, actual, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ts,
                    row.question_id,
                    row.horizon_days as i64,
                    row.status.as_str(),
                    row.brier,
                    row.actual,
                    row.reason
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count_outcomes(&self, status: HorizonStatus) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outcomes WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}
