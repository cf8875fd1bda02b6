use anyhow::Context;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};

use crate::error::Result;
use crate::telemetry::{unix_now, Reading};

/// Schema, created idempotently at startup.  No versioned migrations: the
/// three relations never change shape.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp REAL NOT NULL,
        voltage   REAL NOT NULL,
        current   REAL NOT NULL,
        power     REAL NOT NULL,
        status    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_measurements_ts ON measurements (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS daily_summary (
        date TEXT PRIMARY KEY,
        kwh  REAL NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp REAL NOT NULL,
        level     TEXT NOT NULL,
        message   TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logs_ts ON logs (timestamp)",
];

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Measurement {
    pub id: i64,
    pub timestamp: f64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct DailySummary {
    pub date: String, // YYYY-MM-DD
    pub kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct LogEvent {
    pub id: i64,
    pub timestamp: f64,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/power/power_monitor.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    ///
    /// `busy_timeout` bounds both sqlite lock waits and pool acquisition, so
    /// a locked store surfaces as an error instead of a hang.
    pub async fn connect(db_url: &str, busy_timeout: Duration) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(busy_timeout)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn init_schema(&self) -> anyhow::Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("failed to create schema")?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Calendar date (`YYYY-MM-DD`) of a unix timestamp at the given offset.
    pub fn day_key(ts: f64, offset: UtcOffset) -> String {
        let utc = OffsetDateTime::from_unix_timestamp(ts.floor() as i64)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let local = utc.to_offset(offset);
        format!(
            "{:04}-{:02}-{:02}",
            local.year(),
            local.month() as u8,
            local.day()
        )
    }

    // ----------------------------
    // Measurements
    // ----------------------------

    pub async fn insert_measurement(&self, r: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO measurements (timestamp, voltage, current, power, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp)
        .bind(r.voltage)
        .bind(r.current)
        .bind(r.power)
        .bind(r.status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_measurements(&self, limit: i64) -> Result<Vec<Measurement>> {
        let rows = sqlx::query_as::<_, Measurement>(
            r#"
            SELECT id, timestamp, voltage, current, power, status
            FROM measurements
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // Daily energy
    // ----------------------------

    /// Add `increment` kWh to `date`, creating the row if needed.  One
    /// statement, so concurrent calls for the same day never lose an update.
    pub async fn upsert_daily_energy(&self, date: &str, increment: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_summary (date, kwh) VALUES (?, ?)
            ON CONFLICT(date) DO UPDATE SET kwh = kwh + excluded.kwh
            "#,
        )
        .bind(date)
        .bind(increment)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 0.0 for a day with no row.
    pub async fn get_daily_kwh(&self, date: &str) -> Result<f64> {
        let kwh = sqlx::query_scalar::<_, f64>("SELECT kwh FROM daily_summary WHERE date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(kwh.unwrap_or(0.0))
    }

    /// The `limit` most recent days, ascending by date.
    pub async fn recent_daily_summaries(&self, limit: i64) -> Result<Vec<DailySummary>> {
        let mut rows = sqlx::query_as::<_, DailySummary>(
            r#"
            SELECT date, kwh
            FROM daily_summary
            ORDER BY date DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Every day on record, ascending by date.
    pub async fn all_daily_summaries(&self) -> Result<Vec<DailySummary>> {
        let rows =
            sqlx::query_as::<_, DailySummary>("SELECT date, kwh FROM daily_summary ORDER BY date")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // ----------------------------
    // Event log
    // ----------------------------

    pub async fn append_log(&self, level: LogLevel, message: &str) -> Result<()> {
        self.append_log_at(unix_now(), level, message).await
    }

    pub async fn append_log_at(&self, ts: f64, level: LogLevel, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO logs (timestamp, level, message) VALUES (?, ?, ?)")
            .bind(ts)
            .bind(level.as_str())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<LogEvent>> {
        let rows = sqlx::query_as::<_, LogEvent>(
            r#"
            SELECT id, timestamp, level, message
            FROM logs
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// WARNING and ERROR events at or after `since`, newest first.
    pub async fn recent_faults(&self, since: f64, limit: i64) -> Result<Vec<LogEvent>> {
        let rows = sqlx::query_as::<_, LogEvent>(
            r#"
            SELECT id, timestamp, level, message
            FROM logs
            WHERE level IN ('WARNING', 'ERROR') AND timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // Administration
    // ----------------------------

    /// Administrative reset: drop all measurements and daily totals in one
    /// transaction.  The event log is kept.
    pub async fn reset_history(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM daily_summary")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM measurements")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
