use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

use crate::device::DeviceId;

/// Fixed-width UTC timestamp so that text comparison in SQL matches
/// chronological order.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

const INSERT_USAGE: &str = "INSERT INTO usage (time, device, runtime_sec) VALUES (?1, ?2, ?3)";

const SELECT_USAGE_SINCE: &str = r"
    SELECT time, device, runtime_sec
    FROM usage
    WHERE time >= ?1 AND (?2 IS NULL OR device = ?2)
    ORDER BY time DESC
";

#[derive(Clone)]
pub struct UsageStore {
    pool: Pool<Sqlite>,
}

/// One completed relay run as reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub device: DeviceId,
    pub runtime_sec: u32,
}

pub fn format_timestamp(ts: OffsetDateTime) -> Result<String> {
    ts.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .context("failed to format usage timestamp")
}

/// `now` minus `hours`, or an error when that falls outside the
/// representable date range.
pub fn window_start(now: OffsetDateTime, hours: u32) -> Result<OffsetDateTime> {
    now.checked_sub(time::Duration::hours(i64::from(hours)))
        .with_context(|| format!("a {hours}h window reaches past the supported date range"))
}

pub fn parse_timestamp(text: &str) -> Result<OffsetDateTime> {
    let ts = PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
        .with_context(|| format!("invalid usage timestamp: {text}"))?;
    Ok(ts.assume_utc())
}

/// Row shape as stored; device and timestamp are validated afterwards so a
/// single corrupt row doesn't fail the whole query.
struct StoredRow {
    time: String,
    device: String,
    runtime_sec: i64,
}

impl<'r> FromRow<'r, SqliteRow> for StoredRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            time: row.try_get("time")?,
            device: row.try_get("device")?,
            runtime_sec: row.try_get("runtime_sec")?,
        })
    }
}

impl StoredRow {
    fn into_record(self) -> Result<UsageRecord> {
        let device = self
            .device
            .parse::<DeviceId>()
            .map_err(|e| anyhow::anyhow!("unknown device in usage row: {}", e.0))?;
        let runtime_sec = u32::try_from(self.runtime_sec)
            .with_context(|| format!("runtime_sec out of range: {}", self.runtime_sec))?;
        Ok(UsageRecord {
            timestamp: parse_timestamp(&self.time)?,
            device,
            runtime_sec,
        })
    }
}

impl UsageStore {
    /// db_url examples:
    /// - "sqlite:/home/pi/smartfarm/smartfarm.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" opens its own empty database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Writes
    // ----------------------------

    /// Append one record. A single INSERT, so it is atomic on its own.
    pub async fn append(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(INSERT_USAGE)
            .bind(format_timestamp(record.timestamp)?)
            .bind(record.device.as_str())
            .bind(i64::from(record.runtime_sec))
            .execute(&self.pool)
            .await
            .context("append usage failed")?;
        Ok(())
    }

    // ----------------------------
    // Windowed queries
    // ----------------------------

    /// Records with `timestamp >= since`, newest first, optionally for one
    /// device only. Rows that no longer decode are skipped with a warning.
    pub async fn since(
        &self,
        since: OffsetDateTime,
        device: Option<DeviceId>,
    ) -> Result<Vec<UsageRecord>> {
        let rows: Vec<StoredRow> = sqlx::query_as(SELECT_USAGE_SINCE)
            .bind(format_timestamp(since)?)
            .bind(device.map(DeviceId::as_str))
            .fetch_all(&self.pool)
            .await
            .context("usage query failed")?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("skipping unreadable usage row: {e:#}");
                    None
                }
            })
            .collect())
    }

    /// Records from the trailing `hours` window ending now.
    pub async fn recent(&self, hours: u32) -> Result<Vec<UsageRecord>> {
        let since = window_start(OffsetDateTime::now_utc(), hours)?;
        self.since(since, None).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
