//! SQLite-backed [`BinStore`].
//!
//! Timestamps are stored as epoch milliseconds. Every write is a single
//! statement or a short transaction touching one bin, so writes for
//! different bins never wait on a store-wide lock beyond SQLite's own
//! writer serialization. A worker step lands in one transaction.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, Row, Sqlite};
use tracing::info;
use uuid::Uuid;

use binwatch_core::model::{
    AlertEvent, AlertId, AlertSeverity, BinId, BinReading, BinState, BinStatus, CommandId,
    CommandKind, CommandRecord, CommandStatus, Transition,
};
use binwatch_core::ports::{BinStore, StepWrite, StoreError};

const SCHEMA: [&str; 8] = [
    "
    CREATE TABLE IF NOT EXISTS bin_state (
        bin_id TEXT PRIMARY KEY,
        last_fill_percent REAL NOT NULL,
        status TEXT NOT NULL,
        last_reading_at INTEGER NOT NULL,
        last_transition_at INTEGER NOT NULL,
        consecutive_high_readings INTEGER NOT NULL,
        status_before_offline TEXT,
        failed_attempts INTEGER NOT NULL DEFAULT 0,
        retry_not_before INTEGER
    )
    ",
    "
    CREATE TABLE IF NOT EXISTS alert_event (
        alert_id TEXT PRIMARY KEY,
        bin_id TEXT NOT NULL,
        severity TEXT NOT NULL,
        triggering_fill_percent REAL NOT NULL,
        created_at INTEGER NOT NULL,
        acknowledged INTEGER NOT NULL DEFAULT 0
    )
    ",
    "
    CREATE TABLE IF NOT EXISTS command_record (
        command_id TEXT PRIMARY KEY,
        bin_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        issued_at INTEGER NOT NULL,
        published_at INTEGER,
        resolved_at INTEGER
    )
    ",
    "
    CREATE INDEX IF NOT EXISTS idx_command_record_status
    ON command_record(status)
    ",
    "
    CREATE TABLE IF NOT EXISTS bin_reading (
        bin_id TEXT NOT NULL,
        source_sequence INTEGER NOT NULL,
        fill_percent REAL NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (bin_id, source_sequence)
    )
    ",
    "
    CREATE TABLE IF NOT EXISTS bin_transition (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bin_id TEXT NOT NULL,
        from_status TEXT NOT NULL,
        to_status TEXT NOT NULL,
        at INTEGER NOT NULL
    )
    ",
    "
    CREATE INDEX IF NOT EXISTS idx_bin_transition_bin
    ON bin_transition(bin_id, id)
    ",
    "
    CREATE TABLE IF NOT EXISTS bin_tombstone (
        bin_id TEXT PRIMARY KEY,
        deregistered_at INTEGER NOT NULL
    )
    ",
];

#[derive(Debug, Clone)]
/// Durable store on a single SQLite database file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create the database at `path` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the file cannot be opened or the
    /// schema cannot be created.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Backend(format!("failed to create database directory: {err}"))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Backend(format!("failed to connect: {err}")))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!(path = %path.display(), "sqlite store ready");
        Ok(store)
    }

    /// Open a private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(backend)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| StoreError::Backend(format!("failed to create schema: {err}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BinStore for SqliteStore {
    async fn save_state(&self, state: &BinState) -> Result<(), StoreError> {
        write_state(&self.pool, state).await
    }

    async fn load_state(&self, bin_id: &BinId) -> Result<Option<BinState>, StoreError> {
        sqlx::query("SELECT * FROM bin_state WHERE bin_id = ?")
            .bind(bin_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .as_ref()
            .map(row_to_state)
            .transpose()
    }

    async fn load_all_states(&self) -> Result<Vec<BinState>, StoreError> {
        sqlx::query("SELECT * FROM bin_state ORDER BY bin_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(row_to_state)
            .collect()
    }

    async fn commit_step(&self, step: &StepWrite) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        if let Some(reading) = &step.reading {
            write_reading(&mut *tx, reading).await?;
        }
        if let Some(alert) = &step.alert {
            write_alert(&mut *tx, alert).await?;
        }
        for transition in &step.transitions {
            write_transition(&mut *tx, transition).await?;
        }
        if let Some(record) = &step.command {
            write_command(&mut *tx, record).await?;
        }
        write_state(&mut *tx, &step.state).await?;
        tx.commit().await.map_err(backend)
    }

    async fn delete_bin(&self, bin_id: &BinId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(
            "
            INSERT INTO bin_tombstone (bin_id, deregistered_at) VALUES (?, ?)
            ON CONFLICT(bin_id) DO UPDATE SET deregistered_at = excluded.deregistered_at
            ",
        )
        .bind(bin_id.as_str())
        .bind(at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        sqlx::query(
            "
            UPDATE command_record SET status = 'failed', resolved_at = ?
            WHERE bin_id = ? AND status = 'pending'
            ",
        )
        .bind(at.timestamp_millis())
        .bind(bin_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        for statement in [
            "DELETE FROM bin_state WHERE bin_id = ?",
            "DELETE FROM bin_reading WHERE bin_id = ?",
            "DELETE FROM bin_transition WHERE bin_id = ?",
        ] {
            sqlx::query(statement)
                .bind(bin_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn append_alert(&self, alert: &AlertEvent) -> Result<(), StoreError> {
        write_alert(&self.pool, alert).await
    }

    async fn acknowledge_alert(
        &self,
        bin_id: &BinId,
        alert_id: &AlertId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "
            UPDATE alert_event SET acknowledged = 1
            WHERE alert_id = ? AND bin_id = ? AND acknowledged = 0
            ",
        )
        .bind(alert_id.0.to_string())
        .bind(bin_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_alerts(&self) -> Result<Vec<AlertEvent>, StoreError> {
        sqlx::query("SELECT * FROM alert_event WHERE acknowledged = 0 ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(row_to_alert)
            .collect()
    }

    async fn save_command(&self, record: &CommandRecord) -> Result<(), StoreError> {
        write_command(&self.pool, record).await
    }

    async fn load_all_pending(&self) -> Result<Vec<CommandRecord>, StoreError> {
        sqlx::query("SELECT * FROM command_record WHERE status = 'pending' ORDER BY issued_at")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(row_to_command)
            .collect()
    }

    async fn append_reading(&self, reading: &BinReading) -> Result<(), StoreError> {
        write_reading(&self.pool, reading).await
    }

    async fn recent_readings(
        &self,
        bin_id: &BinId,
        limit: usize,
    ) -> Result<Vec<BinReading>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut readings = sqlx::query(
            "
            SELECT * FROM bin_reading
            WHERE bin_id = ?
            ORDER BY source_sequence DESC
            LIMIT ?
            ",
        )
        .bind(bin_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .iter()
        .map(row_to_reading)
        .collect::<Result<Vec<_>, _>>()?;
        readings.reverse();
        Ok(readings)
    }

    async fn append_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        write_transition(&self.pool, transition).await
    }

    async fn transitions(&self, bin_id: &BinId) -> Result<Vec<Transition>, StoreError> {
        sqlx::query("SELECT * FROM bin_transition WHERE bin_id = ? ORDER BY id")
            .bind(bin_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(row_to_transition)
            .collect()
    }
}

async fn write_state<'conn, E>(executor: E, state: &BinState) -> Result<(), StoreError>
where
    E: Executor<'conn, Database = Sqlite>,
{
    sqlx::query(
        "
        INSERT INTO bin_state (
            bin_id, last_fill_percent, status, last_reading_at, last_transition_at,
            consecutive_high_readings, status_before_offline, failed_attempts, retry_not_before
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(bin_id) DO UPDATE SET
            last_fill_percent = excluded.last_fill_percent,
            status = excluded.status,
            last_reading_at = excluded.last_reading_at,
            last_transition_at = excluded.last_transition_at,
            consecutive_high_readings = excluded.consecutive_high_readings,
            status_before_offline = excluded.status_before_offline,
            failed_attempts = excluded.failed_attempts,
            retry_not_before = excluded.retry_not_before
        ",
    )
    .bind(state.bin_id.as_str())
    .bind(state.last_fill_percent)
    .bind(state.status.as_str())
    .bind(state.last_reading_timestamp.timestamp_millis())
    .bind(state.last_transition_timestamp.timestamp_millis())
    .bind(i64::from(state.consecutive_high_readings))
    .bind(state.status_before_offline.map(BinStatus::as_str))
    .bind(i64::from(state.failed_attempts))
    .bind(state.retry_not_before.map(|at| at.timestamp_millis()))
    .execute(executor)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn write_alert<'conn, E>(executor: E, alert: &AlertEvent) -> Result<(), StoreError>
where
    E: Executor<'conn, Database = Sqlite>,
{
    sqlx::query(
        "
        INSERT INTO alert_event (
            alert_id, bin_id, severity, triggering_fill_percent, created_at, acknowledged
        )
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(alert_id) DO NOTHING
        ",
    )
    .bind(alert.alert_id.0.to_string())
    .bind(alert.bin_id.as_str())
    .bind(alert.severity.as_str())
    .bind(alert.triggering_fill_percent)
    .bind(alert.created_at.timestamp_millis())
    .bind(alert.acknowledged)
    .execute(executor)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn write_command<'conn, E>(executor: E, record: &CommandRecord) -> Result<(), StoreError>
where
    E: Executor<'conn, Database = Sqlite>,
{
    sqlx::query(
        "
        INSERT INTO command_record (
            command_id, bin_id, kind, status, issued_at, published_at, resolved_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(command_id) DO UPDATE SET
            status = excluded.status,
            published_at = excluded.published_at,
            resolved_at = excluded.resolved_at
        ",
    )
    .bind(record.command_id.0.to_string())
    .bind(record.bin_id.as_str())
    .bind(record.kind.as_str())
    .bind(record.status.as_str())
    .bind(record.issued_at.timestamp_millis())
    .bind(record.published_at.map(|at| at.timestamp_millis()))
    .bind(record.resolved_at.map(|at| at.timestamp_millis()))
    .execute(executor)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn write_reading<'conn, E>(executor: E, reading: &BinReading) -> Result<(), StoreError>
where
    E: Executor<'conn, Database = Sqlite>,
{
    sqlx::query(
        "
        INSERT INTO bin_reading (bin_id, source_sequence, fill_percent, recorded_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(bin_id, source_sequence) DO NOTHING
        ",
    )
    .bind(reading.bin_id.as_str())
    .bind(sequence_to_db(reading.source_sequence)?)
    .bind(reading.fill_percent)
    .bind(reading.timestamp.timestamp_millis())
    .execute(executor)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn write_transition<'conn, E>(executor: E, transition: &Transition) -> Result<(), StoreError>
where
    E: Executor<'conn, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO bin_transition (bin_id, from_status, to_status, at) VALUES (?, ?, ?, ?)",
    )
    .bind(transition.bin_id.as_str())
    .bind(transition.from.as_str())
    .bind(transition.to.as_str())
    .bind(transition.at.timestamp_millis())
    .execute(executor)
    .await
    .map_err(backend)?;
    Ok(())
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn column<'row, T>(row: &'row SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'row, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|err| StoreError::Corrupt(format!("column {name}: {err}")))
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis} out of range")))
}

fn parse<T: FromStr>(value: &str, what: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_unknown| StoreError::Corrupt(format!("unknown {what} {value:?}")))
}

fn uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Corrupt(format!("bad id {value:?}: {err}")))
}

fn counter(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_overflow| StoreError::Corrupt(format!("counter {value} out of range")))
}

fn sequence_to_db(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence).map_err(|_overflow| {
        StoreError::Backend(format!("sequence {sequence} exceeds storage range"))
    })
}

fn row_to_state(row: &SqliteRow) -> Result<BinState, StoreError> {
    let status: String = column(row, "status")?;
    let before: Option<String> = column(row, "status_before_offline")?;
    let retry: Option<i64> = column(row, "retry_not_before")?;

    Ok(BinState {
        bin_id: BinId::new(column::<String>(row, "bin_id")?),
        last_fill_percent: column(row, "last_fill_percent")?,
        status: parse(&status, "status")?,
        last_reading_timestamp: timestamp(column(row, "last_reading_at")?)?,
        last_transition_timestamp: timestamp(column(row, "last_transition_at")?)?,
        consecutive_high_readings: counter(column(row, "consecutive_high_readings")?)?,
        status_before_offline: before
            .map(|value| parse::<BinStatus>(&value, "status"))
            .transpose()?,
        failed_attempts: counter(column(row, "failed_attempts")?)?,
        retry_not_before: retry.map(timestamp).transpose()?,
    })
}

fn row_to_alert(row: &SqliteRow) -> Result<AlertEvent, StoreError> {
    let alert_id: String = column(row, "alert_id")?;
    let severity: String = column(row, "severity")?;

    Ok(AlertEvent {
        alert_id: AlertId(uuid(&alert_id)?),
        bin_id: BinId::new(column::<String>(row, "bin_id")?),
        severity: parse::<AlertSeverity>(&severity, "severity")?,
        triggering_fill_percent: column(row, "triggering_fill_percent")?,
        created_at: timestamp(column(row, "created_at")?)?,
        acknowledged: column(row, "acknowledged")?,
    })
}

fn row_to_command(row: &SqliteRow) -> Result<CommandRecord, StoreError> {
    let command_id: String = column(row, "command_id")?;
    let kind: String = column(row, "kind")?;
    let status: String = column(row, "status")?;
    let published: Option<i64> = column(row, "published_at")?;
    let resolved: Option<i64> = column(row, "resolved_at")?;

    Ok(CommandRecord {
        command_id: CommandId(uuid(&command_id)?),
        bin_id: BinId::new(column::<String>(row, "bin_id")?),
        kind: parse::<CommandKind>(&kind, "command kind")?,
        issued_at: timestamp(column(row, "issued_at")?)?,
        status: parse::<CommandStatus>(&status, "command status")?,
        published_at: published.map(timestamp).transpose()?,
        resolved_at: resolved.map(timestamp).transpose()?,
    })
}

fn row_to_reading(row: &SqliteRow) -> Result<BinReading, StoreError> {
    let sequence: i64 = column(row, "source_sequence")?;

    Ok(BinReading {
        bin_id: BinId::new(column::<String>(row, "bin_id")?),
        fill_percent: column(row, "fill_percent")?,
        timestamp: timestamp(column(row, "recorded_at")?)?,
        source_sequence: u64::try_from(sequence).map_err(|_negative| {
            StoreError::Corrupt(format!("negative sequence {sequence}"))
        })?,
    })
}

fn row_to_transition(row: &SqliteRow) -> Result<Transition, StoreError> {
    let from: String = column(row, "from_status")?;
    let to: String = column(row, "to_status")?;

    Ok(Transition {
        bin_id: BinId::new(column::<String>(row, "bin_id")?),
        from: parse(&from, "status")?,
        to: parse(&to, "status")?,
        at: timestamp(column(row, "at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap_or_default()
    }

    fn state(bin: &str, status: BinStatus) -> BinState {
        BinState {
            status,
            last_fill_percent: 72.5,
            consecutive_high_readings: 1,
            ..BinState::new(BinId::new(bin), at(0))
        }
    }

    fn alert(bin: &str, trigger: &str) -> AlertEvent {
        AlertEvent {
            alert_id: AlertId::derive(&BinId::new(bin), trigger, AlertSeverity::Warning),
            bin_id: BinId::new(bin),
            severity: AlertSeverity::Warning,
            triggering_fill_percent: 72.5,
            created_at: at(10),
            acknowledged: false,
        }
    }

    fn command(bin: &str, status: CommandStatus) -> CommandRecord {
        CommandRecord {
            command_id: CommandId::generate(),
            bin_id: BinId::new(bin),
            kind: CommandKind::EmptyBin,
            issued_at: at(20),
            status,
            published_at: None,
            resolved_at: None,
        }
    }

    fn reading(bin: &str, seq: u64) -> BinReading {
        BinReading {
            bin_id: BinId::new(bin),
            fill_percent: 40.0,
            timestamp: at(i64::try_from(seq).unwrap_or_default()),
            source_sequence: seq,
        }
    }

    #[tokio::test]
    async fn state_round_trips_with_optional_fields() {
        let store = SqliteStore::in_memory().await.expect("store");
        let mut saved = state("B1", BinStatus::Offline);
        saved.status_before_offline = Some(BinStatus::Critical);
        saved.failed_attempts = 2;
        saved.retry_not_before = Some(at(0) + TimeDelta::seconds(40));

        store.save_state(&saved).await.expect("save");
        saved.last_fill_percent = 80.0;
        store.save_state(&saved).await.expect("overwrite");

        assert_eq!(
            store.load_state(&BinId::new("B1")).await.expect("load"),
            Some(saved)
        );
        assert_eq!(store.load_state(&BinId::new("B2")).await.expect("load"), None);
    }

    #[tokio::test]
    async fn alerts_insert_once_and_acknowledge() {
        let store = SqliteStore::in_memory().await.expect("store");
        let first = alert("B1", "reading-1");

        store.append_alert(&first).await.expect("append");
        store.append_alert(&first).await.expect("append again");
        store.append_alert(&alert("B1", "reading-2")).await.expect("append other");
        assert_eq!(store.active_alerts().await.expect("active").len(), 2);

        assert!(
            !store
                .acknowledge_alert(&BinId::new("B2"), &first.alert_id)
                .await
                .expect("ack foreign")
        );
        assert!(store.acknowledge_alert(&first.bin_id, &first.alert_id).await.expect("ack"));
        assert!(
            !store.acknowledge_alert(&first.bin_id, &first.alert_id).await.expect("ack again"),
            "a repeated acknowledgement changes nothing"
        );
        assert!(
            !store
                .acknowledge_alert(
                    &BinId::new("B9"),
                    &AlertId::derive(&BinId::new("B9"), "x", AlertSeverity::Offline)
                )
                .await
                .expect("ack unknown")
        );
        assert_eq!(store.active_alerts().await.expect("active").len(), 1);
    }

    #[tokio::test]
    async fn only_pending_commands_are_loaded() {
        let store = SqliteStore::in_memory().await.expect("store");
        let mut pending = command("B1", CommandStatus::Pending);
        store.save_command(&pending).await.expect("save");
        store
            .save_command(&command("B2", CommandStatus::Acknowledged))
            .await
            .expect("save");

        let loaded = store.load_all_pending().await.expect("pending");
        assert_eq!(loaded, vec![pending.clone()]);

        pending.status = CommandStatus::TimedOut;
        pending.resolved_at = Some(at(60));
        store.save_command(&pending).await.expect("resolve");
        assert!(store.load_all_pending().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn readings_are_idempotent_and_windowed() {
        let store = SqliteStore::in_memory().await.expect("store");
        for seq in [1, 2, 3, 3, 4] {
            store.append_reading(&reading("B1", seq)).await.expect("append");
        }

        let recent = store
            .recent_readings(&BinId::new("B1"), 2)
            .await
            .expect("recent");
        let sequences: Vec<u64> = recent.iter().map(|reading| reading.source_sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[tokio::test]
    async fn step_commit_is_all_or_nothing() {
        let store = SqliteStore::in_memory().await.expect("store");
        let bin = BinId::new("B1");
        let step = StepWrite {
            reading: Some(reading("B1", 1)),
            alert: Some(alert("B1", "reading-1")),
            transitions: vec![Transition {
                bin_id: bin.clone(),
                from: BinStatus::Normal,
                to: BinStatus::Warning,
                at: at(1),
            }],
            command: Some(command("B1", CommandStatus::Pending)),
            ..StepWrite::state(state("B1", BinStatus::Warning))
        };

        store.commit_step(&step).await.expect("commit");
        assert!(store.load_state(&bin).await.expect("state").is_some());
        assert_eq!(store.active_alerts().await.expect("alerts").len(), 1);
        assert_eq!(store.transitions(&bin).await.expect("transitions").len(), 1);
        assert_eq!(store.load_all_pending().await.expect("pending").len(), 1);

        sqlx::query("DROP TABLE bin_state")
            .execute(&store.pool)
            .await
            .expect("drop");
        let other = StepWrite {
            reading: Some(reading("B2", 1)),
            alert: Some(alert("B2", "reading-1")),
            ..StepWrite::state(state("B2", BinStatus::Warning))
        };
        assert!(store.commit_step(&other).await.is_err());
        assert_eq!(store.active_alerts().await.expect("alerts").len(), 1, "no orphan alert");
        assert!(
            store
                .recent_readings(&BinId::new("B2"), 10)
                .await
                .expect("readings")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn delete_bin_tombstones_and_keeps_history() {
        let store = SqliteStore::in_memory().await.expect("store");
        let bin = BinId::new("B1");
        let pending = command("B1", CommandStatus::Pending);
        store.save_state(&state("B1", BinStatus::Warning)).await.expect("state");
        store.append_reading(&reading("B1", 1)).await.expect("reading");
        store.append_alert(&alert("B1", "reading-1")).await.expect("alert");
        store
            .append_transition(&Transition {
                bin_id: bin.clone(),
                from: BinStatus::Normal,
                to: BinStatus::Warning,
                at: at(5),
            })
            .await
            .expect("transition");
        store.save_command(&pending).await.expect("pending");
        store.save_state(&state("B2", BinStatus::Normal)).await.expect("other");

        store.delete_bin(&bin, at(30)).await.expect("delete");

        assert_eq!(store.load_state(&bin).await.expect("load"), None);
        assert!(store.recent_readings(&bin, 10).await.expect("readings").is_empty());
        assert!(store.transitions(&bin).await.expect("transitions").is_empty());
        assert!(store.load_all_pending().await.expect("pending").is_empty());
        assert_eq!(store.load_all_states().await.expect("states").len(), 1);
        assert_eq!(store.active_alerts().await.expect("alerts").len(), 1, "alerts are kept");

        let status: String = sqlx::query_scalar("SELECT status FROM command_record WHERE command_id = ?")
            .bind(pending.command_id.0.to_string())
            .fetch_one(&store.pool)
            .await
            .expect("command kept");
        assert_eq!(status, "failed");

        let orphans: i64 = sqlx::query_scalar(
            "
            SELECT COUNT(*) FROM alert_event
            WHERE bin_id NOT IN (SELECT bin_id FROM bin_state)
              AND bin_id NOT IN (SELECT bin_id FROM bin_tombstone)
            ",
        )
        .fetch_one(&store.pool)
        .await
        .expect("count");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("data").join("binwatch.db");

        let store = SqliteStore::connect(&path).await.expect("open");
        store.save_state(&state("B1", BinStatus::Critical)).await.expect("save");
        store
            .save_command(&command("B1", CommandStatus::Pending))
            .await
            .expect("command");
        store.close().await;

        let reopened = SqliteStore::connect(&path).await.expect("reopen");
        let states = reopened.load_all_states().await.expect("states");
        assert_eq!(states.len(), 1);
        assert_eq!(states.first().map(|state| state.status), Some(BinStatus::Critical));
        assert_eq!(reopened.load_all_pending().await.expect("pending").len(), 1);
    }
}
