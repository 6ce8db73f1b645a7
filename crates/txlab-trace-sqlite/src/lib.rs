#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::debug;
use txlab_domain::{
    compute_event_hash, now_utc, AggregateRead, Anomaly, AnomalyType, EventType, FailureReason,
    IsolationLevel, Pacing, RunId, RunRecord, ScenarioKind, ScenarioResult, Severity, TraceEvent,
    TxId,
};
use txlab_trace_core::{EventRow, TraceStore};
use ulid::Ulid;

const TRACE_SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  scenario TEXT NOT NULL,
  isolation_level TEXT NOT NULL,
  operand_a INTEGER NOT NULL,
  operand_b INTEGER NOT NULL,
  pacing TEXT NOT NULL CHECK (pacing IN ('rendezvous','timed')),
  started_at TEXT NOT NULL,
  ended_at TEXT,
  result_json TEXT
);

CREATE TABLE IF NOT EXISTS trace_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  tx_id TEXT NOT NULL,
  tx_name TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('BEGIN','READ','WRITE','COMMIT','ROLLBACK')),
  table_name TEXT,
  record_key TEXT,
  old_value TEXT,
  new_value TEXT,
  sequence_order INTEGER NOT NULL,
  aggregate_json TEXT,
  observed_uncommitted INTEGER NOT NULL DEFAULT 0 CHECK (observed_uncommitted IN (0,1)),
  failure_reason TEXT,
  notes TEXT,
  recorded_at TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  UNIQUE(run_id, sequence_order),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS anomalies (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  anomaly_index INTEGER NOT NULL,
  anomaly_type TEXT NOT NULL,
  severity TEXT NOT NULL,
  description TEXT NOT NULL,
  affected_json TEXT NOT NULL,
  event_sequence_json TEXT NOT NULL,
  detected_at TEXT NOT NULL,
  UNIQUE(run_id, anomaly_index),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_trace_events_run_seq ON trace_events(run_id, sequence_order);
CREATE INDEX IF NOT EXISTS idx_anomalies_run ON anomalies(run_id, anomaly_index);

CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_update
BEFORE UPDATE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_delete
BEFORE DELETE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_anomalies_no_update
BEFORE UPDATE ON anomalies
BEGIN
  SELECT RAISE(FAIL, 'anomalies is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_anomalies_no_delete
BEFORE DELETE ON anomalies
BEGIN
  SELECT RAISE(FAIL, 'anomalies is append-only');
END;
";

const EVENT_COLUMNS: &str = "run_id, tx_id, tx_name, event_type, table_name, record_key,
    old_value, new_value, sequence_order, aggregate_json, observed_uncommitted,
    failure_reason, notes, recorded_at, prev_event_hash, event_hash";

pub struct SqliteTraceStore {
    conn: Connection,
}

impl SqliteTraceStore {
    /// Open or create a `SQLite` trace database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    fn last_event_link(&self, run_id: RunId) -> Result<Option<(u64, String)>> {
        self.conn
            .query_row(
                "SELECT sequence_order, event_hash FROM trace_events
                 WHERE run_id = ?1
                 ORDER BY sequence_order DESC
                 LIMIT 1",
                params![run_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to read previous trace event")?
            .map(|(sequence, hash)| Ok((sql_to_sequence(sequence)?, hash)))
            .transpose()
    }
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply trace schema")?;

        // Columns added when rollback reasons and aggregate reads became structured.
        ensure_column(&self.conn, "trace_events", "aggregate_json", "TEXT")?;
        ensure_column(
            &self.conn,
            "trace_events",
            "observed_uncommitted",
            "INTEGER NOT NULL DEFAULT 0 CHECK (observed_uncommitted IN (0,1))",
        )?;
        ensure_column(&self.conn, "trace_events", "failure_reason", "TEXT")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACE_SCHEMA_VERSION, now],
            )
            .context("failed to record trace migration")?;

        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs(
                    run_id, scenario, isolation_level, operand_a, operand_b,
                    pacing, started_at, ended_at, result_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.run_id.to_string(),
                    run.scenario.as_str(),
                    run.isolation.as_str(),
                    run.operand_a,
                    run.operand_b,
                    run.pacing.as_str(),
                    rfc3339(run.started_at)?,
                    run.ended_at.map(rfc3339).transpose()?,
                    run.result_json
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn finish_run(&self, run_id: RunId, result: &ScenarioResult) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET ended_at = ?2, result_json = ?3 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    rfc3339(now_utc())?,
                    serde_json::to_string(result)?,
                ],
            )
            .context("failed to update run result")?;
        if changed == 0 {
            bail!("run {run_id} does not exist");
        }
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, scenario, isolation_level, operand_a, operand_b,
                pacing, started_at, ended_at, result_json
             FROM runs
             ORDER BY started_at ASC, run_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, scenario, isolation_level, operand_a, operand_b,
                pacing, started_at, ended_at, result_json
             FROM runs
             WHERE run_id = ?1",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let row = rows.next()?;
        row.map(run_from_row).transpose()
    }

    fn append_event(&self, event: &TraceEvent) -> Result<EventRow> {
        let previous = self.last_event_link(event.run_id)?;
        if let Some((last_sequence, _)) = &previous {
            if event.sequence_order <= *last_sequence {
                bail!(
                    "sequence_order {} for run {} does not follow {}",
                    event.sequence_order,
                    event.run_id,
                    last_sequence
                );
            }
        }
        let prev_event_hash = previous.map(|(_, hash)| hash);
        let event_hash = compute_event_hash(event, prev_event_hash.as_deref())?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO trace_events({EVENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    event.run_id.to_string(),
                    event.tx_id.to_string(),
                    event.tx_name,
                    event.event_type.as_str(),
                    event.table_name,
                    event.record_key,
                    event.old_value,
                    event.new_value,
                    sequence_to_sql(event.sequence_order)?,
                    event
                        .aggregate
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    bool_to_sql(event.observed_uncommitted),
                    event.failure.map(FailureReason::as_str),
                    event.notes,
                    rfc3339(event.timestamp)?,
                    prev_event_hash,
                    event_hash,
                ],
            )
            .context("failed to append trace event")?;

        debug!(
            run_id = %event.run_id,
            sequence_order = event.sequence_order,
            "trace event persisted"
        );
        Ok(EventRow {
            event: event.clone(),
            prev_event_hash,
            event_hash,
        })
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM trace_events
             WHERE run_id = ?1
             ORDER BY sequence_order ASC"
        ))?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(event_from_row(row)?);
        }
        Ok(out)
    }

    fn append_anomaly(&self, run_id: RunId, anomaly: &Anomaly) -> Result<()> {
        let next_index: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM anomalies WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to count anomalies")?;

        self.conn
            .execute(
                "INSERT INTO anomalies(
                    run_id, anomaly_index, anomaly_type, severity, description,
                    affected_json, event_sequence_json, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id.to_string(),
                    next_index,
                    anomaly.anomaly_type.as_str(),
                    anomaly.severity.as_str(),
                    anomaly.description,
                    serde_json::to_string(&anomaly.affected_transactions)?,
                    serde_json::to_string(&anomaly.event_sequence)?,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to append anomaly")?;
        Ok(())
    }

    fn list_anomalies_for_run(&self, run_id: RunId) -> Result<Vec<Anomaly>> {
        let mut stmt = self.conn.prepare(
            "SELECT anomaly_type, severity, description, affected_json, event_sequence_json
             FROM anomalies
             WHERE run_id = ?1
             ORDER BY anomaly_index ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let severity: String = row.get(1)?;
            let affected_json: String = row.get(3)?;
            let event_sequence_json: String = row.get(4)?;
            out.push(Anomaly {
                anomaly_type: AnomalyType::parse(&row.get::<_, String>(0)?)?,
                severity: Severity::parse(&severity)
                    .ok_or_else(|| anyhow!("invalid severity: {severity}"))?,
                description: row.get(2)?,
                affected_transactions: serde_json::from_str(&affected_json)
                    .context("invalid affected_json")?,
                event_sequence: serde_json::from_str(&event_sequence_json)
                    .context("invalid event_sequence_json")?,
            });
        }
        Ok(out)
    }
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord> {
    let run_id: String = row.get(0)?;
    let result_json: Option<String> = row.get(8)?;
    Ok(RunRecord {
        run_id: parse_run_id(&run_id)?,
        scenario: ScenarioKind::parse(&row.get::<_, String>(1)?)?,
        isolation: IsolationLevel::parse(&row.get::<_, String>(2)?)?,
        operand_a: row.get(3)?,
        operand_b: row.get(4)?,
        pacing: Pacing::parse(&row.get::<_, String>(5)?)?,
        started_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        ended_at: row
            .get::<_, Option<String>>(7)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        result_json: result_json
            .map(|value| serde_json::from_str(&value).context("invalid result_json"))
            .transpose()?,
    })
}

fn event_from_row(row: &Row<'_>) -> Result<EventRow> {
    let run_id: String = row.get(0)?;
    let tx_id: String = row.get(1)?;
    let aggregate_json: Option<String> = row.get(9)?;
    let event = TraceEvent {
        run_id: parse_run_id(&run_id)?,
        tx_id: TxId::from_str(&tx_id)?,
        tx_name: row.get(2)?,
        event_type: EventType::parse(&row.get::<_, String>(3)?)?,
        table_name: row.get(4)?,
        record_key: row.get(5)?,
        old_value: row.get(6)?,
        new_value: row.get(7)?,
        sequence_order: sql_to_sequence(row.get(8)?)?,
        aggregate: aggregate_json
            .map(|value| {
                serde_json::from_str::<AggregateRead>(&value).context("invalid aggregate_json")
            })
            .transpose()?,
        observed_uncommitted: sql_to_bool(row.get(10)?),
        failure: row
            .get::<_, Option<String>>(11)?
            .map(|value| FailureReason::parse(&value))
            .transpose()?,
        notes: row.get(12)?,
        timestamp: parse_rfc3339(&row.get::<_, String>(13)?)?,
    };
    Ok(EventRow {
        event,
        prev_event_hash: row.get(14)?,
        event_hash: row.get(15)?,
    })
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}

fn sequence_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("sequence_order too large for sqlite"))
}

fn sql_to_sequence(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("invalid sequence_order: {value}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
