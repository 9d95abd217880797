//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;
use crate::monitor::{AggregateView, StatusSnapshot, TargetId, WorkerRow};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("Run {0} has no saved view")]
    Unfinished(i64),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Runs ---

    /// Register a new run and return its ID.
    pub fn begin_run(&self, label: &str, started_at: DateTime<Utc>) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (label, started_at) VALUES (?1, ?2)",
            params![label, db_time(&started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store a view as the result of a run, replacing any earlier one.
    pub fn save_view(&self, run_id: i64, view: &AggregateView) -> Result<(), DbError> {
        let fleet = serde_json::to_string(&view.fleet)?;
        let addresses = serde_json::to_string(&view.addresses)?;
        let resources = view
            .resources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let updated = tx.execute(
            "UPDATE runs SET finished_at=?1, fleet_json=?2, addresses_json=?3, resources_json=?4 WHERE id=?5",
            params![db_time(&view.generated_at), fleet, addresses, resources, run_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }

        tx.execute("DELETE FROM run_rows WHERE run_id = ?1", params![run_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO run_rows (run_id, target_id, address, transport, status, frames_received,
                 packets_received, bytes_received, expected_frames, lost_frames, pts_lost_frames,
                 pts_resets, reconnect_count, connect_failures, interruptions, last_connect_latency,
                 current_fps, estimated_fps, last_failure, time, loss_rate, warnings)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22)",
            )?;

            for row in &view.rows {
                let s = &row.snapshot;
                stmt.execute(params![
                    run_id,
                    s.target_id.0,
                    s.address,
                    s.transport.to_string(),
                    s.status.as_str(),
                    s.frames_received as i64,
                    s.packets_received as i64,
                    s.bytes_received as i64,
                    s.expected_frames as i64,
                    s.lost_frames as i64,
                    s.pts_lost_frames as i64,
                    s.pts_resets as i64,
                    s.reconnect_count,
                    s.connect_failures as i64,
                    s.interruptions as i64,
                    s.last_connect_latency_seconds,
                    s.current_fps,
                    s.estimated_fps,
                    s.last_failure.map(|k| k.as_str()),
                    db_time(&s.timestamp),
                    row.loss_rate,
                    serde_json::to_string(&row.warnings)?,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the view saved for a run.
    pub fn load_view(&self, run_id: i64) -> Result<AggregateView, DbError> {
        let conn = self.conn.lock().unwrap();
        let header: Option<(Option<String>, Option<String>, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT finished_at, fleet_json, addresses_json, resources_json FROM runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (finished_at, fleet, addresses, resources) = header.ok_or(DbError::NotFound)?;
        let (generated_at, fleet, addresses) = match (finished_at.as_deref().and_then(parse_db_time), fleet, addresses) {
            (Some(t), Some(f), Some(a)) => (t, f, a),
            _ => return Err(DbError::Unfinished(run_id)),
        };

        let mut stmt = conn.prepare(
            "SELECT target_id, address, transport, status, frames_received, packets_received,
             bytes_received, expected_frames, lost_frames, pts_lost_frames, pts_resets,
             reconnect_count, connect_failures, interruptions, last_connect_latency, current_fps,
             estimated_fps, last_failure, time, loss_rate, warnings
             FROM run_rows WHERE run_id = ?1 ORDER BY target_id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], read_worker_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(AggregateView {
            generated_at,
            rows,
            addresses: serde_json::from_str(&addresses)?,
            fleet: serde_json::from_str(&fleet)?,
            resources: resources.map(|r| serde_json::from_str(&r)).transpose()?,
        })
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunInfo>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.label, r.started_at, r.finished_at,
             (SELECT COUNT(*) FROM run_rows rr WHERE rr.run_id = r.id)
             FROM runs r ORDER BY r.id DESC",
        )?;

        let runs = stmt
            .query_map([], |row| {
                let started: String = row.get(2)?;
                let finished: Option<String> = row.get(3)?;
                Ok(RunInfo {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    started_at: parse_db_time(&started).unwrap_or_else(Utc::now),
                    finished_at: finished.as_deref().and_then(parse_db_time),
                    workers: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(runs)
    }

    /// Delete a run with its rows and history.
    pub fn delete_run(&self, run_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM history WHERE run_id = ?1", params![run_id])?;
        conn.execute("DELETE FROM run_rows WHERE run_id = ?1", params![run_id])?;
        conn.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        Ok(())
    }

    // --- History ---

    /// Add history rows in batch.
    pub fn add_history(&self, rows: &[HistoryRow]) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO history (time, run_id, target_id, status, frames_received, bytes_received,
                 expected_frames, lost_frames, reconnect_count, current_fps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;

            for r in rows {
                stmt.execute(params![
                    db_time(&r.time),
                    r.run_id,
                    r.target_id,
                    r.status.as_str(),
                    r.frames_received as i64,
                    r.bytes_received as i64,
                    r.expected_frames as i64,
                    r.lost_frames as i64,
                    r.reconnect_count,
                    r.current_fps,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// History of one worker in a run, oldest first.
    pub fn get_history(&self, run_id: i64, target_id: TargetId) -> Result<Vec<HistoryRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, run_id, target_id, status, frames_received, bytes_received,
             expected_frames, lost_frames, reconnect_count, current_fps
             FROM history WHERE run_id = ?1 AND target_id = ?2 ORDER BY time ASC",
        )?;

        let rows = stmt
            .query_map(params![run_id, target_id.0], |row| {
                let time_str: String = row.get(0)?;
                let status: String = row.get(3)?;
                Ok(HistoryRow {
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    run_id: row.get(1)?,
                    target_id: row.get(2)?,
                    status: parse_column(3, &status)?,
                    frames_received: row.get::<_, i64>(4)? as u64,
                    bytes_received: row.get::<_, i64>(5)? as u64,
                    expected_frames: row.get::<_, i64>(6)? as u64,
                    lost_frames: row.get::<_, i64>(7)? as u64,
                    reconnect_count: row.get(8)?,
                    current_fps: row.get(9)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    pub fn history_count(&self, run_id: i64) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM history WHERE run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?)
    }
}

fn read_worker_row(row: &Row<'_>) -> SqlResult<WorkerRow> {
    let transport: String = row.get(2)?;
    let status: String = row.get(3)?;
    let last_failure: Option<String> = row.get(17)?;
    let time_str: String = row.get(18)?;
    let warnings: String = row.get(20)?;

    let snapshot = StatusSnapshot {
        target_id: TargetId(row.get(0)?),
        address: row.get(1)?,
        transport: parse_column(2, &transport)?,
        status: parse_column(3, &status)?,
        frames_received: row.get::<_, i64>(4)? as u64,
        packets_received: row.get::<_, i64>(5)? as u64,
        bytes_received: row.get::<_, i64>(6)? as u64,
        expected_frames: row.get::<_, i64>(7)? as u64,
        lost_frames: row.get::<_, i64>(8)? as u64,
        pts_lost_frames: row.get::<_, i64>(9)? as u64,
        pts_resets: row.get::<_, i64>(10)? as u64,
        reconnect_count: row.get(11)?,
        connect_failures: row.get::<_, i64>(12)? as u64,
        interruptions: row.get::<_, i64>(13)? as u64,
        last_connect_latency_seconds: row.get(14)?,
        current_fps: row.get(15)?,
        estimated_fps: row.get(16)?,
        last_failure: last_failure.as_deref().map(|k| parse_column(17, k)).transpose()?,
        timestamp: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    };

    Ok(WorkerRow {
        snapshot,
        loss_rate: row.get(19)?,
        warnings: serde_json::from_str(&warnings)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(20, Type::Text, Box::new(e)))?,
    })
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, text: &str) -> SqlResult<T> {
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Aggregator, FailureKind, ResourceSample, StreamTarget, WorkerStatus};
    use crate::rtsp::Transport;
    use tempfile::NamedTempFile;

    fn sample_view() -> AggregateView {
        let mut agg = Aggregator::new(0.1);

        let target = StreamTarget::new("rtsp://cam.local/1", Transport::Tcp, 0);
        let mut ok = StatusSnapshot::initial(TargetId(1), &target);
        ok.status = WorkerStatus::Running;
        ok.frames_received = 200;
        ok.expected_frames = 250;
        ok.lost_frames = 50;
        ok.current_fps = 0.1 + 0.2;
        ok.estimated_fps = 25.0;
        ok.last_connect_latency_seconds = 1.0 / 3.0;
        agg.ingest(ok);

        let target = StreamTarget::new("rtsp://cam.local/2", Transport::Udp, 1);
        let mut failed = StatusSnapshot::initial(TargetId(2), &target);
        failed.status = WorkerStatus::Failed;
        failed.connect_failures = 7;
        failed.last_failure = Some(FailureKind::Unauthorized);
        agg.ingest(failed);

        agg.build_view(Some(ResourceSample {
            cpu_percent: 12.5,
            memory_used_bytes: 1 << 30,
            memory_total_bytes: 1 << 33,
            net_rx_bytes_per_sec: 1234.5678,
            net_tx_bytes_per_sec: 0.0,
            timestamp: Utc::now(),
        }))
    }

    #[test]
    fn test_view_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let run_id = store.begin_run("smoke", Utc::now()).unwrap();
        assert!(matches!(store.load_view(run_id), Err(DbError::Unfinished(_))));

        let view = sample_view();
        store.save_view(run_id, &view).unwrap();
        let loaded = store.load_view(run_id).unwrap();
        assert_eq!(loaded, view);

        // Saving again replaces rows
        store.save_view(run_id, &view).unwrap();
        assert_eq!(store.load_view(run_id).unwrap().rows.len(), 2);

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].label, "smoke");
        assert_eq!(runs[0].workers, 2);
        assert!(runs[0].finished_at.is_some());
    }

    #[test]
    fn test_missing_run() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(matches!(store.load_view(42), Err(DbError::NotFound)));
        assert!(matches!(store.save_view(42, &sample_view()), Err(DbError::NotFound)));
    }

    #[test]
    fn test_history_and_delete() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let run_id = store.begin_run("", Utc::now()).unwrap();

        let view = sample_view();
        let rows: Vec<HistoryRow> = view
            .rows
            .iter()
            .map(|r| HistoryRow::from_snapshot(run_id, &r.snapshot))
            .collect();
        store.add_history(&rows).unwrap();
        store.add_history(&[]).unwrap();

        let history = store.get_history(run_id, TargetId(2)).unwrap();
        assert_eq!(history, vec![rows[1].clone()]);
        assert_eq!(store.history_count(run_id).unwrap(), 2);

        store.delete_run(run_id).unwrap();
        assert_eq!(store.history_count(run_id).unwrap(), 0);
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_parse_db_time() {
        let t = parse_db_time("2024-03-01 12:00:00.123456789").unwrap();
        assert_eq!(db_time(&t), "2024-03-01 12:00:00.123456789");
        assert!(parse_db_time("2024-03-01T12:00:00Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
