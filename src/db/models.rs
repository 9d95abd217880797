//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{StatusSnapshot, WorkerStatus};

/// A stored run, without its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: i64,
    pub label: String,
    pub started_at: DateTime<Utc>,
    /// Set once the final view has been saved.
    pub finished_at: Option<DateTime<Utc>>,
    pub workers: i64,
}

/// One worker's counters at one point of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub time: DateTime<Utc>,
    pub run_id: i64,
    pub target_id: u32,
    pub status: WorkerStatus,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub expected_frames: u64,
    pub lost_frames: u64,
    pub reconnect_count: u32,
    pub current_fps: f64,
}

impl HistoryRow {
    pub fn from_snapshot(run_id: i64, snapshot: &StatusSnapshot) -> Self {
        Self {
            time: snapshot.timestamp,
            run_id,
            target_id: snapshot.target_id.0,
            status: snapshot.status,
            frames_received: snapshot.frames_received,
            bytes_received: snapshot.bytes_received,
            expected_frames: snapshot.expected_frames,
            lost_frames: snapshot.lost_frames,
            reconnect_count: snapshot.reconnect_count,
            current_fps: snapshot.current_fps,
        }
    }
}
