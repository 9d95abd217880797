//! Periodic rollup of worker snapshots into a read-only view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;

use super::{ResourceSample, StatusSnapshot, TargetId, WorkerStatus};

/// Why a row is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    HighLoss,
    Reconnected,
    Failed,
}

/// One worker's latest snapshot plus derived flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRow {
    pub snapshot: StatusSnapshot,
    pub loss_rate: f64,
    pub warnings: Vec<Warning>,
}

impl WorkerRow {
    pub fn is_warning(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Replicas of one address summed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRollup {
    pub address: String,
    pub workers: usize,
    pub running: usize,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub expected_frames: u64,
    pub lost_frames: u64,
    pub reconnects: u64,
    pub mean_fps: f64,
    pub loss_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub workers: usize,
    pub connecting: usize,
    pub running: usize,
    pub reconnecting: usize,
    pub stopped: usize,
    pub failed: usize,
    pub warnings: usize,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub expected_frames: u64,
    pub lost_frames: u64,
    pub reconnects: u64,
    pub mean_fps: f64,
    pub mean_latency_seconds: f64,
}

/// A complete view, rebuilt from scratch on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateView {
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<WorkerRow>,
    pub addresses: Vec<AddressRollup>,
    pub fleet: FleetSummary,
    pub resources: Option<ResourceSample>,
}

/// Keeps the last known snapshot of every worker.
///
/// A worker with nothing new keeps its previous row; a worker only goes
/// missing before its first snapshot or after it is forgotten.
#[derive(Debug)]
pub struct Aggregator {
    loss_warning_threshold: f64,
    last_known: BTreeMap<TargetId, StatusSnapshot>,
    reconnects_at_last_refresh: HashMap<TargetId, u32>,
}

impl Aggregator {
    pub fn new(loss_warning_threshold: f64) -> Self {
        Self {
            loss_warning_threshold,
            last_known: BTreeMap::new(),
            reconnects_at_last_refresh: HashMap::new(),
        }
    }

    /// Replace the stored snapshot for its worker.
    pub fn ingest(&mut self, snapshot: StatusSnapshot) {
        self.last_known.insert(snapshot.target_id, snapshot);
    }

    /// Take the newest value from a worker's channel, if any.
    pub fn drain(&mut self, rx: &mut watch::Receiver<StatusSnapshot>) {
        match rx.has_changed() {
            Ok(true) => {
                let snapshot = rx.borrow_and_update().clone();
                self.ingest(snapshot);
            }
            Ok(false) => {}
            // The worker is gone; its last value is still readable
            Err(_) => {
                let snapshot = rx.borrow().clone();
                self.ingest(snapshot);
            }
        }
    }

    pub fn forget(&mut self, target_id: TargetId) {
        self.last_known.remove(&target_id);
        self.reconnects_at_last_refresh.remove(&target_id);
    }

    /// Drain every channel and build a fresh view.
    pub fn refresh<'a, I>(&mut self, sources: I, resources: Option<ResourceSample>) -> AggregateView
    where
        I: IntoIterator<Item = &'a mut watch::Receiver<StatusSnapshot>>,
    {
        for rx in sources {
            self.drain(rx);
        }
        self.build_view(resources)
    }

    /// Build a view from what is already stored.
    pub fn build_view(&mut self, resources: Option<ResourceSample>) -> AggregateView {
        let rows: Vec<WorkerRow> = self
            .last_known
            .values()
            .map(|snapshot| {
                let previous = self
                    .reconnects_at_last_refresh
                    .get(&snapshot.target_id)
                    .copied()
                    .unwrap_or(0);
                self.row(snapshot, previous)
            })
            .collect();

        self.reconnects_at_last_refresh = self
            .last_known
            .values()
            .map(|s| (s.target_id, s.reconnect_count))
            .collect();

        AggregateView {
            generated_at: Utc::now(),
            addresses: address_rollups(&rows),
            fleet: fleet_summary(&rows),
            rows,
            resources,
        }
    }

    fn row(&self, snapshot: &StatusSnapshot, previous_reconnects: u32) -> WorkerRow {
        let loss_rate = snapshot.loss_rate();
        let mut warnings = Vec::new();
        if loss_rate > self.loss_warning_threshold {
            warnings.push(Warning::HighLoss);
        }
        if snapshot.reconnect_count > previous_reconnects {
            warnings.push(Warning::Reconnected);
        }
        if snapshot.status == WorkerStatus::Failed {
            warnings.push(Warning::Failed);
        }
        WorkerRow {
            snapshot: snapshot.clone(),
            loss_rate,
            warnings,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn ratio(lost: u64, expected: u64) -> f64 {
    if expected == 0 {
        0.0
    } else {
        lost as f64 / expected as f64
    }
}

fn address_rollups(rows: &[WorkerRow]) -> Vec<AddressRollup> {
    let mut groups: BTreeMap<&str, Vec<&StatusSnapshot>> = BTreeMap::new();
    for row in rows {
        groups
            .entry(row.snapshot.address.as_str())
            .or_default()
            .push(&row.snapshot);
    }

    groups
        .into_iter()
        .map(|(address, snaps)| {
            let expected = snaps.iter().map(|s| s.expected_frames).sum();
            let lost = snaps.iter().map(|s| s.lost_frames).sum();
            AddressRollup {
                address: address.to_string(),
                workers: snaps.len(),
                running: snaps.iter().filter(|s| s.status == WorkerStatus::Running).count(),
                frames_received: snaps.iter().map(|s| s.frames_received).sum(),
                bytes_received: snaps.iter().map(|s| s.bytes_received).sum(),
                expected_frames: expected,
                lost_frames: lost,
                reconnects: snaps.iter().map(|s| s.reconnect_count as u64).sum(),
                mean_fps: mean(snaps.iter().map(|s| s.current_fps)),
                loss_rate: ratio(lost, expected),
            }
        })
        .collect()
}

fn fleet_summary(rows: &[WorkerRow]) -> FleetSummary {
    let count = |status: WorkerStatus| rows.iter().filter(|r| r.snapshot.status == status).count();
    FleetSummary {
        workers: rows.len(),
        connecting: count(WorkerStatus::Connecting),
        running: count(WorkerStatus::Running),
        reconnecting: count(WorkerStatus::Reconnecting),
        stopped: count(WorkerStatus::Stopped),
        failed: count(WorkerStatus::Failed),
        warnings: rows.iter().filter(|r| r.is_warning()).count(),
        frames_received: rows.iter().map(|r| r.snapshot.frames_received).sum(),
        bytes_received: rows.iter().map(|r| r.snapshot.bytes_received).sum(),
        expected_frames: rows.iter().map(|r| r.snapshot.expected_frames).sum(),
        lost_frames: rows.iter().map(|r| r.snapshot.lost_frames).sum(),
        reconnects: rows.iter().map(|r| r.snapshot.reconnect_count as u64).sum(),
        mean_fps: mean(rows.iter().map(|r| r.snapshot.current_fps)),
        mean_latency_seconds: mean(rows.iter().map(|r| r.snapshot.last_connect_latency_seconds)),
    }
}

impl FleetSummary {
    pub fn loss_rate(&self) -> f64 {
        ratio(self.lost_frames, self.expected_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StreamTarget;
    use crate::rtsp::Transport;

    fn snapshot(id: u32, address: &str) -> StatusSnapshot {
        let target = StreamTarget::new(address, Transport::Tcp, 0);
        let mut snap = StatusSnapshot::initial(TargetId(id), &target);
        snap.status = WorkerStatus::Running;
        snap
    }

    #[test]
    fn test_last_write_wins_and_stale_rows_stay() {
        let (tx, mut rx) = watch::channel(snapshot(1, "rtsp://cam/1"));
        let mut agg = Aggregator::new(0.1);

        let mut first = snapshot(1, "rtsp://cam/1");
        first.frames_received = 10;
        let mut second = first.clone();
        second.frames_received = 20;
        tx.send(first).unwrap();
        tx.send(second).unwrap();

        let view = agg.refresh([&mut rx], None);
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].snapshot.frames_received, 20);

        // Nothing new: the row is still there
        let view = agg.refresh([&mut rx], None);
        assert_eq!(view.rows[0].snapshot.frames_received, 20);

        // Worker gone: last value is kept
        drop(tx);
        let view = agg.refresh([&mut rx], None);
        assert_eq!(view.rows[0].snapshot.frames_received, 20);
    }

    #[test]
    fn test_loss_warning_scenario() {
        let mut agg = Aggregator::new(0.10);
        let mut snap = snapshot(1, "rtsp://cam/1");
        snap.expected_frames = 250;
        snap.frames_received = 200;
        snap.lost_frames = 50;
        agg.ingest(snap);

        let view = agg.build_view(None);
        let row = &view.rows[0];
        assert!((row.loss_rate - 0.2).abs() < 1e-12);
        assert_eq!(row.warnings, vec![Warning::HighLoss]);
        assert_eq!(view.fleet.warnings, 1);
    }

    #[test]
    fn test_reconnect_warning_is_per_refresh() {
        let mut agg = Aggregator::new(0.10);
        let mut snap = snapshot(1, "rtsp://cam/1");
        agg.ingest(snap.clone());
        assert!(!agg.build_view(None).rows[0].is_warning());

        snap.reconnect_count = 1;
        agg.ingest(snap.clone());
        assert_eq!(agg.build_view(None).rows[0].warnings, vec![Warning::Reconnected]);

        // No new reconnect since the last refresh
        assert!(!agg.build_view(None).rows[0].is_warning());
    }

    #[test]
    fn test_failed_worker_flagged() {
        let mut agg = Aggregator::new(0.10);
        let mut snap = snapshot(3, "rtsp://cam/1");
        snap.status = WorkerStatus::Failed;
        agg.ingest(snap);
        let view = agg.build_view(None);
        assert_eq!(view.rows[0].warnings, vec![Warning::Failed]);
        assert_eq!(view.fleet.failed, 1);
    }

    #[test]
    fn test_rollups() {
        let mut agg = Aggregator::new(0.10);
        for (id, addr, frames, fps, latency) in [
            (1, "rtsp://a/1", 100, 20.0, 0.5),
            (2, "rtsp://a/1", 50, 10.0, 1.5),
            (3, "rtsp://b/1", 30, 30.0, 1.0),
        ] {
            let mut snap = snapshot(id, addr);
            snap.frames_received = frames;
            snap.bytes_received = frames * 1000;
            snap.current_fps = fps;
            snap.last_connect_latency_seconds = latency;
            snap.expected_frames = frames;
            agg.ingest(snap);
        }

        let view = agg.build_view(None);
        assert_eq!(view.fleet.workers, 3);
        assert_eq!(view.fleet.running, 3);
        assert_eq!(view.fleet.frames_received, 180);
        assert_eq!(view.fleet.bytes_received, 180_000);
        assert!((view.fleet.mean_fps - 20.0).abs() < 1e-12);
        assert!((view.fleet.mean_latency_seconds - 1.0).abs() < 1e-12);
        assert_eq!(view.fleet.loss_rate(), 0.0);

        assert_eq!(view.addresses.len(), 2);
        let a = &view.addresses[0];
        assert_eq!(a.address, "rtsp://a/1");
        assert_eq!(a.workers, 2);
        assert_eq!(a.frames_received, 150);
        assert!((a.mean_fps - 15.0).abs() < 1e-12);

        agg.forget(TargetId(3));
        assert_eq!(agg.build_view(None).rows.len(), 2);
    }

    #[test]
    fn test_empty_view() {
        let mut agg = Aggregator::new(0.10);
        let view = agg.build_view(None);
        assert!(view.rows.is_empty());
        assert_eq!(view.fleet.mean_fps, 0.0);
        assert_eq!(view.fleet, FleetSummary::default());
    }
}
