//! Rendering and exporting aggregate views.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::db::{HistoryRow, RunInfo};
use crate::monitor::{AggregateView, Warning, WorkerRow};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

const ADDRESS_WIDTH: usize = 40;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Plain-text table of a view for terminals.
pub fn render_table(view: &AggregateView) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:<width$}  {:<4}  {:<12}  {:>9}  {:>6}  {:>6}  {:>6}  {:>6}  {:>8}  {:>9}  WARN",
        "ID",
        "ADDRESS",
        "TX",
        "STATUS",
        "FRAMES",
        "FPS",
        "EXP",
        "LOSS%",
        "RECON",
        "LATENCY",
        "BYTES",
        width = ADDRESS_WIDTH
    );

    for row in &view.rows {
        let s = &row.snapshot;
        let _ = writeln!(
            out,
            "{:>4}  {:<width$}  {:<4}  {:<12}  {:>9}  {:>6.1}  {:>6.1}  {:>6.1}  {:>6}  {:>7.3}s  {:>9}  {}",
            s.target_id.0,
            truncate(&s.address, ADDRESS_WIDTH),
            s.transport.to_string(),
            s.status.as_str(),
            s.frames_received,
            s.current_fps,
            s.estimated_fps,
            row.loss_rate * 100.0,
            s.reconnect_count,
            s.last_connect_latency_seconds,
            human_bytes(s.bytes_received),
            warning_text(row),
            width = ADDRESS_WIDTH
        );
    }

    let f = &view.fleet;
    let _ = writeln!(
        out,
        "\n{} workers: {} running, {} connecting, {} reconnecting, {} stopped, {} failed, {} warnings",
        f.workers, f.running, f.connecting, f.reconnecting, f.stopped, f.failed, f.warnings
    );
    let _ = writeln!(
        out,
        "frames {}  bytes {}  lost {}/{} ({:.1}%)  reconnects {}  mean fps {:.1}  mean latency {:.3}s",
        f.frames_received,
        human_bytes(f.bytes_received),
        f.lost_frames,
        f.expected_frames,
        f.loss_rate() * 100.0,
        f.reconnects,
        f.mean_fps,
        f.mean_latency_seconds
    );
    if let Some(r) = &view.resources {
        let _ = writeln!(
            out,
            "host cpu {:.1}%  mem {:.1}%  rx {}/s  tx {}/s",
            r.cpu_percent,
            r.memory_percent(),
            human_bytes(r.net_rx_bytes_per_sec as u64),
            human_bytes(r.net_tx_bytes_per_sec as u64)
        );
    }
    out
}

/// Stored runs, one per line.
pub fn render_runs(runs: &[RunInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>5}  {:<19}  {:<19}  {:>7}  LABEL", "RUN", "STARTED", "FINISHED", "WORKERS");
    for run in runs {
        let finished = run
            .finished_at
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:>5}  {:<19}  {:<19}  {:>7}  {}",
            run.id,
            run.started_at.format(TIME_FORMAT).to_string(),
            finished,
            run.workers,
            run.label
        );
    }
    out
}

/// One worker's recorded history.
pub fn render_history(rows: &[HistoryRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<23}  {:<12}  {:>9}  {:>9}  {:>6}  {:>6}  {:>6}  {:>9}",
        "TIME", "STATUS", "FRAMES", "EXPECTED", "LOST", "RECON", "FPS", "BYTES"
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:<23}  {:<12}  {:>9}  {:>9}  {:>6}  {:>6}  {:>6.1}  {:>9}",
            r.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            r.status.as_str(),
            r.frames_received,
            r.expected_frames,
            r.lost_frames,
            r.reconnect_count,
            r.current_fps,
            human_bytes(r.bytes_received)
        );
    }
    out
}

fn warning_text(row: &WorkerRow) -> String {
    row.warnings
        .iter()
        .map(|w| match w {
            Warning::HighLoss => "loss",
            Warning::Reconnected => "reconnect",
            Warning::Failed => "failed",
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let head: String = s.chars().take(width - 1).collect();
        format!("{}~", head)
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

pub fn to_json(view: &AggregateView) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(view)?)
}

/// Write a view as JSON.
pub fn export_json<P: AsRef<Path>>(view: &AggregateView, path: P) -> Result<(), ReportError> {
    fs::write(path, to_json(view)?)?;
    Ok(())
}

/// Read a view written by [`export_json`].
pub fn import_json<P: AsRef<Path>>(path: P) -> Result<AggregateView, ReportError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
