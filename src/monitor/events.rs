//! Lifecycle events.
//!
//! Every event is logged through `tracing` and broadcast to subscribers, so a
//! front end can consume the stream without going through the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{FailureKind, TargetId, WorkerStatus};
use crate::rtsp::Transport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    WorkerStarted {
        target_id: TargetId,
        address: String,
        transport: Transport,
        replica_index: u32,
    },
    Connected {
        target_id: TargetId,
        latency_seconds: f64,
        reconnect_count: u32,
        declared_fps: Option<f64>,
    },
    ConnectFailed {
        target_id: TargetId,
        kind: FailureKind,
        message: String,
        /// Consecutive failures including this one.
        attempt: u32,
        retry_in_seconds: f64,
    },
    Interrupted {
        target_id: TargetId,
        reason: String,
    },
    Fatal {
        target_id: TargetId,
        message: String,
    },
    Stopped {
        target_id: TargetId,
        status: WorkerStatus,
        frames_received: u64,
    },
    StopProgress {
        remaining: usize,
    },
}

/// An event with the wall-clock time it was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub event: MonitorEvent,
}

/// Logging and broadcast handle injected into workers.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EventRecord>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: MonitorEvent) {
        log_event(&event);
        // No subscribers is fine
        let _ = self.tx.send(EventRecord {
            time: Utc::now(),
            event,
        });
    }
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::WorkerStarted {
            target_id,
            address,
            transport,
            replica_index,
        } => {
            tracing::info!(
                "Worker {}: started for {} over {} (replica {})",
                target_id,
                address,
                transport,
                replica_index
            );
        }
        MonitorEvent::Connected {
            target_id,
            latency_seconds,
            reconnect_count,
            declared_fps,
        } => {
            let fps = declared_fps.map_or_else(|| "undeclared".to_string(), |f| format!("{:.2}", f));
            if *reconnect_count > 0 {
                tracing::info!(
                    "Worker {}: reconnected in {:.3}s (reconnect #{}, fps {})",
                    target_id,
                    latency_seconds,
                    reconnect_count,
                    fps
                );
            } else {
                tracing::info!(
                    "Worker {}: connected in {:.3}s (fps {})",
                    target_id,
                    latency_seconds,
                    fps
                );
            }
        }
        MonitorEvent::ConnectFailed {
            target_id,
            kind,
            message,
            attempt,
            retry_in_seconds,
        } => {
            tracing::warn!(
                "Worker {}: connect failed ({}, attempt {}): {}; retrying in {:.1}s",
                target_id,
                kind,
                attempt,
                message,
                retry_in_seconds
            );
        }
        MonitorEvent::Interrupted { target_id, reason } => {
            tracing::warn!("Worker {}: stream interrupted: {}", target_id, reason);
        }
        MonitorEvent::Fatal { target_id, message } => {
            tracing::error!("Worker {}: giving up: {}", target_id, message);
        }
        MonitorEvent::Stopped {
            target_id,
            status,
            frames_received,
        } => {
            tracing::info!(
                "Worker {}: {} after {} frames",
                target_id,
                status,
                frames_received
            );
        }
        MonitorEvent::StopProgress { remaining } => {
            tracing::info!("Monitor: stopping... ({} workers)", remaining);
        }
    }
}
