//! Value types shared between workers, the aggregator and front ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rtsp::Transport;

/// Engine-assigned worker identity. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One monitored stream: an address, a transport and which replica it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTarget {
    pub address: String,
    pub transport: Transport,
    pub replica_index: u32,
}

impl StreamTarget {
    pub fn new(address: impl Into<String>, transport: Transport, replica_index: u32) -> Self {
        Self {
            address: address.into(),
            transport,
            replica_index,
        }
    }

    /// `count` replicas of the same address.
    pub fn replicas(address: &str, transport: Transport, count: u32) -> Vec<Self> {
        (0..count).map(|i| Self::new(address, transport, i)).collect()
    }

    /// Short alias used in file log lines: `<host>_<replica>`.
    pub fn log_alias(&self) -> String {
        let host = url::Url::parse(&self.address)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        format!("{}_{}", host, self.replica_index)
    }
}

/// Worker lifecycle state as shown to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Connecting,
    Running,
    Reconnecting,
    Stopped,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Connecting => "connecting",
            WorkerStatus::Running => "running",
            WorkerStatus::Reconnecting => "reconnecting",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(WorkerStatus::Connecting),
            "running" => Ok(WorkerStatus::Running),
            "reconnecting" => Ok(WorkerStatus::Reconnecting),
            "stopped" => Ok(WorkerStatus::Stopped),
            "failed" => Ok(WorkerStatus::Failed),
            other => Err(format!("unknown worker status: {}", other)),
        }
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Refused,
    Unauthorized,
    InvalidAddress,
    ProtocolError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Refused => "refused",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::InvalidAddress => "invalid_address",
            FailureKind::ProtocolError => "protocol_error",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureKind::Timeout),
            "refused" => Ok(FailureKind::Refused),
            "unauthorized" => Ok(FailureKind::Unauthorized),
            "invalid_address" => Ok(FailureKind::InvalidAddress),
            "protocol_error" => Ok(FailureKind::ProtocolError),
            "unknown" => Ok(FailureKind::Unknown),
            other => Err(format!("unknown failure kind: {}", other)),
        }
    }
}

/// Result of one connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOutcome {
    pub succeeded: bool,
    pub latency_seconds: f64,
    pub failure_kind: Option<FailureKind>,
    pub raw_message: String,
}

impl ConnectionOutcome {
    pub fn success(latency_seconds: f64) -> Self {
        Self {
            succeeded: true,
            latency_seconds,
            failure_kind: None,
            raw_message: String::new(),
        }
    }

    pub fn failure(latency_seconds: f64, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            latency_seconds,
            failure_kind: Some(kind),
            raw_message: message.into(),
        }
    }
}

/// Point-in-time worker status. Every field is always populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub target_id: TargetId,
    pub address: String,
    pub transport: Transport,
    pub status: WorkerStatus,
    pub frames_received: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub expected_frames: u64,
    pub lost_frames: u64,
    pub pts_lost_frames: u64,
    pub pts_resets: u64,
    pub reconnect_count: u32,
    pub connect_failures: u64,
    pub interruptions: u64,
    pub last_connect_latency_seconds: f64,
    /// Frames per second observed over the recent window.
    pub current_fps: f64,
    /// Rate used for expected-frame accounting; 0 when unknown.
    pub estimated_fps: f64,
    pub last_failure: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    /// A zeroed snapshot for a worker that has not connected yet.
    pub fn initial(target_id: TargetId, target: &StreamTarget) -> Self {
        Self {
            target_id,
            address: target.address.clone(),
            transport: target.transport,
            status: WorkerStatus::Connecting,
            frames_received: 0,
            packets_received: 0,
            bytes_received: 0,
            expected_frames: 0,
            lost_frames: 0,
            pts_lost_frames: 0,
            pts_resets: 0,
            reconnect_count: 0,
            connect_failures: 0,
            interruptions: 0,
            last_connect_latency_seconds: 0.0,
            current_fps: 0.0,
            estimated_fps: 0.0,
            last_failure: None,
            timestamp: Utc::now(),
        }
    }

    /// `lost / expected`, or 0 before anything is expected.
    pub fn loss_rate(&self) -> f64 {
        if self.expected_frames == 0 {
            0.0
        } else {
            self.lost_frames as f64 / self.expected_frames as f64
        }
    }
}
