//! Configuration module for streamstress.
//!
//! Settings are immutable once a run starts. Defaults can be overridden from
//! environment variables and then from the command line.

use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::monitor::{StreamTarget, DEFAULT_LADDER};
use crate::rtsp::RtspUrl;

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid target {address}: {reason}")]
    InvalidTarget { address: String, reason: String },
    #[error("no targets given")]
    NoTargets,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Budget for DNS, connect, handshake and the first frame.
    pub connect_timeout: Duration,
    /// A running stream that delivers nothing for this long is interrupted.
    pub read_timeout: Duration,
    pub backoff_ladder: Vec<Duration>,
    pub backoff_floor: Duration,
    pub fps_window: usize,
    /// Intervals required before a median-based rate is trusted.
    pub fps_min_samples: usize,
    pub fps_min: f64,
    pub fps_max: f64,
    /// `lost / expected` above this flags a warning.
    pub loss_warning_threshold: f64,
    pub pts_tolerance: f64,
    pub pts_jitter_floor: Duration,
    pub pts_reset_jump: Duration,
    pub snapshot_interval: Duration,
    pub refresh_interval: Duration,
    pub resource_interval: Duration,
    /// Jitterbuffer latency inside the RTSP source.
    pub jitter_latency: Duration,
    pub udp_recv_buffer: usize,
    pub startup_jitter: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            backoff_ladder: DEFAULT_LADDER.iter().map(|s| Duration::from_secs(*s)).collect(),
            backoff_floor: Duration::from_millis(500),
            fps_window: 100,
            fps_min_samples: 10,
            fps_min: 1.0,
            fps_max: 120.0,
            loss_warning_threshold: 0.10,
            pts_tolerance: 0.15,
            pts_jitter_floor: Duration::from_millis(5),
            pts_reset_jump: Duration::from_secs(10),
            snapshot_interval: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(500),
            resource_interval: Duration::from_secs(2),
            jitter_latency: Duration::ZERO,
            udp_recv_buffer: 2 * 1024 * 1024,
            startup_jitter: Duration::from_millis(250),
        }
    }
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Environment variables (durations in seconds, fractional allowed):
    /// - `STREAMSTRESS_CONNECT_TIMEOUT`
    /// - `STREAMSTRESS_READ_TIMEOUT`
    /// - `STREAMSTRESS_BACKOFF_LADDER`: comma separated, e.g. `1,5,10,30,60`
    /// - `STREAMSTRESS_FPS_WINDOW`
    /// - `STREAMSTRESS_FPS_MIN_SAMPLES`
    /// - `STREAMSTRESS_LOSS_WARNING`: fraction, e.g. `0.1`
    /// - `STREAMSTRESS_PTS_TOLERANCE`
    /// - `STREAMSTRESS_JITTER_LATENCY`
    /// - `STREAMSTRESS_UDP_RECV_BUFFER`: bytes
    ///
    /// Unparsable values are ignored.
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
        };

        if let Some(d) = secs("STREAMSTRESS_CONNECT_TIMEOUT") {
            cfg.connect_timeout = d;
        }
        if let Some(d) = secs("STREAMSTRESS_READ_TIMEOUT") {
            cfg.read_timeout = d;
        }
        if let Some(d) = secs("STREAMSTRESS_JITTER_LATENCY") {
            cfg.jitter_latency = d;
        }
        if let Some(ladder) = lookup("STREAMSTRESS_BACKOFF_LADDER").and_then(|v| parse_ladder(&v)) {
            cfg.backoff_ladder = ladder;
        }
        if let Some(n) = lookup("STREAMSTRESS_FPS_WINDOW").and_then(|v| v.trim().parse().ok()) {
            cfg.fps_window = n;
        }
        if let Some(n) = lookup("STREAMSTRESS_FPS_MIN_SAMPLES").and_then(|v| v.trim().parse().ok()) {
            cfg.fps_min_samples = n;
        }
        if let Some(t) = lookup("STREAMSTRESS_LOSS_WARNING").and_then(|v| v.trim().parse().ok()) {
            cfg.loss_warning_threshold = t;
        }
        if let Some(t) = lookup("STREAMSTRESS_PTS_TOLERANCE").and_then(|v| v.trim().parse().ok()) {
            cfg.pts_tolerance = t;
        }
        if let Some(n) = lookup("STREAMSTRESS_UDP_RECV_BUFFER").and_then(|v| v.trim().parse().ok()) {
            cfg.udp_recv_buffer = n;
        }

        cfg
    }

    /// Reject settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("backoff_floor", self.backoff_floor),
            ("snapshot_interval", self.snapshot_interval),
            ("refresh_interval", self.refresh_interval),
            ("resource_interval", self.resource_interval),
            ("pts_reset_jump", self.pts_reset_jump),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(invalid(field, "must be positive"));
            }
        }

        if self.backoff_ladder.is_empty() {
            return Err(invalid("backoff_ladder", "must not be empty"));
        }
        if self.backoff_ladder.iter().any(|d| d.is_zero()) {
            return Err(invalid("backoff_ladder", "delays must be positive"));
        }
        if self.backoff_ladder.windows(2).any(|w| w[1] < w[0]) {
            return Err(invalid("backoff_ladder", "delays must be ascending"));
        }

        if self.fps_window < 2 {
            return Err(invalid("fps_window", "must hold at least 2 samples"));
        }
        if self.fps_min_samples == 0 || self.fps_min_samples >= self.fps_window {
            return Err(invalid("fps_min_samples", "must be between 1 and fps_window - 1"));
        }
        if !(self.fps_min > 0.0 && self.fps_min < self.fps_max && self.fps_max.is_finite()) {
            return Err(invalid("fps_min", "bounds must satisfy 0 < min < max"));
        }
        if !(self.loss_warning_threshold > 0.0 && self.loss_warning_threshold <= 1.0) {
            return Err(invalid("loss_warning_threshold", "must be in (0, 1]"));
        }
        if !(self.pts_tolerance >= 0.0 && self.pts_tolerance.is_finite()) {
            return Err(invalid("pts_tolerance", "must be a non-negative fraction"));
        }
        if self.udp_recv_buffer == 0 || self.udp_recv_buffer > i32::MAX as usize {
            return Err(invalid("udp_recv_buffer", "must be between 1 and 2^31 - 1 bytes"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Parse `1,5,10` into a ladder of seconds.
pub fn parse_ladder(text: &str) -> Option<Vec<Duration>> {
    text.split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .ok()
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        })
        .collect()
}

/// Check that a target can be connected to at all.
pub fn validate_target(target: &StreamTarget) -> Result<(), ConfigError> {
    RtspUrl::parse(&target.address)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidTarget {
            address: target.address.clone(),
            reason: e.to_string(),
        })
}

pub fn validate_targets(targets: &[StreamTarget]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::NoTargets);
    }
    targets.iter().try_for_each(validate_target)
}
