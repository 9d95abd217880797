//! Connection attempts against RTSP streams.
//!
//! A connection attempt opens a session, reads one frame to rule out streams
//! that open but never deliver, and classifies any failure. The media layer
//! sits behind the [`Connector`] and [`MediaSession`] traits.

mod classify;
mod rtsp;

pub use classify::*;
pub use rtsp::*;

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;

use crate::monitor::{ConnectionOutcome, FailureKind, StreamTarget};
use crate::rtsp::Frame;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("network error: {0}")]
    Network(String),
    /// The local network handle could not be allocated at all.
    #[error("resource error: {0}")]
    Resource(String),
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::Timeout(_) => FailureKind::Timeout,
            ProbeError::Refused(_) => FailureKind::Refused,
            ProbeError::Unauthorized(_) => FailureKind::Unauthorized,
            ProbeError::InvalidAddress(_) => FailureKind::InvalidAddress,
            ProbeError::Protocol(_) => FailureKind::ProtocolError,
            ProbeError::Interrupted(_) | ProbeError::Network(_) | ProbeError::Resource(_) => {
                FailureKind::Unknown
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Resource(_))
    }
}

/// A playing media session.
///
/// `next_frame` must be cancel safe; the worker races it against the stop
/// signal and its heartbeat. Sessions keep themselves alive.
#[async_trait]
pub trait MediaSession: Send {
    /// Frame rate announced by the stream metadata.
    fn declared_fps(&self) -> Option<f64>;

    async fn next_frame(&mut self) -> Result<Frame, ProbeError>;

    /// Release the session. Dropping without closing must also free
    /// every resource.
    async fn close(&mut self);
}

/// Opens media sessions for targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &StreamTarget) -> Result<Box<dyn MediaSession>, ProbeError>;
}

/// A verified live session and the frame that proved it.
pub struct Connection {
    pub session: Box<dyn MediaSession>,
    pub first_frame: Frame,
}

/// Outcome of one attempt, with the session on success.
pub struct Attempt {
    pub outcome: ConnectionOutcome,
    pub connection: Option<Connection>,
}

/// Run one bounded connection attempt.
///
/// Ordinary failures are reported inside the returned [`Attempt`]; only a
/// fatal resource error is returned as `Err`. A session that opened but
/// failed its first read is closed before returning, and one abandoned by
/// the timeout is dropped with the attempt future.
pub async fn attempt_connect(
    connector: &dyn Connector,
    target: &StreamTarget,
    timeout: Duration,
) -> Result<Attempt, ProbeError> {
    let start = Instant::now();

    let result = tokio::time::timeout(timeout, async {
        let mut session = connector.connect(target).await?;
        match session.next_frame().await {
            Ok(first_frame) => Ok::<_, ProbeError>(Connection {
                session,
                first_frame,
            }),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    })
    .await;

    let latency = start.elapsed().as_secs_f64();

    match result {
        Ok(Ok(connection)) => Ok(Attempt {
            outcome: ConnectionOutcome::success(latency),
            connection: Some(connection),
        }),
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => Ok(Attempt {
            outcome: ConnectionOutcome::failure(latency, e.kind(), e.to_string()),
            connection: None,
        }),
        Err(_) => {
            let e = ProbeError::Timeout(format!("no frame within {:?}", timeout));
            Ok(Attempt {
                outcome: ConnectionOutcome::failure(latency, e.kind(), e.to_string()),
                connection: None,
            })
        }
    }
}

/// Scripted sessions for exercising the worker without a network.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// What one scripted `connect` call does.
    #[derive(Clone)]
    pub enum Script {
        Fail(ProbeError),
        /// Deliver `frames` frames `interval` apart, then fail with
        /// `Interrupted`. `None` delivers forever.
        Stream {
            frames: Option<u64>,
            interval: Duration,
            fps: Option<f64>,
        },
        /// Deliver `frames` frames, then go quiet without an error.
        Stall { frames: u64, interval: Duration },
        /// Open, then never deliver anything.
        Silent,
    }

    #[derive(Default)]
    pub struct MockConnector {
        scripts: Mutex<VecDeque<Script>>,
        /// Used once the queue is drained.
        pub fallback: Mutex<Option<Script>>,
        pub connects: AtomicUsize,
        pub open_sessions: Arc<AtomicUsize>,
    }

    impl MockConnector {
        pub fn new(scripts: Vec<Script>, fallback: Script) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                fallback: Mutex::new(Some(fallback)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _target: &StreamTarget) -> Result<Box<dyn MediaSession>, ProbeError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.fallback.lock().unwrap().clone())
                .unwrap_or(Script::Silent);

            let (frames, interval, fps, stall) = match script {
                Script::Fail(e) => return Err(e),
                Script::Stream {
                    frames,
                    interval,
                    fps,
                } => (frames, Some(interval), fps, false),
                Script::Stall { frames, interval } => (Some(frames), Some(interval), None, true),
                Script::Silent => (None, None, None, false),
            };

            self.open_sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                remaining: frames,
                interval,
                fps,
                stall,
                sequence: 0,
                open: self.open_sessions.clone(),
                closed: false,
            }))
        }
    }

    pub struct MockSession {
        remaining: Option<u64>,
        interval: Option<Duration>,
        fps: Option<f64>,
        stall: bool,
        sequence: u64,
        open: Arc<AtomicUsize>,
        closed: bool,
    }

    impl Drop for MockSession {
        fn drop(&mut self) {
            if !self.closed {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl MediaSession for MockSession {
        fn declared_fps(&self) -> Option<f64> {
            self.fps
        }

        async fn next_frame(&mut self) -> Result<Frame, ProbeError> {
            let interval = match self.interval {
                Some(i) => i,
                None => std::future::pending().await,
            };
            if self.remaining == Some(0) {
                if self.stall {
                    std::future::pending::<()>().await;
                }
                return Err(ProbeError::Interrupted("scripted end of stream".to_string()));
            }
            tokio::time::sleep(interval).await;
            if let Some(n) = self.remaining.as_mut() {
                *n -= 1;
            }
            // Timestamps follow a steady 25 fps whatever the delivery pace
            let pts = self.sequence as f64 * 0.04;
            self.sequence += 1;
            Ok(Frame {
                bytes: 1000,
                packets: 2,
                pts: Some(pts),
            })
        }

        async fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
