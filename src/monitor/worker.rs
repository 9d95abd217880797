//! Per-stream worker: connect, measure, reconnect, until stopped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    EventSink, FailureKind, MonitorEvent, PtsDetector, RateEstimator, RetryState, StatusSnapshot,
    StreamTarget, TargetId, WorkerStatus,
};
use crate::config::Settings;
use crate::probe::{attempt_connect, Attempt, Connection, Connector, MediaSession};
use crate::rtsp::Frame;

/// Span over which `current_fps` is measured.
const FPS_SPAN_SECONDS: f64 = 2.0;

/// The engine's grip on a running worker.
pub struct WorkerHandle {
    pub target_id: TargetId,
    pub target: StreamTarget,
    pub snapshots: watch::Receiver<StatusSnapshot>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<StatusSnapshot>,
}

/// Start a worker task. It stops when `parent` or its own child token is
/// cancelled and always publishes a final `Stopped` or `Failed` snapshot.
pub fn spawn_worker(
    target_id: TargetId,
    target: StreamTarget,
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    events: EventSink,
    parent: &CancellationToken,
) -> WorkerHandle {
    let cancel = parent.child_token();
    let (tx, rx) = watch::channel(StatusSnapshot::initial(target_id, &target));

    let worker = StreamWorker::new(
        target_id,
        target.clone(),
        settings,
        connector,
        events,
        cancel.clone(),
        tx,
    );
    let join = tokio::spawn(worker.run());

    WorkerHandle {
        target_id,
        target,
        snapshots: rx,
        cancel,
        join,
    }
}

/// How a connected session ended.
enum SessionEnd {
    Cancelled,
    Interrupted(String),
}

pub struct StreamWorker {
    target_id: TargetId,
    target: StreamTarget,
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    events: EventSink,
    cancel: CancellationToken,
    tx: watch::Sender<StatusSnapshot>,

    retry: RetryState,
    rate: RateEstimator,
    pts: PtsDetector,

    status: WorkerStatus,
    attempts: u64,
    ever_connected: bool,
    frames: u64,
    packets: u64,
    bytes: u64,
    reconnect_count: u32,
    connect_failures: u64,
    interruptions: u64,
    last_latency: f64,
    last_failure: Option<FailureKind>,

    /// Start of the current connection and frames received on it.
    conn_start: Option<Instant>,
    conn_frames: u64,
    /// Totals frozen from earlier connections.
    expected_base: u64,
    lost_base: u64,

    last_publish: Option<Instant>,
}

impl StreamWorker {
    pub fn new(
        target_id: TargetId,
        target: StreamTarget,
        settings: Arc<Settings>,
        connector: Arc<dyn Connector>,
        events: EventSink,
        cancel: CancellationToken,
        tx: watch::Sender<StatusSnapshot>,
    ) -> Self {
        Self {
            target_id,
            target,
            retry: RetryState::new(settings.backoff_ladder.clone(), settings.backoff_floor),
            rate: RateEstimator::from_settings(&settings),
            pts: PtsDetector::from_settings(&settings),
            settings,
            connector,
            events,
            cancel,
            tx,
            status: WorkerStatus::Connecting,
            attempts: 0,
            ever_connected: false,
            frames: 0,
            packets: 0,
            bytes: 0,
            reconnect_count: 0,
            connect_failures: 0,
            interruptions: 0,
            last_latency: 0.0,
            last_failure: None,
            conn_start: None,
            conn_frames: 0,
            expected_base: 0,
            lost_base: 0,
            last_publish: None,
        }
    }

    /// Drive the worker until cancelled; returns the final snapshot.
    pub async fn run(self) -> StatusSnapshot {
        let span = tracing::info_span!(
            "worker",
            id = %self.target_id,
            alias = %self.target.log_alias()
        );
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> StatusSnapshot {
        self.events.emit(MonitorEvent::WorkerStarted {
            target_id: self.target_id,
            address: self.target.address.clone(),
            transport: self.target.transport,
            replica_index: self.target.replica_index,
        });
        self.publish(true);

        if !self.startup_jitter().await {
            return self.finish(WorkerStatus::Stopped);
        }

        loop {
            self.status = if self.attempts == 0 {
                WorkerStatus::Connecting
            } else {
                WorkerStatus::Reconnecting
            };
            self.attempts += 1;
            self.publish(true);

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = attempt_connect(
                    self.connector.as_ref(),
                    &self.target,
                    self.settings.connect_timeout,
                ) => result,
            };

            match attempt {
                Err(fatal) => {
                    self.events.emit(MonitorEvent::Fatal {
                        target_id: self.target_id,
                        message: fatal.to_string(),
                    });
                    return self.finish(WorkerStatus::Failed);
                }
                Ok(Attempt {
                    outcome,
                    connection: Some(connection),
                }) => {
                    self.last_latency = outcome.latency_seconds;
                    match self.drive(connection).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Interrupted(reason) => {
                            self.interruptions += 1;
                            self.events.emit(MonitorEvent::Interrupted {
                                target_id: self.target_id,
                                reason,
                            });
                        }
                    }
                }
                Ok(Attempt {
                    outcome,
                    connection: None,
                }) => {
                    let kind = outcome.failure_kind.unwrap_or(FailureKind::Unknown);
                    self.connect_failures += 1;
                    self.last_failure = Some(kind);
                    self.last_latency = outcome.latency_seconds;

                    let delay = self.retry.on_failure(kind);
                    self.events.emit(MonitorEvent::ConnectFailed {
                        target_id: self.target_id,
                        kind,
                        message: outcome.raw_message,
                        attempt: self.retry.consecutive_failures(),
                        retry_in_seconds: delay.as_secs_f64(),
                    });
                    self.status = WorkerStatus::Reconnecting;
                    self.publish(true);

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.finish(WorkerStatus::Stopped)
    }

    /// Stagger start-up. Returns false if cancelled meanwhile.
    async fn startup_jitter(&self) -> bool {
        let max_ms = self.settings.startup_jitter.as_millis() as u64;
        if max_ms == 0 {
            return true;
        }
        let jitter = Duration::from_millis(rand::random::<u64>() % (max_ms + 1));
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(jitter) => true,
        }
    }

    /// Pull frames until the stream fails, stalls or the worker is cancelled.
    async fn drive(&mut self, connection: Connection) -> SessionEnd {
        let Connection {
            mut session,
            first_frame,
        } = connection;

        self.on_connected(session.as_ref());
        self.record_frame(first_frame);
        self.publish(true);

        let period = self.settings.snapshot_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_data = Instant::now();

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                _ = heartbeat.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_data) >= self.settings.read_timeout {
                        break SessionEnd::Interrupted(format!(
                            "no data for {:?}",
                            self.settings.read_timeout
                        ));
                    }
                    self.publish(true);
                }
                frame = session.next_frame() => match frame {
                    Ok(frame) => {
                        last_data = Instant::now();
                        self.record_frame(frame);
                        self.publish(false);
                    }
                    Err(e) => break SessionEnd::Interrupted(e.to_string()),
                },
            }
        };

        if tokio::time::timeout(self.settings.read_timeout, session.close())
            .await
            .is_err()
        {
            tracing::warn!("Worker: teardown did not finish within {:?}", self.settings.read_timeout);
        }
        self.on_disconnected();
        if let SessionEnd::Interrupted(_) = end {
            self.status = WorkerStatus::Reconnecting;
            self.publish(true);
        }
        end
    }

    fn on_connected(&mut self, session: &dyn MediaSession) {
        self.retry.on_success();
        if self.ever_connected {
            self.reconnect_count += 1;
        }
        self.ever_connected = true;

        self.rate.reset();
        self.rate.set_declared(session.declared_fps());
        self.pts.clear_history();
        self.conn_start = Some(Instant::now());
        self.conn_frames = 0;
        self.status = WorkerStatus::Running;

        self.events.emit(MonitorEvent::Connected {
            target_id: self.target_id,
            latency_seconds: self.last_latency,
            reconnect_count: self.reconnect_count,
            declared_fps: session.declared_fps(),
        });
    }

    fn on_disconnected(&mut self) {
        let (expected, lost) = self.connection_loss(Instant::now());
        self.expected_base += expected;
        self.lost_base += lost;
        self.conn_start = None;
        self.conn_frames = 0;
    }

    fn record_frame(&mut self, frame: Frame) {
        self.frames += 1;
        self.conn_frames += 1;
        self.packets += frame.packets as u64;
        self.bytes += frame.bytes;

        if let Some(start) = self.conn_start {
            self.rate.on_arrival(Instant::now().duration_since(start).as_secs_f64());
        }
        if let Some(pts) = frame.pts {
            let declared_interval = self.rate.declared().map(|fps| 1.0 / fps);
            self.pts.on_pts(pts, declared_interval);
        }
    }

    /// Expected and lost frames on the current connection.
    fn connection_loss(&self, now: Instant) -> (u64, u64) {
        match self.conn_start {
            Some(start) => {
                let elapsed = now.duration_since(start).as_secs_f64();
                let expected = self.rate.expected_count(elapsed);
                (expected, expected.saturating_sub(self.conn_frames))
            }
            None => (0, 0),
        }
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let now = Instant::now();
        let (expected, lost) = self.connection_loss(now);
        let current_fps = match self.conn_start {
            Some(start) => self
                .rate
                .observed_fps(now.duration_since(start).as_secs_f64(), FPS_SPAN_SECONDS),
            None => 0.0,
        };

        StatusSnapshot {
            target_id: self.target_id,
            address: self.target.address.clone(),
            transport: self.target.transport,
            status: self.status,
            frames_received: self.frames,
            packets_received: self.packets,
            bytes_received: self.bytes,
            expected_frames: self.expected_base + expected,
            lost_frames: self.lost_base + lost,
            pts_lost_frames: self.pts.lost(),
            pts_resets: self.pts.resets(),
            reconnect_count: self.reconnect_count,
            connect_failures: self.connect_failures,
            interruptions: self.interruptions,
            last_connect_latency_seconds: self.last_latency,
            current_fps,
            estimated_fps: self.rate.current_estimate().unwrap_or(0.0),
            last_failure: self.last_failure,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Publish a snapshot, at most once per `snapshot_interval` unless forced.
    fn publish(&mut self, force: bool) {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_publish {
                if now.duration_since(last) < self.settings.snapshot_interval {
                    return;
                }
            }
        }
        self.last_publish = Some(now);
        self.tx.send_replace(self.build_snapshot());
    }

    fn finish(mut self, status: WorkerStatus) -> StatusSnapshot {
        self.status = status;
        let snapshot = self.build_snapshot();
        self.tx.send_replace(snapshot.clone());
        self.events.emit(MonitorEvent::Stopped {
            target_id: self.target_id,
            status,
            frames_received: self.frames,
        });
        snapshot
    }
}
