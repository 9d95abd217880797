//! Frame rate estimation and loss accounting.
//!
//! Two independent loss signals are kept: an arrival-count estimator
//! (expected frames from the estimated rate versus frames received) and a
//! PTS-interval detector that counts gaps in presentation timestamps.

use std::collections::VecDeque;

use crate::config::Settings;

/// Rolling frame rate estimate over a bounded window of arrival times.
///
/// A declared rate inside the plausible bounds is used as is. Otherwise the
/// median inter-arrival interval is used once `min_samples` intervals exist.
/// Within one connection an estimate is only ever refined, never dropped.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    arrivals: VecDeque<f64>,
    capacity: usize,
    min_samples: usize,
    min_fps: f64,
    max_fps: f64,
    declared: Option<f64>,
    estimate: Option<f64>,
}

impl RateEstimator {
    pub fn new(capacity: usize, min_samples: usize, min_fps: f64, max_fps: f64) -> Self {
        Self {
            arrivals: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
            min_samples: min_samples.max(1),
            min_fps,
            max_fps,
            declared: None,
            estimate: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.fps_window,
            settings.fps_min_samples,
            settings.fps_min,
            settings.fps_max,
        )
    }

    fn plausible(&self, fps: f64) -> bool {
        fps.is_finite() && fps >= self.min_fps && fps <= self.max_fps
    }

    /// Offer the rate the stream metadata declares. Implausible values are ignored.
    pub fn set_declared(&mut self, fps: Option<f64>) {
        if let Some(fps) = fps.filter(|f| self.plausible(*f)) {
            self.declared = Some(fps);
            self.estimate = Some(fps);
        }
    }

    pub fn declared(&self) -> Option<f64> {
        self.declared
    }

    /// Record a frame arrival at `t` seconds on any monotonic clock.
    pub fn on_arrival(&mut self, t: f64) {
        if self.arrivals.len() == self.capacity {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(t);

        if self.declared.is_some() || self.arrivals.len() < self.min_samples + 1 {
            return;
        }

        if let Some(interval) = median_interval(&self.arrivals) {
            let fps = 1.0 / interval;
            if self.plausible(fps) {
                self.estimate = Some(fps);
            }
        }
    }

    /// Current frame rate estimate, if any.
    pub fn current_estimate(&self) -> Option<f64> {
        self.estimate
    }

    /// `floor(elapsed * fps)`, or 0 without an estimate.
    pub fn expected_count(&self, elapsed_seconds: f64) -> u64 {
        match self.estimate {
            Some(fps) => expected_count(elapsed_seconds, fps),
            None => 0,
        }
    }

    /// Frames missing relative to the expected count; never negative.
    pub fn lost_frames(&self, received: u64, elapsed_seconds: f64) -> u64 {
        self.expected_count(elapsed_seconds).saturating_sub(received)
    }

    pub fn loss_rate(&self, received: u64, elapsed_seconds: f64) -> f64 {
        let expected = self.expected_count(elapsed_seconds);
        if expected == 0 {
            return 0.0;
        }
        expected.saturating_sub(received) as f64 / expected as f64
    }

    /// Arrival rate over the last `span` seconds ending at `now`.
    pub fn observed_fps(&self, now: f64, span: f64) -> f64 {
        if span <= 0.0 {
            return 0.0;
        }
        let mut recent = self.arrivals.iter().rev().take_while(|t| **t >= now - span);
        let last = match recent.next() {
            Some(t) => *t,
            None => return 0.0,
        };
        let (count, first) = recent.fold((1usize, last), |(n, _), t| (n + 1, *t));
        if count < 2 || last <= first {
            return 0.0;
        }
        (count - 1) as f64 / (last - first)
    }

    /// Forget everything; called when a new connection starts.
    pub fn reset(&mut self) {
        self.arrivals.clear();
        self.declared = None;
        self.estimate = None;
    }
}

/// `floor(elapsed * fps)`, saturating at 0 for negative or non-finite input.
pub fn expected_count(elapsed_seconds: f64, fps: f64) -> u64 {
    let expected = (elapsed_seconds * fps).floor();
    if expected.is_finite() && expected > 0.0 {
        expected as u64
    } else {
        0
    }
}

fn median_interval(samples: &VecDeque<f64>) -> Option<f64> {
    let mut intervals: Vec<f64> = samples
        .iter()
        .zip(samples.iter().skip(1))
        .map(|(a, b)| b - a)
        .collect();
    let median = median(&mut intervals)?;
    (median > 0.0).then_some(median)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Counts frames missing from gaps in presentation timestamps.
///
/// A gap is flagged when an interval exceeds
/// `expected * (1 + tolerance) + floor`. Backward jumps and forward jumps
/// beyond `reset_jump` are stream resets: history is cleared and nothing is
/// counted as lost.
#[derive(Debug, Clone)]
pub struct PtsDetector {
    tolerance: f64,
    floor: f64,
    reset_jump: f64,
    min_samples: usize,
    last_pts: Option<f64>,
    intervals: VecDeque<f64>,
    capacity: usize,
    lost: u64,
    resets: u64,
}

impl PtsDetector {
    pub fn new(tolerance: f64, floor_seconds: f64, reset_jump_seconds: f64, min_samples: usize) -> Self {
        Self {
            tolerance,
            floor: floor_seconds,
            reset_jump: reset_jump_seconds,
            min_samples: min_samples.max(1),
            last_pts: None,
            intervals: VecDeque::new(),
            capacity: 50,
            lost: 0,
            resets: 0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.pts_tolerance,
            settings.pts_jitter_floor.as_secs_f64(),
            settings.pts_reset_jump.as_secs_f64(),
            settings.fps_min_samples,
        )
    }

    /// Feed one frame's PTS in seconds. `declared_interval` overrides the
    /// rolling median when the stream declares its rate. Returns the frames
    /// newly counted as lost.
    pub fn on_pts(&mut self, pts: f64, declared_interval: Option<f64>) -> u64 {
        let last = match self.last_pts {
            Some(last) => last,
            None => {
                self.last_pts = Some(pts);
                return 0;
            }
        };

        let delta = pts - last;
        if delta == 0.0 {
            return 0;
        }
        if delta < 0.0 || delta > self.reset_jump {
            self.intervals.clear();
            self.last_pts = Some(pts);
            self.resets += 1;
            return 0;
        }
        self.last_pts = Some(pts);

        let expected = declared_interval.filter(|e| *e > 0.0).or_else(|| {
            if self.intervals.len() < self.min_samples {
                return None;
            }
            let mut copy: Vec<f64> = self.intervals.iter().copied().collect();
            median(&mut copy)
        });

        if self.intervals.len() == self.capacity {
            self.intervals.pop_front();
        }
        self.intervals.push_back(delta);

        let expected = match expected.filter(|e| *e > 0.0) {
            Some(e) => e,
            None => return 0,
        };

        if delta > expected * (1.0 + self.tolerance) + self.floor {
            let missing = ((delta / expected).round() as u64).saturating_sub(1).max(1);
            self.lost += missing;
            return missing;
        }
        0
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Drop timestamp history but keep the counters; used across reconnects.
    pub fn clear_history(&mut self) {
        self.last_pts = None;
        self.intervals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RateEstimator {
        RateEstimator::new(100, 10, 1.0, 120.0)
    }

    #[test]
    fn test_declared_rate_scenario() {
        let mut est = estimator();
        est.set_declared(Some(25.0));
        for i in 0..200 {
            est.on_arrival(i as f64 * 0.05);
        }
        assert_eq!(est.expected_count(10.0), 250);
        assert_eq!(est.lost_frames(200, 10.0), 50);
        assert!((est.loss_rate(200, 10.0) - 0.2).abs() < 1e-12);
        // Arrivals at 20 fps never override the declared 25
        assert_eq!(est.current_estimate(), Some(25.0));
    }

    #[test]
    fn test_expected_count_properties() {
        for &(t, f) in &[(0.0, 25.0), (1.99, 1.0), (10.0, 0.0), (3.3, 29.97), (100.0, 120.0)] {
            assert_eq!(expected_count(t, f), (t * f as f64).floor() as u64);
        }
        assert_eq!(expected_count(-1.0, 25.0), 0);
        assert_eq!(expected_count(f64::NAN, 25.0), 0);

        let mut est = estimator();
        est.set_declared(Some(10.0));
        // More received than expected is zero loss, not negative
        assert_eq!(est.lost_frames(1000, 1.0), 0);
        assert_eq!(est.loss_rate(1000, 1.0), 0.0);
    }

    #[test]
    fn test_too_few_samples_yield_no_estimate() {
        let mut est = estimator();
        assert_eq!(est.current_estimate(), None);
        assert_eq!(est.lost_frames(0, 5.0), 0);
        est.on_arrival(0.0);
        assert_eq!(est.current_estimate(), None);
        assert_eq!(est.loss_rate(1, 5.0), 0.0);
        assert_eq!(est.observed_fps(0.0, 1.0), 0.0);
    }

    #[test]
    fn test_implausible_declared_rate_ignored() {
        let mut est = estimator();
        est.set_declared(Some(90000.0));
        assert_eq!(est.declared(), None);
        est.set_declared(Some(0.5));
        assert_eq!(est.current_estimate(), None);
    }

    #[test]
    fn test_median_resists_bursts() {
        let mut est = estimator();
        let mut t = 0.0;
        for i in 0..30 {
            // Every fifth frame arrives in a late burst
            t += if i % 5 == 0 { 0.2 } else { 0.04 };
            est.on_arrival(t);
        }
        let fps = est.current_estimate().unwrap();
        assert!((fps - 25.0).abs() < 1e-6, "fps {}", fps);
    }

    #[test]
    fn test_estimate_waits_for_min_samples() {
        let mut est = estimator();
        for i in 0..10 {
            est.on_arrival(i as f64 * 0.1);
        }
        // 10 arrivals are only 9 intervals
        assert_eq!(est.current_estimate(), None);
        est.on_arrival(1.0);
        assert!((est.current_estimate().unwrap() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_estimate_not_downgraded_by_implausible_window() {
        let mut est = estimator();
        for i in 0..=10 {
            est.on_arrival(i as f64 * 0.04);
        }
        let before = est.current_estimate().unwrap();
        // A stall makes the median interval absurdly long
        for i in 0..100 {
            est.on_arrival(100.0 + i as f64 * 5.0);
        }
        let after = est.current_estimate().unwrap();
        assert!((after - before).abs() < 1e-6, "{} vs {}", after, before);

        est.reset();
        assert_eq!(est.current_estimate(), None);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut est = RateEstimator::new(5, 2, 1.0, 120.0);
        for i in 0..50 {
            est.on_arrival(i as f64);
        }
        assert_eq!(est.arrivals.len(), 5);
    }

    #[test]
    fn test_observed_fps() {
        let mut est = estimator();
        for i in 0..100 {
            est.on_arrival(i as f64 * 0.04);
        }
        let fps = est.observed_fps(3.96, 1.0);
        assert!((fps - 25.0).abs() < 0.5, "fps {}", fps);
        assert_eq!(est.observed_fps(100.0, 1.0), 0.0);
    }

    #[test]
    fn test_pts_gap_counts_missing_frames() {
        let mut det = PtsDetector::new(0.15, 0.005, 10.0, 10);
        let interval = Some(0.04);
        assert_eq!(det.on_pts(0.00, interval), 0);
        assert_eq!(det.on_pts(0.04, interval), 0);
        // Small jitter is tolerated
        assert_eq!(det.on_pts(0.09, interval), 0);
        // 0.12s gap at 25 fps hides two frames
        assert_eq!(det.on_pts(0.21, interval), 2);
        assert_eq!(det.lost(), 2);
    }

    #[test]
    fn test_pts_resets_are_not_loss() {
        let mut det = PtsDetector::new(0.15, 0.005, 10.0, 10);
        let interval = Some(0.04);
        det.on_pts(5.0, interval);
        assert_eq!(det.on_pts(1.0, interval), 0);
        assert_eq!(det.on_pts(60.0, interval), 0);
        assert_eq!(det.resets(), 2);
        assert_eq!(det.lost(), 0);
        assert_eq!(det.on_pts(60.04, interval), 0);
    }

    #[test]
    fn test_pts_uses_rolling_median_without_declared_rate() {
        let mut det = PtsDetector::new(0.15, 0.005, 10.0, 3);
        let mut pts = 0.0;
        det.on_pts(pts, None);
        for _ in 0..3 {
            pts += 0.1;
            assert_eq!(det.on_pts(pts, None), 0);
        }
        pts += 0.4;
        assert_eq!(det.on_pts(pts, None), 3);
    }

    #[test]
    fn test_pts_single_sample_is_zero_loss() {
        let mut det = PtsDetector::new(0.15, 0.005, 10.0, 10);
        assert_eq!(det.on_pts(1.0, None), 0);
        assert_eq!(det.on_pts(1.0, None), 0);
        assert_eq!(det.lost(), 0);
    }
}
