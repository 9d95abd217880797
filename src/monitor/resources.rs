//! Host resource sampling: CPU, memory and network throughput.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use sysinfo::{Networks, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One host measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSample {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            0.0
        } else {
            self.memory_used_bytes as f64 * 100.0 / self.memory_total_bytes as f64
        }
    }
}

pub struct ResourceSampler {
    system: System,
    networks: Networks,
    last_totals: Option<(u64, u64)>,
    last_update: Instant,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a difference between two refreshes; prime the first one
        system.refresh_cpu();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            last_totals: None,
            last_update: Instant::now(),
        }
    }

    pub fn sample(&mut self) -> ResourceSample {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.networks.refresh();

        let (rx, tx) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_name, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });

        let (rx_rate, tx_rate) = match self.last_totals {
            Some((last_rx, last_tx)) if elapsed > 0.0 => (
                rx.saturating_sub(last_rx) as f64 / elapsed,
                tx.saturating_sub(last_tx) as f64 / elapsed,
            ),
            _ => (0.0, 0.0),
        };
        self.last_totals = Some((rx, tx));
        self.last_update = now;

        ResourceSample {
            cpu_percent: self.system.global_cpu_info().cpu_usage() as f64,
            memory_used_bytes: self.system.used_memory(),
            memory_total_bytes: self.system.total_memory(),
            net_rx_bytes_per_sec: rx_rate,
            net_tx_bytes_per_sec: tx_rate,
            timestamp: Utc::now(),
        }
    }
}

/// Sample at `interval` until cancelled, publishing the newest sample.
pub fn spawn_resource_sampler(
    interval: Duration,
    cancel: CancellationToken,
) -> (watch::Receiver<Option<ResourceSample>>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(None);

    let handle = tokio::spawn(async move {
        let mut sampler = ResourceSampler::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = sampler.sample();
                    tracing::debug!(
                        "Resources: cpu {:.1}% mem {:.1}% rx {:.0} B/s tx {:.0} B/s",
                        sample.cpu_percent,
                        sample.memory_percent(),
                        sample.net_rx_bytes_per_sec,
                        sample.net_tx_bytes_per_sec
                    );
                    if tx.send(Some(sample)).is_err() {
                        break;
                    }
                }
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_sane() {
        let mut sampler = ResourceSampler::new();
        let first = sampler.sample();
        assert!(first.memory_total_bytes >= first.memory_used_bytes);
        assert_eq!(first.net_rx_bytes_per_sec, 0.0);
        let second = sampler.sample();
        assert!(second.cpu_percent >= 0.0);
        assert!(second.net_rx_bytes_per_sec >= 0.0);
        assert!(second.memory_percent() <= 100.0);
    }

    #[tokio::test]
    async fn test_sampler_task_publishes_and_stops() {
        let cancel = CancellationToken::new();
        let (mut rx, handle) = spawn_resource_sampler(Duration::from_millis(10), cancel.clone());
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
        cancel.cancel();
        handle.await.unwrap();
    }
}
