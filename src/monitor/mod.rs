//! Monitor engine: owns the workers and turns their snapshots into views.

mod aggregate;
mod estimator;
mod events;
mod resources;
mod retry;
mod types;
mod worker;

pub use aggregate::*;
pub use estimator::*;
pub use events::*;
pub use resources::*;
pub use retry::*;
pub use types::*;
pub use worker::*;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_target, validate_targets, ConfigError, Settings};
use crate::probe::Connector;

const EVENT_CAPACITY: usize = 1024;

/// The running engine.
pub struct Monitor {
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    events: EventSink,
    cancel: CancellationToken,
    workers: BTreeMap<TargetId, WorkerHandle>,
    next_id: u32,
    aggregator: Aggregator,
    resources: watch::Receiver<Option<ResourceSample>>,
    sampler: JoinHandle<()>,
}

impl Monitor {
    /// Validate everything, then launch one worker per target.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(
        settings: Settings,
        targets: Vec<StreamTarget>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        validate_targets(&targets)?;

        let settings = Arc::new(settings);
        let cancel = CancellationToken::new();
        let (resources, sampler) = spawn_resource_sampler(settings.resource_interval, cancel.clone());

        let mut monitor = Self {
            aggregator: Aggregator::new(settings.loss_warning_threshold),
            settings,
            connector,
            events: EventSink::new(EVENT_CAPACITY),
            cancel,
            workers: BTreeMap::new(),
            next_id: 1,
            resources,
            sampler,
        };

        tracing::info!("Monitor: starting {} workers", targets.len());
        for target in targets {
            monitor.launch(target);
        }
        Ok(monitor)
    }

    /// Add one more worker while running.
    pub fn add_target(&mut self, target: StreamTarget) -> Result<TargetId, ConfigError> {
        validate_target(&target)?;
        Ok(self.launch(target))
    }

    fn launch(&mut self, target: StreamTarget) -> TargetId {
        let target_id = TargetId(self.next_id);
        self.next_id += 1;

        let handle = spawn_worker(
            target_id,
            target,
            self.settings.clone(),
            self.connector.clone(),
            self.events.clone(),
            &self.cancel,
        );
        self.workers.insert(target_id, handle);
        target_id
    }

    /// Stop one worker and drop it from the view. Returns its final snapshot.
    pub async fn remove_target(&mut self, target_id: TargetId) -> Option<StatusSnapshot> {
        let handle = self.workers.remove(&target_id)?;
        handle.cancel.cancel();
        let last = join_worker(handle).await;
        self.aggregator.forget(target_id);
        tracing::info!("Monitor: removed {}", target_id);
        Some(last)
    }

    /// Collect the newest snapshot of every worker into a fresh view.
    pub fn refresh(&mut self) -> AggregateView {
        let resources = self.resources.borrow().clone();
        self.aggregator
            .refresh(self.workers.values_mut().map(|h| &mut h.snapshots), resources)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker, wait for all of them and return the final view.
    pub async fn stop(mut self) -> AggregateView {
        self.cancel.cancel();

        let workers = std::mem::take(&mut self.workers);
        let mut remaining = workers.len();
        self.events.emit(MonitorEvent::StopProgress { remaining });

        for (_, handle) in workers {
            let last = join_worker(handle).await;
            self.aggregator.ingest(last);
            remaining -= 1;
            self.events.emit(MonitorEvent::StopProgress { remaining });
        }

        if let Err(e) = (&mut self.sampler).await {
            tracing::error!("Monitor: resource sampler failed: {}", e);
        }

        let resources = self.resources.borrow().clone();
        tracing::info!("Monitor: stopped");
        self.aggregator.build_view(resources)
    }
}

async fn join_worker(handle: WorkerHandle) -> StatusSnapshot {
    let WorkerHandle {
        target_id,
        snapshots,
        join,
        ..
    } = handle;
    match join.await {
        Ok(last) => last,
        Err(e) => {
            tracing::error!("Monitor: {} panicked: {}", target_id, e);
            let mut last = snapshots.borrow().clone();
            last.status = WorkerStatus::Failed;
            last
        }
    }
}
