//! Process-wide wiring.
//!
//! [`GovernorContext`] is built once at startup and owns every component.
//! Construction wires the feedback paths:
//!
//! - controller → worker pool size (unless `worker_count` pins it)
//! - memory governor → cache purge (reclaim) and cache clear (emergency)
//! - memory pressure → batcher batch size
//! - telemetry → controller overload bias and periodic reports
//!
//! [`GovernorContext::start`] spawns the background loops; the returned
//! [`GovernorHandles`] stops them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batcher::{BatchError, RequestBatcher, WorkHandle, WorkRequest, WorkerPool};
use crate::cache::FastPathCache;
use crate::config::{validation, CacheConfig, GovernorConfig};
use crate::memory::MemoryGovernor;
use crate::metrics::GovernorMetrics;
use crate::resource::{
    AllocationController, MemoryProbe, ResourceProbe, ResourceSampler, SystemProbe,
};
use crate::synth::Synthesizer;
use crate::telemetry::{TelemetryAggregator, TelemetryReport};
use crate::{unix_millis, GovernorError};

/// Every governor component, wired together.
#[derive(Clone)]
pub struct GovernorContext {
    config: Arc<GovernorConfig>,
    metrics: Arc<GovernorMetrics>,
    telemetry: Arc<TelemetryAggregator>,
    controller: Arc<AllocationController>,
    sampler: Arc<ResourceSampler>,
    memory: Arc<MemoryGovernor>,
    cache: Arc<FastPathCache>,
    batcher: RequestBatcher,
}

impl GovernorContext {
    /// Build a context that reads the host through [`SystemProbe`].
    ///
    /// # Errors
    ///
    /// [`GovernorError::Config`] if `config` fails validation, or a metrics
    /// registration error.
    pub fn new(
        config: GovernorConfig,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<Self, GovernorError> {
        Self::with_probes(
            config,
            synthesizer,
            Box::new(SystemProbe::new()),
            Box::new(SystemProbe::new()),
        )
    }

    /// Build a context over explicit probes.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_probes(
        config: GovernorConfig,
        synthesizer: Arc<dyn Synthesizer>,
        resource_probe: Box<dyn ResourceProbe>,
        memory_probe: Box<dyn MemoryProbe>,
    ) -> Result<Self, GovernorError> {
        validation::validate(&config).map_err(validation::join_errors)?;

        let metrics = Arc::new(GovernorMetrics::new()?);
        let telemetry = Arc::new(
            TelemetryAggregator::new(config.telemetry.window_size).with_metrics(Arc::clone(&metrics)),
        );
        let controller = Arc::new(
            AllocationController::new(&config.allocation)
                .with_feedback(Arc::clone(&telemetry))
                .with_metrics(Arc::clone(&metrics)),
        );
        let sampler = Arc::new(ResourceSampler::new(resource_probe, &config.allocation));

        let memory = Arc::new(MemoryGovernor::new(memory_probe, &config).with_metrics(Arc::clone(&metrics)));
        let profile = memory.profile().clone();

        let cache = Arc::new(FastPathCache::new(&CacheConfig {
            capacity: profile.cache_capacity,
            byte_budget: profile.cache_byte_budget,
            ..config.cache.clone()
        }));
        {
            let cache = Arc::clone(&cache);
            memory
                .registry()
                .register_reclaim("fast_path_cache.purge_expired", move || {
                    cache.purge_expired();
                    Ok(())
                });
        }
        {
            let cache = Arc::clone(&cache);
            memory
                .registry()
                .register_emergency("fast_path_cache.clear", move || {
                    cache.clear();
                    Ok(())
                });
        }

        let pool = match config.batching.worker_count {
            Some(fixed) => {
                info!(workers = fixed, "worker pool size pinned by configuration");
                WorkerPool::new(fixed)
            }
            None => {
                let pool = WorkerPool::new(controller.current().allocated_units);
                controller.add_listener("worker_pool", Arc::new(pool.clone()));
                pool
            }
        };

        let batcher = RequestBatcher::builder(&config.batching, synthesizer)
            .cache(Arc::clone(&cache))
            .telemetry(Arc::clone(&telemetry))
            .pool(pool)
            .pressure(memory.subscribe())
            .metrics(Arc::clone(&metrics))
            .preallocate(profile.queue_preallocation)
            .build();

        info!(
            tier = ?profile.tier,
            units = controller.current().allocated_units,
            cache_capacity = profile.cache_capacity,
            "governor context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            telemetry,
            controller,
            sampler,
            memory,
            cache,
            batcher,
        })
    }

    /// Spawn the sampler, memory, batcher and reporter loops.
    pub fn start(&self) -> GovernorHandles {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(4);

        tasks.push((
            "resource_sampler",
            tokio::spawn(
                Arc::clone(&self.sampler).run(Arc::clone(&self.controller), shutdown_rx.clone()),
            ),
        ));
        tasks.push((
            "memory_governor",
            tokio::spawn(Arc::clone(&self.memory).run(shutdown_rx.clone())),
        ));
        tasks.push((
            "request_batcher",
            tokio::spawn(self.batcher.clone().run(shutdown_rx.clone())),
        ));
        tasks.push((
            "telemetry_reporter",
            tokio::spawn(self.clone().report_loop(shutdown_rx)),
        ));

        info!(tasks = tasks.len(), "governor started");
        GovernorHandles {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    async fn report_loop(self, mut shutdown: watch::Receiver<bool>) {
        let period = self
            .config
            .telemetry
            .report_interval()
            .max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so the first report has data.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.report();
                    let receivers = self.telemetry.publish(report);
                    tracing::debug!(receivers, "telemetry report published");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Current performance, allocation, pressure and queue depth.
    pub fn report(&self) -> TelemetryReport {
        TelemetryReport {
            timestamp_ms: unix_millis(),
            performance: self.telemetry.snapshot(),
            allocation: (*self.controller.current()).clone(),
            pressure: self.memory.level(),
            queue_depth: self.batcher.queue_depth(),
        }
    }

    /// Receive periodic reports.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<TelemetryReport> {
        self.telemetry.subscribe()
    }

    /// Shorthand for [`RequestBatcher::submit`].
    ///
    /// # Errors
    ///
    /// See [`RequestBatcher::submit`].
    pub fn submit(&self, work: WorkRequest) -> Result<WorkHandle, BatchError> {
        self.batcher.submit(work)
    }

    /// Effective configuration.
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Prometheus registry owner.
    pub fn metrics(&self) -> &Arc<GovernorMetrics> {
        &self.metrics
    }

    /// Outcome aggregator.
    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    /// Allocation controller.
    pub fn controller(&self) -> &Arc<AllocationController> {
        &self.controller
    }

    /// Resource sampler.
    pub fn sampler(&self) -> &Arc<ResourceSampler> {
        &self.sampler
    }

    /// Memory governor.
    pub fn memory(&self) -> &Arc<MemoryGovernor> {
        &self.memory
    }

    /// Fast-path cache.
    pub fn cache(&self) -> &Arc<FastPathCache> {
        &self.cache
    }

    /// Request batcher.
    pub fn batcher(&self) -> &RequestBatcher {
        &self.batcher
    }
}

/// Running background loops started by [`GovernorContext::start`].
pub struct GovernorHandles {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl GovernorHandles {
    /// Names of the spawned loops.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Signal every loop to stop and wait for it.
    ///
    /// Queued work fails with [`BatchError::Shutdown`]; in-flight items run
    /// to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "background task ended abnormally");
            }
        }
        info!("governor stopped");
    }
}
