//! Prometheus metrics for the governor.
//!
//! [`GovernorMetrics`] owns a private [`Registry`]; each
//! [`GovernorContext`](crate::GovernorContext) builds its own bundle, so
//! several governors (or tests) in one process never collide on descriptor
//! names.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `governor_requests_total` | Counter | `outcome` |
//! | `governor_cache_lookups_total` | Counter | `result` |
//! | `governor_synthesis_duration_seconds` | Histogram | |
//! | `governor_allocated_units` | Gauge | |
//! | `governor_queue_depth` | Gauge | |
//! | `governor_memory_pressure_level` | Gauge | |

use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

use crate::GovernorError;

fn init_err(e: prometheus::Error) -> GovernorError {
    GovernorError::Other(format!("metrics init failed: {e}"))
}

/// All Prometheus metrics for one governor instance.
pub struct GovernorMetrics {
    registry: Registry,
    requests_total: CounterVec,
    cache_lookups: CounterVec,
    synthesis_duration: Histogram,
    allocated_units: IntGauge,
    queue_depth: IntGauge,
    pressure_level: IntGauge,
}

impl GovernorMetrics {
    /// Construct and register every metric with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Other`] if metric construction or
    /// registration fails.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new() -> Result<Self, GovernorError> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("governor_requests_total", "Work items by final outcome"),
            &["outcome"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(requests_total.clone()))
            .map_err(init_err)?;

        let cache_lookups = CounterVec::new(
            Opts::new("governor_cache_lookups_total", "Fast-path cache lookups"),
            &["result"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(cache_lookups.clone()))
            .map_err(init_err)?;

        let synthesis_duration = Histogram::with_opts(HistogramOpts::new(
            "governor_synthesis_duration_seconds",
            "Wall time spent inside the synthesis call",
        ))
        .map_err(init_err)?;
        registry
            .register(Box::new(synthesis_duration.clone()))
            .map_err(init_err)?;

        let allocated_units = IntGauge::new(
            "governor_allocated_units",
            "Compute units currently granted to the worker pool",
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(allocated_units.clone()))
            .map_err(init_err)?;

        let queue_depth = IntGauge::new("governor_queue_depth", "Items waiting in the batcher")
            .map_err(init_err)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(init_err)?;

        let pressure_level = IntGauge::new(
            "governor_memory_pressure_level",
            "Memory pressure level (0 normal, 1 elevated, 2 severe)",
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(pressure_level.clone()))
            .map_err(init_err)?;

        Ok(Self {
            registry,
            requests_total,
            cache_lookups,
            synthesis_duration,
            allocated_units,
            queue_depth,
            pressure_level,
        })
    }

    /// Count one finished work item under `outcome`.
    pub fn inc_outcome(&self, outcome: &str) {
        if let Ok(c) = self.requests_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }

    /// Count one cache lookup.
    pub fn inc_cache_lookup(&self, hit: bool) {
        let label = if hit { "hit" } else { "miss" };
        if let Ok(c) = self.cache_lookups.get_metric_with_label_values(&[label]) {
            c.inc();
        }
    }

    /// Observe one synthesis call duration.
    pub fn observe_synthesis(&self, d: Duration) {
        self.synthesis_duration.observe(d.as_secs_f64());
    }

    /// Set the allocated-units gauge.
    pub fn set_allocated_units(&self, units: usize) {
        self.allocated_units
            .set(i64::try_from(units).unwrap_or(i64::MAX));
    }

    /// Set the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Set the memory pressure gauge.
    pub fn set_pressure_level(&self, level: i64) {
        self.pressure_level.set(level);
    }

    /// Gather all metric families.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode all metrics in the Prometheus text exposition format.
    ///
    /// Returns an empty string if encoding fails.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn gather_text(&self) -> String {
        let families = self.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
