//! # Allocation Controller
//!
//! ## Responsibility
//! Turn smoothed resource samples into a compute-unit budget for the worker
//! pool. One unit is added when CPU exceeds the target and removed when it
//! falls below `target * hysteresis_factor`; between the two nothing changes.
//!
//! ## Safety clamps, in order of precedence
//! 1. Thermal protection: when headroom first drops below the safe margin the
//!    decision is capped at half (minimum 1), bypassing the cooldown. The cap
//!    holds until headroom returns; further changes under it obey the
//!    cooldown.
//! 2. Memory stress: system memory above the stress threshold forces one unit
//!    down.
//! 3. Cooldown: other changes closer together than the cooldown are
//!    suppressed.
//!
//! ## Publication
//! [`AllocationState`] is replaced, never mutated: readers clone an `Arc`
//! snapshot. Listeners run under the controller lock; their errors and
//! panics are logged and the change stays committed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::sampler::ResourceSample;
use crate::config::AllocationConfig;
use crate::metrics::GovernorMetrics;
use crate::telemetry::TelemetryAggregator;
use crate::{panic_message, unix_millis, GovernorError};

/// Reason recorded for the initial allocation.
pub const REASON_INITIAL: &str = "initial";
/// CPU above target.
pub const REASON_SCALE_UP: &str = "cpu_scale_up";
/// CPU above the overload-biased target.
pub const REASON_SCALE_UP_OVERLOAD: &str = "cpu_scale_up_overload";
/// CPU below the hysteresis bound.
pub const REASON_SCALE_DOWN: &str = "cpu_scale_down";
/// System memory above the stress threshold.
pub const REASON_MEMORY_PRESSURE: &str = "memory_pressure";
/// Thermal headroom below the safe margin.
pub const REASON_THERMAL: &str = "thermal_protection";

/// Upper bound on inter-op threads regardless of allocation.
const MAX_INTER_OP_THREADS: usize = 4;

/// The current thread/core budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationState {
    /// Compute units granted to the worker pool.
    pub allocated_units: usize,
    /// Threads for running independent operations in parallel.
    pub inter_op_threads: usize,
    /// Threads used inside a single operation.
    pub intra_op_threads: usize,
    /// Why this state was chosen.
    pub reason: String,
    /// Unix milliseconds when this state was published.
    pub timestamp_ms: u64,
}

impl AllocationState {
    /// State for `units` with the derived thread split.
    pub fn new(units: usize, reason: impl Into<String>) -> Self {
        let units = units.max(1);
        let (inter_op_threads, intra_op_threads) = thread_split(units);
        Self {
            allocated_units: units,
            inter_op_threads,
            intra_op_threads,
            reason: reason.into(),
            timestamp_ms: unix_millis(),
        }
    }

    /// Starting state before any sample.
    pub fn initial(units: usize) -> Self {
        Self::new(units, REASON_INITIAL)
    }
}

/// Map units to `(inter_op, intra_op)` threads.
///
/// Both components are non-decreasing in `units`.
pub fn thread_split(units: usize) -> (usize, usize) {
    let units = units.max(1);
    let inter = units.div_ceil(4).clamp(1, MAX_INTER_OP_THREADS);
    (inter, units)
}

/// Receives every committed allocation change.
///
/// Called while the controller lock is held, so implementations must return
/// promptly and must not call back into the controller.
pub trait AllocationListener: Send + Sync {
    /// Apply `state`.
    ///
    /// # Errors
    ///
    /// Any error is logged by the controller and otherwise ignored.
    fn on_allocation(&self, state: &AllocationState) -> Result<(), GovernorError>;
}

/// Resolved controller thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// CPU percent above which a unit is added.
    pub cpu_target: f64,
    /// Scale-down bound as a fraction of `cpu_target`.
    pub down_ratio: f64,
    /// Minimum spacing between non-thermal changes.
    pub cooldown: Duration,
    /// Largest allowed allocation.
    pub max_units: usize,
    /// Thermal ceiling in °C.
    pub thermal_limit_c: f64,
    /// Required headroom below the ceiling.
    pub thermal_safe_margin_c: f64,
    /// System memory percent that forces a unit down.
    pub memory_stress_percent: f64,
    /// Rolling RTF above which the scale-up target is biased down.
    pub overload_rtf: f64,
    /// Percentage points removed from the target under overload.
    pub overload_bias: f64,
}

impl ControllerSettings {
    /// Resolve settings from config, detecting parallelism when
    /// `total_units` is unset.
    pub fn from_config(config: &AllocationConfig) -> Self {
        let total = config.total_units.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self {
            cpu_target: config.cpu_target,
            down_ratio: config.hysteresis_factor,
            cooldown: config.allocation_cooldown(),
            max_units: total.saturating_sub(config.reserved_units).max(1),
            thermal_limit_c: config.thermal_limit_c,
            thermal_safe_margin_c: config.thermal_safe_margin_c,
            memory_stress_percent: config.memory_stress_percent,
            overload_rtf: config.overload_rtf,
            overload_bias: config.overload_bias,
        }
    }
}

struct ControllerInner {
    last_change: Option<Instant>,
    /// Unit cap while a thermal episode lasts.
    thermal_ceiling: Option<usize>,
    listeners: Vec<(String, Arc<dyn AllocationListener>)>,
}

/// Single writer of [`AllocationState`].
pub struct AllocationController {
    settings: ControllerSettings,
    inner: Mutex<ControllerInner>,
    current: RwLock<Arc<AllocationState>>,
    feedback: Option<Arc<TelemetryAggregator>>,
    metrics: Option<Arc<GovernorMetrics>>,
}

impl AllocationController {
    /// Controller starting at `initial_units` (or half the maximum, rounded
    /// up), clamped to `1..=max_units`.
    pub fn new(config: &AllocationConfig) -> Self {
        let settings = ControllerSettings::from_config(config);
        let initial = config
            .initial_units
            .unwrap_or_else(|| settings.max_units.div_ceil(2))
            .clamp(1, settings.max_units);
        Self::with_settings(settings, initial)
    }

    /// Controller with explicit settings and starting allocation.
    pub fn with_settings(settings: ControllerSettings, initial_units: usize) -> Self {
        let initial = initial_units.clamp(1, settings.max_units.max(1));
        Self {
            settings,
            inner: Mutex::new(ControllerInner {
                last_change: None,
                thermal_ceiling: None,
                listeners: Vec::new(),
            }),
            current: RwLock::new(Arc::new(AllocationState::initial(initial))),
            feedback: None,
            metrics: None,
        }
    }

    /// Bias the scale-up threshold using telemetry's rolling RTF.
    pub fn with_feedback(mut self, telemetry: Arc<TelemetryAggregator>) -> Self {
        self.feedback = Some(telemetry);
        self
    }

    /// Mirror the allocation into a Prometheus gauge.
    pub fn with_metrics(self, metrics: Arc<GovernorMetrics>) -> Self {
        metrics.set_allocated_units(self.current().allocated_units);
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    /// Register a listener for committed changes.
    pub fn add_listener(&self, name: impl Into<String>, listener: Arc<dyn AllocationListener>) {
        self.inner.lock().listeners.push((name.into(), listener));
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Consistent snapshot of the current allocation.
    pub fn current(&self) -> Arc<AllocationState> {
        Arc::clone(&self.current.read())
    }

    /// Resolved thresholds.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// [`on_sample_at`](Self::on_sample_at) with the current instant.
    pub fn on_sample(&self, avg: &ResourceSample) -> Option<Arc<AllocationState>> {
        self.on_sample_at(avg, Instant::now())
    }

    /// Evaluate one averaged sample observed at `now`.
    ///
    /// Returns the new state when a change was committed.
    pub fn on_sample_at(&self, avg: &ResourceSample, now: Instant) -> Option<Arc<AllocationState>> {
        let s = &self.settings;
        let mut inner = self.inner.lock();
        let units = self.current().allocated_units;

        let rolling_rtf = self.feedback.as_ref().and_then(|t| t.rolling_rtf());
        let overloaded = rolling_rtf.is_some_and(|rtf| rtf > s.overload_rtf);
        let scale_up_target = if overloaded {
            (s.cpu_target - s.overload_bias).max(0.0)
        } else {
            s.cpu_target
        };

        let (mut decision, mut reason) = if avg.cpu_percent > scale_up_target {
            let reason = if overloaded && avg.cpu_percent <= s.cpu_target {
                REASON_SCALE_UP_OVERLOAD
            } else {
                REASON_SCALE_UP
            };
            ((units + 1).min(s.max_units), reason)
        } else if avg.cpu_percent < s.cpu_target * s.down_ratio {
            (units.saturating_sub(1).max(1), REASON_SCALE_DOWN)
        } else {
            (units, "stable")
        };

        if avg.mem_percent > s.memory_stress_percent {
            decision = decision.min(units.saturating_sub(1)).max(1);
            reason = REASON_MEMORY_PRESSURE;
        }

        let thermal = avg
            .temperature_c
            .is_some_and(|t| s.thermal_limit_c - t < s.thermal_safe_margin_c);
        // Ceiling is fixed at the onset of a thermal episode so sustained heat
        // holds the allocation instead of halving it on every sample.
        let mut bypass_cooldown = false;
        if thermal {
            let ceiling = *inner
                .thermal_ceiling
                .get_or_insert_with(|| (decision / 2).max(1));
            if decision > ceiling {
                decision = ceiling;
                reason = REASON_THERMAL;
            }
            bypass_cooldown = units > ceiling;
        } else if let Some(ceiling) = inner.thermal_ceiling.take() {
            debug!(ceiling, "thermal headroom restored, ceiling lifted");
        }

        if decision == units {
            return None;
        }

        if !bypass_cooldown {
            if let Some(last) = inner.last_change {
                let since = now.saturating_duration_since(last);
                if since < s.cooldown {
                    debug!(
                        from = units,
                        to = decision,
                        reason,
                        remaining_ms = (s.cooldown - since).as_millis() as u64,
                        "allocation change suppressed by cooldown"
                    );
                    return None;
                }
            }
        }

        let state = Arc::new(AllocationState::new(decision, reason));
        *self.current.write() = Arc::clone(&state);
        inner.last_change = Some(now);

        info!(
            from = units,
            allocated_units = state.allocated_units,
            inter_op_threads = state.inter_op_threads,
            intra_op_threads = state.intra_op_threads,
            reason,
            cpu = avg.cpu_percent,
            rolling_rtf = ?rolling_rtf,
            "allocation changed"
        );
        if let Some(m) = &self.metrics {
            m.set_allocated_units(state.allocated_units);
        }

        for (name, listener) in &inner.listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_allocation(&state))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = %name, error = %e, "allocation listener failed");
                }
                Err(payload) => {
                    warn!(
                        listener = %name,
                        panic = %panic_message(payload.as_ref()),
                        "allocation listener panicked"
                    );
                }
            }
        }

        Some(state)
    }
}
