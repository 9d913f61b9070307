//! # Memory Governor
//!
//! ## Responsibility
//! Watch this process's resident memory as a share of system memory on an
//! independent cadence. Above the pressure threshold a reclaim pass runs;
//! above the severe threshold every registered emergency eviction handler
//! runs as well. The resulting [`PressureLevel`] is published on a `watch`
//! channel for the batcher.
//!
//! ## Tiering
//! Total system memory is read once at construction and mapped to a
//! [`MemoryTier`]. The tier fixes the tick interval, trigger thresholds,
//! queue pre-allocation and cache budgets for the life of the process.
//!
//! ## Failure semantics
//! Handlers are best-effort: an error or panic in one is logged and the
//! remaining handlers still run. A failed probe read skips the tick.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;
use crate::metrics::GovernorMetrics;
use crate::resource::MemoryProbe;
use crate::{panic_message, GovernorError};

const GIB: u64 = 1024 * 1024 * 1024;

/// Tick interval when reclaiming aggressively.
pub const AGGRESSIVE_TICK: Duration = Duration::from_secs(30);
/// Tick interval in conservative mode.
pub const CONSERVATIVE_TICK: Duration = Duration::from_secs(120);

/// Memory class of the host, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Less than 8 GiB.
    Low,
    /// 8 GiB up to 32 GiB.
    Medium,
    /// 32 GiB or more.
    High,
}

impl MemoryTier {
    /// Classify a host by total physical memory.
    pub fn from_total_bytes(total: u64) -> Self {
        if total < 8 * GIB {
            MemoryTier::Low
        } else if total < 32 * GIB {
            MemoryTier::Medium
        } else {
            MemoryTier::High
        }
    }
}

/// Budgets and thresholds derived from a [`MemoryTier`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierProfile {
    /// Host tier.
    pub tier: MemoryTier,
    /// Aggressive hosts tick faster and use the configured thresholds as-is.
    pub aggressive: bool,
    /// Governor cadence.
    pub tick_interval: Duration,
    /// Process memory percent that triggers reclaim.
    pub pressure_percent: f64,
    /// Process memory percent that triggers emergency eviction.
    pub severe_percent: f64,
    /// Initial capacity reserved for the admission queue.
    pub queue_preallocation: usize,
    /// Fast-path cache entry bound.
    pub cache_capacity: usize,
    /// Fast-path cache byte bound.
    pub cache_byte_budget: usize,
}

impl TierProfile {
    /// Profile for `tier` scaled from the configured budgets.
    ///
    /// Low and medium tiers are aggressive. The high tier is conservative:
    /// it ticks less often and scales both thresholds by
    /// `conservative_multiplier`, capped at 100.
    pub fn for_tier(tier: MemoryTier, config: &GovernorConfig) -> Self {
        let divisor = match tier {
            MemoryTier::Low => 4,
            MemoryTier::Medium => 2,
            MemoryTier::High => 1,
        };
        let aggressive = tier != MemoryTier::High;
        let scale = if aggressive {
            1.0
        } else {
            config.memory.conservative_multiplier
        };

        Self {
            tier,
            aggressive,
            tick_interval: if aggressive {
                AGGRESSIVE_TICK
            } else {
                CONSERVATIVE_TICK
            },
            pressure_percent: (config.memory.pressure_percent * scale).min(100.0),
            severe_percent: (config.memory.severe_percent * scale).min(100.0),
            queue_preallocation: (config.batching.high_water_mark / divisor).max(1),
            cache_capacity: (config.cache.capacity / divisor).max(1),
            cache_byte_budget: (config.cache.byte_budget / divisor).max(1),
        }
    }

    /// Classify a process memory percentage against this profile.
    pub fn classify(&self, percent: f64) -> PressureLevel {
        if percent > self.severe_percent {
            PressureLevel::Severe
        } else if percent > self.pressure_percent {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }
}

/// Current memory pressure as seen by the governor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    /// Below the pressure threshold.
    #[default]
    Normal,
    /// Above the pressure threshold; reclaim runs.
    Elevated,
    /// Above the severe threshold; emergency eviction runs.
    Severe,
}

impl PressureLevel {
    /// Gauge encoding: 0, 1, 2.
    pub fn as_gauge(self) -> i64 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Elevated => 1,
            PressureLevel::Severe => 2,
        }
    }
}

/// A zero-argument reclaim or eviction callback.
pub type EvictionHandler = Arc<dyn Fn() -> Result<(), GovernorError> + Send + Sync>;

/// Named reclaim and emergency handlers, populated at startup.
#[derive(Default)]
pub struct EvictionRegistry {
    reclaim: Mutex<Vec<(String, EvictionHandler)>>,
    emergency: Mutex<Vec<(String, EvictionHandler)>>,
}

/// Outcome of running one class of handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HandlerRun {
    /// Handlers that returned `Ok`.
    pub succeeded: usize,
    /// Names of handlers that failed or panicked.
    pub failed: Vec<String>,
}

fn run_handlers(kind: &str, handlers: Vec<(String, EvictionHandler)>) -> HandlerRun {
    let mut run = HandlerRun::default();
    for (name, handler) in handlers {
        match catch_unwind(AssertUnwindSafe(|| (*handler)())) {
            Ok(Ok(())) => {
                debug!(kind, handler = %name, "memory handler completed");
                run.succeeded += 1;
            }
            Ok(Err(e)) => {
                warn!(kind, handler = %name, error = %e, "memory handler failed");
                run.failed.push(name);
            }
            Err(payload) => {
                warn!(
                    kind,
                    handler = %name,
                    panic = %panic_message(payload.as_ref()),
                    "memory handler panicked"
                );
                run.failed.push(name);
            }
        }
    }
    run
}

impl EvictionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler run on every pressured tick.
    pub fn register_reclaim<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Result<(), GovernorError> + Send + Sync + 'static,
    {
        self.reclaim.lock().push((name.into(), Arc::new(handler)));
    }

    /// Register a handler run on severe pressure.
    pub fn register_emergency<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Result<(), GovernorError> + Send + Sync + 'static,
    {
        self.emergency.lock().push((name.into(), Arc::new(handler)));
    }

    /// Registered `(reclaim, emergency)` handler counts.
    pub fn counts(&self) -> (usize, usize) {
        (self.reclaim.lock().len(), self.emergency.lock().len())
    }

    /// Run every reclaim handler. The list is copied out of the lock first,
    /// so handlers may register further handlers.
    pub fn run_reclaim(&self) -> HandlerRun {
        let handlers = self.reclaim.lock().clone();
        run_handlers("reclaim", handlers)
    }

    /// Run every emergency handler.
    pub fn run_emergency(&self) -> HandlerRun {
        let handlers = self.emergency.lock().clone();
        run_handlers("emergency", handlers)
    }
}

/// Result of one governor tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureReport {
    /// Process memory percent at the start of the tick.
    pub before_percent: f64,
    /// Percent after handlers ran, if any ran.
    pub after_percent: Option<f64>,
    /// Level published at the end of the tick.
    pub level: PressureLevel,
    /// Reclaim handler results.
    pub reclaim: HandlerRun,
    /// Emergency handler results.
    pub emergency: HandlerRun,
}

/// Process-memory watchdog.
pub struct MemoryGovernor {
    probe: Mutex<Box<dyn MemoryProbe>>,
    profile: TierProfile,
    registry: EvictionRegistry,
    level_tx: watch::Sender<PressureLevel>,
    metrics: Option<Arc<GovernorMetrics>>,
}

impl MemoryGovernor {
    /// Read total memory once, pick the tier and build the governor.
    ///
    /// If total memory cannot be read the medium tier is assumed.
    pub fn new(mut probe: Box<dyn MemoryProbe>, config: &GovernorConfig) -> Self {
        let tier = match probe.total_memory_bytes() {
            Ok(total) => MemoryTier::from_total_bytes(total),
            Err(e) => {
                warn!(error = %e, "total memory unavailable, assuming medium tier");
                MemoryTier::Medium
            }
        };
        let profile = TierProfile::for_tier(tier, config);
        info!(
            tier = ?profile.tier,
            aggressive = profile.aggressive,
            pressure_percent = profile.pressure_percent,
            severe_percent = profile.severe_percent,
            "memory governor configured"
        );
        Self::with_profile(probe, profile)
    }

    /// Governor with an explicit profile.
    pub fn with_profile(probe: Box<dyn MemoryProbe>, profile: TierProfile) -> Self {
        let (level_tx, _) = watch::channel(PressureLevel::Normal);
        Self {
            probe: Mutex::new(probe),
            profile,
            registry: EvictionRegistry::new(),
            level_tx,
            metrics: None,
        }
    }

    /// Mirror the pressure level into a Prometheus gauge.
    pub fn with_metrics(mut self, metrics: Arc<GovernorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The startup tier profile.
    pub fn profile(&self) -> &TierProfile {
        &self.profile
    }

    /// Handler registry.
    pub fn registry(&self) -> &EvictionRegistry {
        &self.registry
    }

    /// Latest published level.
    pub fn level(&self) -> PressureLevel {
        *self.level_tx.borrow()
    }

    /// Receiver that observes every published level.
    pub fn subscribe(&self) -> watch::Receiver<PressureLevel> {
        self.level_tx.subscribe()
    }

    fn measure(&self) -> Result<f64, GovernorError> {
        self.probe.lock().process_memory_percent()
    }

    fn publish(&self, level: PressureLevel) {
        let previous = self.level_tx.send_replace(level);
        if previous != level {
            info!(from = ?previous, to = ?level, "memory pressure level changed");
        }
        if let Some(m) = &self.metrics {
            m.set_pressure_level(level.as_gauge());
        }
    }

    /// Run one measurement and, if needed, reclaim and eviction.
    ///
    /// Blocking: the probe and handlers run on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Probe`] if the first measurement fails; the
    /// published level is left unchanged.
    pub fn on_tick(&self) -> Result<PressureReport, GovernorError> {
        let before = self.measure()?;
        let initial_level = self.profile.classify(before);

        let mut report = PressureReport {
            before_percent: before,
            after_percent: None,
            level: initial_level,
            reclaim: HandlerRun::default(),
            emergency: HandlerRun::default(),
        };

        if initial_level == PressureLevel::Normal {
            debug!(percent = before, "memory within limits");
            self.publish(initial_level);
            return Ok(report);
        }

        warn!(
            percent = before,
            threshold = self.profile.pressure_percent,
            level = ?initial_level,
            "process memory above pressure threshold, reclaiming"
        );
        report.reclaim = self.registry.run_reclaim();

        if initial_level == PressureLevel::Severe {
            warn!(
                percent = before,
                threshold = self.profile.severe_percent,
                "process memory severe, running emergency eviction"
            );
            report.emergency = self.registry.run_emergency();
        }

        match self.measure() {
            Ok(after) => {
                report.after_percent = Some(after);
                report.level = self.profile.classify(after);
                info!(
                    before = before,
                    after = after,
                    level = ?report.level,
                    failed_handlers = report.reclaim.failed.len() + report.emergency.failed.len(),
                    "memory reclaim finished"
                );
            }
            Err(e) => {
                warn!(error = %e, "memory re-measure failed, keeping initial level");
            }
        }

        self.publish(report.level);
        Ok(report)
    }

    /// Tick at the profile interval until `shutdown` flips to `true`.
    ///
    /// Each tick runs on the blocking pool; errors and panics are logged and
    /// the loop continues.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.profile.tick_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_s = period.as_secs(), "memory governor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let gov = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || gov.on_tick()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "memory tick skipped"),
                        Err(e) => warn!(error = %e, "memory tick panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("memory governor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe returning a fixed sequence of percentages, repeating the last.
    struct Scripted {
        percents: Vec<f64>,
        next: usize,
        total: u64,
    }

    impl MemoryProbe for Scripted {
        fn process_memory_percent(&mut self) -> Result<f64, GovernorError> {
            let i = self.next.min(self.percents.len().saturating_sub(1));
            self.next += 1;
            self.percents
                .get(i)
                .copied()
                .ok_or_else(|| GovernorError::Probe("no readings".into()))
        }

        fn total_memory_bytes(&mut self) -> Result<u64, GovernorError> {
            Ok(self.total)
        }
    }

    fn governor(percents: Vec<f64>) -> MemoryGovernor {
        MemoryGovernor::new(
            Box::new(Scripted {
                percents,
                next: 0,
                total: 4 * GIB,
            }),
            &GovernorConfig::default(),
        )
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(MemoryTier::from_total_bytes(4 * GIB), MemoryTier::Low);
        assert_eq!(MemoryTier::from_total_bytes(8 * GIB), MemoryTier::Medium);
        assert_eq!(MemoryTier::from_total_bytes(31 * GIB), MemoryTier::Medium);
        assert_eq!(MemoryTier::from_total_bytes(32 * GIB), MemoryTier::High);
    }

    #[test]
    fn test_profiles_scale_budgets_and_thresholds() {
        let config = GovernorConfig::default();
        let low = TierProfile::for_tier(MemoryTier::Low, &config);
        let high = TierProfile::for_tier(MemoryTier::High, &config);

        assert!(low.aggressive);
        assert_eq!(low.tick_interval, AGGRESSIVE_TICK);
        assert_eq!(low.pressure_percent, 15.0);
        assert_eq!(low.cache_capacity, config.cache.capacity / 4);

        assert!(!high.aggressive);
        assert_eq!(high.tick_interval, CONSERVATIVE_TICK);
        assert!((high.pressure_percent - 22.5).abs() < 1e-9);
        assert!((high.severe_percent - 30.0).abs() < 1e-9);
        assert_eq!(high.cache_capacity, config.cache.capacity);
    }

    #[test]
    fn test_conservative_thresholds_cap_at_100() {
        let mut config = GovernorConfig::default();
        config.memory.pressure_percent = 80.0;
        config.memory.severe_percent = 90.0;
        let high = TierProfile::for_tier(MemoryTier::High, &config);
        assert_eq!(high.pressure_percent, 100.0);
        assert_eq!(high.severe_percent, 100.0);
    }

    #[test]
    fn test_unreadable_total_memory_falls_back_to_medium() {
        struct NoTotal;
        impl MemoryProbe for NoTotal {
            fn process_memory_percent(&mut self) -> Result<f64, GovernorError> {
                Ok(1.0)
            }
            fn total_memory_bytes(&mut self) -> Result<u64, GovernorError> {
                Err(GovernorError::Probe("denied".into()))
            }
        }
        let gov = MemoryGovernor::new(Box::new(NoTotal), &GovernorConfig::default());
        assert_eq!(gov.profile().tier, MemoryTier::Medium);
    }

    #[test]
    fn test_normal_tick_runs_no_handlers() {
        let gov = governor(vec![5.0]);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        gov.registry().register_reclaim("count", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let report = gov.on_tick().expect("test: tick");
        assert_eq!(report.level, PressureLevel::Normal);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(report.after_percent.is_none());
    }

    #[test]
    fn test_pressure_runs_reclaim_but_not_emergency() {
        let gov = governor(vec![17.0, 16.0]);
        let reclaim = Arc::new(AtomicUsize::new(0));
        let emergency = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reclaim);
        let e = Arc::clone(&emergency);
        gov.registry().register_reclaim("r", move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        gov.registry().register_emergency("e", move || {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = gov.on_tick().expect("test: tick");
        assert_eq!(reclaim.load(Ordering::SeqCst), 1);
        assert_eq!(emergency.load(Ordering::SeqCst), 0);
        assert_eq!(report.after_percent, Some(16.0));
        assert_eq!(gov.level(), PressureLevel::Elevated);
    }

    #[test]
    fn test_severe_runs_all_handlers_despite_failures() {
        let gov = governor(vec![25.0, 12.0]);
        let ran = Arc::new(AtomicUsize::new(0));
        gov.registry()
            .register_emergency("failing", || Err(GovernorError::Eviction("stuck".into())));
        gov.registry()
            .register_emergency("panicking", || panic!("handler exploded"));
        let r = Arc::clone(&ran);
        gov.registry().register_emergency("last", move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = gov.on_tick().expect("test: tick");
        assert_eq!(ran.load(Ordering::SeqCst), 1, "later handler still runs");
        assert_eq!(report.emergency.succeeded, 1);
        assert_eq!(report.emergency.failed, vec!["failing", "panicking"]);
        assert_eq!(report.level, PressureLevel::Normal, "level from re-measure");
    }

    #[test]
    fn test_probe_failure_is_an_error_and_keeps_level() {
        let gov = governor(vec![]);
        assert!(gov.on_tick().is_err());
        assert_eq!(gov.level(), PressureLevel::Normal);
    }

    #[test]
    fn test_subscribers_observe_level_changes() {
        let gov = governor(vec![30.0, 30.0]);
        let rx = gov.subscribe();
        gov.on_tick().expect("test: tick");
        assert_eq!(*rx.borrow(), PressureLevel::Severe);
    }

    #[test]
    fn test_handler_may_register_during_run() {
        let gov = Arc::new(governor(vec![18.0, 18.0]));
        let weak = Arc::downgrade(&gov);
        gov.registry().register_reclaim("registers", move || {
            if let Some(g) = weak.upgrade() {
                g.registry().register_reclaim("late", || Ok(()));
            }
            Ok(())
        });
        gov.on_tick().expect("test: tick without deadlock");
        assert_eq!(gov.registry().counts().0, 2);
    }

    #[test]
    fn test_pressure_level_ordering_and_gauge() {
        assert!(PressureLevel::Severe > PressureLevel::Elevated);
        assert_eq!(PressureLevel::Severe.as_gauge(), 2);
    }
}
