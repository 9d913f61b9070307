//! Periodic resource sampling with a rolling average.
//!
//! The sampler never blocks its caller and never surfaces probe errors: a
//! failed, busy, or timed-out read yields the previous window average.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::controller::AllocationController;
use super::probe::{RawReading, ResourceProbe};
use crate::config::AllocationConfig;
use crate::unix_millis;

/// One smoothed or raw resource observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Unix milliseconds when the sample (or newest sample in an average)
    /// was taken.
    pub timestamp_ms: u64,
    /// CPU utilisation, 0-100.
    pub cpu_percent: f64,
    /// System memory in use, 0-100.
    pub mem_percent: f64,
    /// Available memory in bytes.
    pub mem_available_bytes: u64,
    /// Temperature in °C when a sensor is available.
    pub temperature_c: Option<f64>,
}

impl ResourceSample {
    /// Sample with only CPU set; memory at 0 %, no temperature.
    pub fn cpu(cpu_percent: f64) -> Self {
        Self {
            timestamp_ms: unix_millis(),
            cpu_percent,
            mem_percent: 0.0,
            mem_available_bytes: 0,
            temperature_c: None,
        }
    }

    /// Set the memory percentage.
    pub fn with_mem_percent(mut self, mem_percent: f64) -> Self {
        self.mem_percent = mem_percent;
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    fn from_raw(raw: RawReading) -> Self {
        Self {
            timestamp_ms: unix_millis(),
            cpu_percent: raw.cpu_percent,
            mem_percent: raw.mem_percent,
            mem_available_bytes: raw.mem_available_bytes,
            temperature_c: raw.temperature_c,
        }
    }
}

/// Arithmetic mean of each field; temperature averages present values only.
fn mean(window: &VecDeque<ResourceSample>) -> Option<ResourceSample> {
    let newest = window.back()?;
    let n = window.len() as f64;

    let temps: Vec<f64> = window.iter().filter_map(|s| s.temperature_c).collect();
    let temperature_c =
        (!temps.is_empty()).then(|| temps.iter().sum::<f64>() / temps.len() as f64);

    Some(ResourceSample {
        timestamp_ms: newest.timestamp_ms,
        cpu_percent: window.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
        mem_percent: window.iter().map(|s| s.mem_percent).sum::<f64>() / n,
        mem_available_bytes: (window
            .iter()
            .map(|s| u128::from(s.mem_available_bytes))
            .sum::<u128>()
            / window.len() as u128) as u64,
        temperature_c,
    })
}

/// Fixed-window resource sampler.
pub struct ResourceSampler {
    probe: Arc<Mutex<Box<dyn ResourceProbe>>>,
    window: Mutex<VecDeque<ResourceSample>>,
    window_size: usize,
    interval: Duration,
    probe_timeout: Duration,
    failures: AtomicU64,
}

impl ResourceSampler {
    /// Sampler over `probe` with window, cadence and timeout from `config`.
    pub fn new(probe: Box<dyn ResourceProbe>, config: &AllocationConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            probe: Arc::new(Mutex::new(probe)),
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size,
            interval: config.monitoring_interval(),
            probe_timeout: config.probe_timeout(),
            failures: AtomicU64::new(0),
        }
    }

    /// Push a sample into the window, evicting the oldest when full.
    pub fn record(&self, sample: ResourceSample) {
        let mut window = self.window.lock();
        if window.len() >= self.window_size {
            window.pop_front();
        }
        window.push_back(sample);
    }

    /// Mean of the current window, or `None` before the first sample.
    pub fn average(&self) -> Option<ResourceSample> {
        mean(&self.window.lock())
    }

    /// Number of samples in the window.
    pub fn window_len(&self) -> usize {
        self.window.lock().len()
    }

    /// Failed, busy or timed-out reads since construction.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Sampling cadence.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn fallback(&self, reason: &str) -> Option<ResourceSample> {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(reason, failures, "resource probe read failed, reusing average");
        self.average()
    }

    /// Read the probe on the calling thread.
    ///
    /// Returns the fresh sample, or the previous average when the read fails
    /// or another read is still in progress.
    pub fn sample(&self) -> Option<ResourceSample> {
        let reading = match self.probe.try_lock() {
            Some(mut probe) => probe.read(),
            None => return self.fallback("probe busy"),
        };
        match reading {
            Ok(raw) => {
                let sample = ResourceSample::from_raw(raw);
                self.record(sample);
                Some(sample)
            }
            Err(e) => self.fallback(&e.to_string()),
        }
    }

    /// Read the probe on the blocking pool, bounded by the probe timeout.
    ///
    /// A read that outlives the timeout keeps the probe locked, so later
    /// calls see it as busy until it finishes.
    pub async fn sample_async(&self) -> Option<ResourceSample> {
        let probe = Arc::clone(&self.probe);
        let task = tokio::task::spawn_blocking(move || {
            let guard = probe.try_lock();
            guard.map(|mut p| p.read())
        });

        match tokio::time::timeout(self.probe_timeout, task).await {
            Ok(Ok(Some(Ok(raw)))) => {
                let sample = ResourceSample::from_raw(raw);
                self.record(sample);
                Some(sample)
            }
            Ok(Ok(Some(Err(e)))) => self.fallback(&e.to_string()),
            Ok(Ok(None)) => self.fallback("probe busy"),
            Ok(Err(join_err)) => self.fallback(&format!("probe task failed: {join_err}")),
            Err(_) => self.fallback("probe timed out"),
        }
    }

    /// Sample every interval and feed the window average to `controller`
    /// until `shutdown` flips to `true`.
    pub async fn run(
        self: Arc<Self>,
        controller: Arc<AllocationController>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "resource sampler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sample_async().await;
                    if let Some(avg) = self.average() {
                        debug!(
                            cpu = avg.cpu_percent,
                            mem = avg.mem_percent,
                            temp = ?avg.temperature_c,
                            "resource average"
                        );
                        controller.on_sample(&avg);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("resource sampler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
