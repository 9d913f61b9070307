//! # Telemetry Aggregator
//!
//! Rolling statistics computed from completed work: throughput, latency,
//! real-time factor (RTF) and cache hit rate.
//!
//! ## What it produces
//! - [`PerformanceStat`] snapshots on demand (immutable copies)
//! - A smoothed rolling RTF consumed by the allocation controller
//! - [`TelemetryReport`]s broadcast to any number of subscribers
//!
//! ## Numerics
//! Every ratio goes through [`safe_div`]: a zero or non-finite denominator
//! yields `0.0`, so no NaN or infinity ever reaches a snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::memory::PressureLevel;
use crate::metrics::GovernorMetrics;
use crate::resource::AllocationState;

/// Capacity of the report broadcast channel.
const REPORT_CHANNEL_CAPACITY: usize = 16;

/// `numerator / denominator`, or `0.0` when the result would not be finite.
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() || !numerator.is_finite() {
        return 0.0;
    }
    let q = numerator / denominator;
    if q.is_finite() {
        q
    } else {
        0.0
    }
}

/// Final state of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Synthesis (or a cache hit) produced a result.
    Succeeded,
    /// Synthesis ran and failed.
    Failed,
    /// Deadline elapsed before dispatch.
    TimedOut,
    /// Refused at admission (overload).
    ///
    /// Items whose handle was dropped before dispatch record no outcome.
    Rejected,
}

impl OutcomeStatus {
    /// Metric label for this status.
    pub fn label(self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::TimedOut => "timed_out",
            OutcomeStatus::Rejected => "rejected",
        }
    }
}

/// Timing of one finished work item, as fed to [`TelemetryAggregator::record`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    /// Final status.
    pub status: OutcomeStatus,
    /// Time spent inside the synthesis call (zero for cache hits).
    pub processing: Duration,
    /// Time between admission and dispatch.
    pub queue_wait: Duration,
    /// Duration of the produced output (zero if none).
    pub output_duration: Duration,
    /// Whether the result came from the fast-path cache.
    pub cache_hit: bool,
    /// Whether the item finished after its deadline.
    pub late: bool,
}

impl Outcome {
    /// A successful synthesis.
    pub fn succeeded(processing: Duration, output_duration: Duration) -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            processing,
            queue_wait: Duration::ZERO,
            output_duration,
            cache_hit: false,
            late: false,
        }
    }

    /// A result served from the cache.
    pub fn cache_hit(output_duration: Duration) -> Self {
        Self {
            cache_hit: true,
            ..Self::succeeded(Duration::ZERO, output_duration)
        }
    }

    /// A synthesis that ran and failed.
    pub fn failed(processing: Duration) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            ..Self::succeeded(processing, Duration::ZERO)
        }
    }

    /// An item whose deadline passed before dispatch.
    pub fn timed_out(queue_wait: Duration) -> Self {
        Self {
            status: OutcomeStatus::TimedOut,
            queue_wait,
            ..Self::succeeded(Duration::ZERO, Duration::ZERO)
        }
    }

    /// An item refused at admission.
    pub fn rejected() -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            ..Self::succeeded(Duration::ZERO, Duration::ZERO)
        }
    }

    /// Set the queue wait.
    pub fn with_queue_wait(mut self, queue_wait: Duration) -> Self {
        self.queue_wait = queue_wait;
        self
    }

    /// Mark the item as finished after its deadline.
    pub fn with_late(mut self, late: bool) -> Self {
        self.late = late;
        self
    }

    /// Processing time divided by output duration, `0.0` if undefined.
    pub fn rtf(&self) -> f64 {
        safe_div(
            self.processing.as_secs_f64(),
            self.output_duration.as_secs_f64(),
        )
    }

    fn latency_ms(&self) -> f64 {
        (self.queue_wait + self.processing).as_secs_f64() * 1000.0
    }
}

/// Immutable copy of the aggregated performance counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStat {
    /// Items recorded, any outcome.
    pub total_requests: u64,
    /// Items resolved from the cache.
    pub cache_hits: u64,
    /// Items that were looked up and missed (all non-rejected, non-hit items).
    pub cache_misses: u64,
    /// Synthesis failures.
    pub failures: u64,
    /// Items that timed out before dispatch.
    pub timeouts: u64,
    /// Items refused at admission.
    pub rejections: u64,
    /// Items that completed after their deadline.
    pub late_completions: u64,
    /// Number of RTF samples (successful, non-cached syntheses).
    pub rtf_samples: u64,
    /// Sum of RTF samples.
    pub sum_rtf: f64,
    /// Smallest RTF seen, `0.0` before any sample.
    pub min_rtf: f64,
    /// Largest RTF seen.
    pub max_rtf: f64,
    /// Lifetime mean RTF.
    pub avg_rtf: f64,
    /// Number of latency samples (successful items, cached or not).
    pub latency_samples: u64,
    /// Sum of end-to-end latencies in milliseconds.
    pub sum_latency_ms: f64,
    /// Smallest latency in milliseconds, `0.0` before any sample.
    pub min_latency_ms: f64,
    /// Largest latency in milliseconds.
    pub max_latency_ms: f64,
    /// Lifetime mean latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Mean RTF over the rolling window.
    pub rolling_avg_rtf: f64,
    /// Mean latency over the rolling window.
    pub rolling_avg_latency_ms: f64,
    /// Completions per second over the rolling window.
    pub throughput_rps: f64,
    /// `cache_hits / (cache_hits + cache_misses)`.
    pub cache_hit_rate: f64,
}

/// Periodic export: performance plus the governor state that shaped it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Wall-clock timestamp (Unix milliseconds).
    pub timestamp_ms: u64,
    /// Aggregated counters and rolling averages.
    pub performance: PerformanceStat,
    /// Allocation in force when the report was built.
    pub allocation: AllocationState,
    /// Latest memory pressure level.
    pub pressure: PressureLevel,
    /// Items waiting in the batcher.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy)]
struct WindowSample {
    at: Instant,
    rtf: Option<f64>,
    latency_ms: f64,
}

#[derive(Debug, Default)]
struct Aggregate {
    stat: PerformanceStat,
    min_rtf: Option<f64>,
    min_latency_ms: Option<f64>,
    window: VecDeque<WindowSample>,
}

/// Thread-safe aggregator of completed-work timings.
///
/// All counters live behind a single lock, so a snapshot is always
/// internally consistent.
pub struct TelemetryAggregator {
    inner: Mutex<Aggregate>,
    window_size: usize,
    reports: broadcast::Sender<TelemetryReport>,
    metrics: Option<Arc<GovernorMetrics>>,
}

impl TelemetryAggregator {
    /// Aggregator keeping the last `window_size` completions for rolling
    /// averages (minimum 1).
    pub fn new(window_size: usize) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let window_size = window_size.max(1);
        Self {
            inner: Mutex::new(Aggregate {
                window: VecDeque::with_capacity(window_size),
                ..Aggregate::default()
            }),
            window_size,
            reports,
            metrics: None,
        }
    }

    /// Mirror every recorded outcome into Prometheus metrics.
    pub fn with_metrics(mut self, metrics: Arc<GovernorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fold one outcome into the counters.
    ///
    /// Never fails: a zero output duration yields an RTF of `0.0`.
    pub fn record(&self, outcome: Outcome) {
        let rtf = outcome.rtf();
        {
            let mut guard = self.inner.lock();
            let agg = &mut *guard;
            let s = &mut agg.stat;
            s.total_requests += 1;

            match outcome.status {
                OutcomeStatus::Rejected => s.rejections += 1,
                OutcomeStatus::Failed => s.failures += 1,
                OutcomeStatus::TimedOut => s.timeouts += 1,
                OutcomeStatus::Succeeded => {}
            }
            if outcome.status != OutcomeStatus::Rejected {
                if outcome.cache_hit {
                    s.cache_hits += 1;
                } else {
                    s.cache_misses += 1;
                }
            }
            if outcome.late {
                s.late_completions += 1;
            }

            if outcome.status == OutcomeStatus::Succeeded {
                let rtf_sample = (!outcome.cache_hit).then_some(rtf);
                if let Some(rtf) = rtf_sample {
                    s.rtf_samples += 1;
                    s.sum_rtf += rtf;
                    s.max_rtf = s.max_rtf.max(rtf);
                    agg.min_rtf = Some(agg.min_rtf.map_or(rtf, |m| m.min(rtf)));
                }

                let latency_ms = outcome.latency_ms();
                let s = &mut agg.stat;
                s.latency_samples += 1;
                s.sum_latency_ms += latency_ms;
                s.max_latency_ms = s.max_latency_ms.max(latency_ms);
                agg.min_latency_ms =
                    Some(agg.min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));

                if agg.window.len() >= self.window_size {
                    agg.window.pop_front();
                }
                agg.window.push_back(WindowSample {
                    at: Instant::now(),
                    rtf: rtf_sample,
                    latency_ms,
                });
            }
        }

        if let Some(m) = &self.metrics {
            m.inc_outcome(outcome.status.label());
            if outcome.status != OutcomeStatus::Rejected {
                m.inc_cache_lookup(outcome.cache_hit);
            }
            if !outcome.cache_hit && outcome.processing > Duration::ZERO {
                m.observe_synthesis(outcome.processing);
            }
        }

        debug!(
            status = outcome.status.label(),
            cache_hit = outcome.cache_hit,
            late = outcome.late,
            rtf,
            "outcome recorded"
        );
    }

    /// Immutable copy of the current counters and derived averages.
    pub fn snapshot(&self) -> PerformanceStat {
        let agg = self.inner.lock();
        let mut stat = agg.stat.clone();

        stat.min_rtf = agg.min_rtf.unwrap_or(0.0);
        stat.min_latency_ms = agg.min_latency_ms.unwrap_or(0.0);
        stat.avg_rtf = safe_div(stat.sum_rtf, stat.rtf_samples as f64);
        stat.avg_latency_ms = safe_div(stat.sum_latency_ms, stat.latency_samples as f64);
        stat.cache_hit_rate = safe_div(
            stat.cache_hits as f64,
            (stat.cache_hits + stat.cache_misses) as f64,
        );

        let (rtf_sum, rtf_count) = agg
            .window
            .iter()
            .filter_map(|w| w.rtf)
            .fold((0.0, 0u64), |(sum, n), r| (sum + r, n + 1));
        stat.rolling_avg_rtf = safe_div(rtf_sum, rtf_count as f64);

        let latency_sum: f64 = agg.window.iter().map(|w| w.latency_ms).sum();
        stat.rolling_avg_latency_ms = safe_div(latency_sum, agg.window.len() as f64);

        stat.throughput_rps = match (agg.window.front(), agg.window.back()) {
            (Some(first), Some(last)) if agg.window.len() > 1 => safe_div(
                (agg.window.len() - 1) as f64,
                last.at.duration_since(first.at).as_secs_f64(),
            ),
            _ => 0.0,
        };

        stat
    }

    /// Mean RTF over the rolling window, or `None` before any sample.
    pub fn rolling_rtf(&self) -> Option<f64> {
        let agg = self.inner.lock();
        let samples: Vec<f64> = agg.window.iter().filter_map(|w| w.rtf).collect();
        if samples.is_empty() {
            None
        } else {
            Some(safe_div(samples.iter().sum(), samples.len() as f64))
        }
    }

    /// Subscribe to broadcast reports.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryReport> {
        self.reports.subscribe()
    }

    /// Broadcast a report. Returns the number of subscribers reached.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, report: TelemetryReport) -> usize {
        self.reports.send(report).unwrap_or(0)
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_safe_div_zero_denominator_is_zero() {
        assert_eq!(safe_div(1.0, 0.0), 0.0);
        assert_eq!(safe_div(0.0, 0.0), 0.0);
        assert_eq!(safe_div(1.0, f64::NAN), 0.0);
        assert_eq!(safe_div(f64::INFINITY, 1.0), 0.0);
        assert_eq!(safe_div(6.0, 3.0), 2.0);
    }

    #[test]
    fn test_empty_snapshot_is_all_zero() {
        let agg = TelemetryAggregator::new(10);
        let s = agg.snapshot();
        assert_eq!(s, PerformanceStat::default());
        assert!(agg.rolling_rtf().is_none());
    }

    #[test]
    fn test_record_zero_output_duration_yields_zero_rtf() {
        let agg = TelemetryAggregator::new(10);
        agg.record(Outcome::succeeded(ms(50), Duration::ZERO));
        let s = agg.snapshot();
        assert_eq!(s.total_requests, 1);
        assert_eq!(s.avg_rtf, 0.0);
        assert_eq!(s.max_rtf, 0.0);
        assert!(s.rolling_avg_rtf.is_finite());
    }

    #[test]
    fn test_rtf_min_max_avg() {
        let agg = TelemetryAggregator::new(10);
        agg.record(Outcome::succeeded(ms(100), ms(1000))); // 0.1
        agg.record(Outcome::succeeded(ms(300), ms(1000))); // 0.3
        let s = agg.snapshot();
        assert_eq!(s.rtf_samples, 2);
        assert!((s.min_rtf - 0.1).abs() < 1e-9);
        assert!((s.max_rtf - 0.3).abs() < 1e-9);
        assert!((s.avg_rtf - 0.2).abs() < 1e-9);
        assert!((s.rolling_avg_rtf - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hits_excluded_from_rtf_but_count_for_latency() {
        let agg = TelemetryAggregator::new(10);
        agg.record(Outcome::succeeded(ms(200), ms(1000)));
        agg.record(Outcome::cache_hit(ms(1000)).with_queue_wait(ms(2)));
        let s = agg.snapshot();
        assert_eq!(s.rtf_samples, 1);
        assert_eq!(s.latency_samples, 2);
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.cache_misses, 1);
        assert!((s.cache_hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_failure_timeout_rejection_counters() {
        let agg = TelemetryAggregator::new(10);
        agg.record(Outcome::failed(ms(5)));
        agg.record(Outcome::timed_out(ms(30)));
        agg.record(Outcome::rejected());
        agg.record(Outcome::succeeded(ms(5), ms(10)).with_late(true));
        let s = agg.snapshot();
        assert_eq!(s.total_requests, 4);
        assert_eq!(s.failures, 1);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.rejections, 1);
        assert_eq!(s.late_completions, 1);
        // Rejected items never reached the cache.
        assert_eq!(s.cache_hits + s.cache_misses, 3);
    }

    #[test]
    fn test_rolling_window_drops_oldest() {
        let agg = TelemetryAggregator::new(2);
        agg.record(Outcome::succeeded(ms(900), ms(1000)));
        agg.record(Outcome::succeeded(ms(100), ms(1000)));
        agg.record(Outcome::succeeded(ms(100), ms(1000)));
        let rolling = agg.rolling_rtf().expect("test: samples present");
        assert!((rolling - 0.1).abs() < 1e-9);
        // Lifetime average still includes the evicted sample.
        assert!((agg.snapshot().avg_rtf - 1.1 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_includes_queue_wait() {
        let agg = TelemetryAggregator::new(10);
        agg.record(Outcome::succeeded(ms(10), ms(100)).with_queue_wait(ms(5)));
        let s = agg.snapshot();
        assert!((s.avg_latency_ms - 15.0).abs() < 1e-6);
        assert!((s.min_latency_ms - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_publish_without_subscribers_returns_zero() {
        let agg = TelemetryAggregator::new(10);
        let report = TelemetryReport {
            timestamp_ms: 0,
            performance: agg.snapshot(),
            allocation: AllocationState::initial(1),
            pressure: PressureLevel::Normal,
            queue_depth: 0,
        };
        assert_eq!(agg.publish(report), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_report() {
        let agg = TelemetryAggregator::new(10);
        let mut rx = agg.subscribe();
        let report = TelemetryReport {
            timestamp_ms: 42,
            performance: agg.snapshot(),
            allocation: AllocationState::initial(2),
            pressure: PressureLevel::Elevated,
            queue_depth: 3,
        };
        assert_eq!(agg.publish(report), 1);
        let got = rx.recv().await.expect("test: report");
        assert_eq!(got.timestamp_ms, 42);
        assert_eq!(got.queue_depth, 3);
    }

    #[test]
    fn test_metrics_mirror_outcomes() {
        let metrics = Arc::new(GovernorMetrics::new().expect("test: metrics"));
        let agg = TelemetryAggregator::new(10).with_metrics(Arc::clone(&metrics));
        agg.record(Outcome::succeeded(ms(10), ms(100)));
        agg.record(Outcome::rejected());
        let text = metrics.gather_text();
        assert!(text.contains("outcome=\"succeeded\""));
        assert!(text.contains("outcome=\"rejected\""));
    }
}
