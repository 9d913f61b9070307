//! Governor context — end-to-end tests
//!
//! Wire every component through `GovernorContext` with scripted probes and
//! check the cross-component feedback paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use synth_governor::resource::{MemoryProbe, RawReading, ResourceProbe};
use synth_governor::{
    EchoSynthesizer, GovernorConfig, GovernorContext, GovernorError, PressureLevel,
    SynthesisRequest, WorkRequest,
};

// ── Helpers ──────────────────────────────────────────────────────────

struct Host {
    cpu: f64,
}

impl ResourceProbe for Host {
    fn read(&mut self) -> Result<RawReading, GovernorError> {
        Ok(RawReading {
            cpu_percent: self.cpu,
            mem_percent: 40.0,
            mem_available_bytes: 6 << 30,
            temperature_c: None,
        })
    }
}

/// Process memory share controlled from the test (in hundredths of a percent).
#[derive(Clone)]
struct Rss(Arc<AtomicU64>);

impl Rss {
    fn set(&self, percent: f64) {
        self.0.store((percent * 100.0) as u64, Ordering::SeqCst);
    }
}

impl MemoryProbe for Rss {
    fn process_memory_percent(&mut self) -> Result<f64, GovernorError> {
        Ok(self.0.load(Ordering::SeqCst) as f64 / 100.0)
    }

    fn total_memory_bytes(&mut self) -> Result<u64, GovernorError> {
        Ok(16 << 30)
    }
}

fn governor(config: GovernorConfig, cpu: f64) -> (GovernorContext, Rss) {
    let rss = Rss(Arc::new(AtomicU64::new(100)));
    let ctx = GovernorContext::with_probes(
        config,
        Arc::new(EchoSynthesizer::with_delay(Duration::from_millis(1))),
        Box::new(Host { cpu }),
        Box::new(rss.clone()),
    )
    .expect("context");
    (ctx, rss)
}

fn say(text: &str) -> WorkRequest {
    WorkRequest::new(SynthesisRequest::new(text, "af_heart"))
}

// ── Memory pressure ──────────────────────────────────────────────────

#[tokio::test]
async fn test_severe_pressure_clears_cache_and_halves_batches() {
    let (ctx, rss) = governor(GovernorConfig::default(), 50.0);
    let handles = ctx.start();

    for text in ["one", "two", "three"] {
        ctx.submit(say(text))
            .expect("submit")
            .outcome()
            .await
            .expect("outcome");
    }
    assert_eq!(ctx.cache().len(), 3);

    rss.set(50.0);
    let report = ctx.memory().on_tick().expect("tick");
    assert_eq!(report.level, PressureLevel::Severe);
    assert_eq!(report.emergency.succeeded, 1);
    assert!(ctx.cache().is_empty());
    assert_eq!(ctx.batcher().effective_max_batch_size(), 3);
    assert_eq!(ctx.report().pressure, PressureLevel::Severe);

    rss.set(1.0);
    ctx.memory().on_tick().expect("tick");
    assert_eq!(ctx.batcher().effective_max_batch_size(), 6);

    handles.shutdown().await;
}

#[tokio::test]
async fn test_failing_eviction_handler_is_isolated() {
    let (ctx, rss) = governor(GovernorConfig::default(), 50.0);
    ctx.memory()
        .registry()
        .register_emergency("broken", || Err(GovernorError::Eviction("refused".into())));

    let handles = ctx.start();
    ctx.submit(say("cached line"))
        .expect("submit")
        .outcome()
        .await
        .expect("outcome");

    rss.set(60.0);
    let report = ctx.memory().on_tick().expect("tick");
    assert_eq!(report.emergency.failed, vec!["broken".to_string()]);
    assert_eq!(report.emergency.succeeded, 1);
    assert!(ctx.cache().is_empty());

    handles.shutdown().await;
}

// ── Allocation feedback ──────────────────────────────────────────────

#[tokio::test]
async fn test_busy_host_grows_worker_pool() {
    let mut config = GovernorConfig::default();
    config.allocation.monitoring_interval_s = 0.01;
    config.allocation.allocation_cooldown_s = 0.0;
    config.allocation.total_units = Some(5);
    config.allocation.initial_units = Some(1);
    let (ctx, _rss) = governor(config, 97.0);
    assert_eq!(ctx.batcher().pool().size(), 1);

    let handles = ctx.start();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ctx.batcher().pool().size() < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.controller().current().allocated_units, 4);
    assert_eq!(ctx.batcher().pool().size(), 4);

    handles.shutdown().await;
}

// ── Reports ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_periodic_reports_are_broadcast() {
    let mut config = GovernorConfig::default();
    config.telemetry.report_interval_s = 0.02;
    let (ctx, _rss) = governor(config, 50.0);
    let mut reports = ctx.subscribe_reports();
    let handles = ctx.start();

    ctx.submit(say("report me"))
        .expect("submit")
        .outcome()
        .await
        .expect("outcome");

    let report = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(r) = reports.recv().await {
                if r.performance.total_requests > 0 {
                    return r;
                }
            }
        }
    })
    .await
    .expect("report received");
    assert_eq!(report.performance.total_requests, 1);
    assert!(report.allocation.allocated_units >= 1);

    let json = serde_json::to_string(&report).expect("serialize");
    assert!(json.contains("allocated_units"));

    handles.shutdown().await;
}

#[tokio::test]
async fn test_metrics_reflect_activity() {
    let (ctx, _rss) = governor(GovernorConfig::default(), 50.0);
    let handles = ctx.start();
    ctx.submit(say("measured"))
        .expect("submit")
        .outcome()
        .await
        .expect("outcome");
    ctx.submit(say("measured"))
        .expect("submit")
        .outcome()
        .await
        .expect("outcome");

    let text = ctx.metrics().gather_text();
    assert!(text.contains("governor_requests_total"));
    assert!(text.contains("governor_cache_lookups_total"));

    handles.shutdown().await;
}
