//! Demo binary for synth-governor
//!
//! Builds a governor around the echo synthesizer, submits a burst of mixed
//! priority requests (with repeats to exercise the fast-path cache) and
//! prints the final telemetry report as JSON.
//!
//! ## Environment Variables
//!
//! - `GOVERNOR_CONFIG` — path to a TOML config file (optional)
//! - `SYNTH_GOVERNOR_<FIELD>` — per-field overrides, e.g. `SYNTH_GOVERNOR_CPU_TARGET=60`
//! - `LOG_FORMAT=json` — structured JSON output, overriding `[observability] log_format`
//! - `RUST_LOG=info` — log level filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use synth_governor::config::loader;
use synth_governor::{
    init_tracing_with, EchoSynthesizer, GovernorConfig, GovernorContext, Priority, SynthesisRequest,
    Synthesizer, WorkRequest,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::var_os("GOVERNOR_CONFIG").map(PathBuf::from);
    let config = match &path {
        Some(path) => loader::load_from_file(path)?,
        None => GovernorConfig::default(),
    };
    let config = loader::apply_env_defaults(config);

    let _ = init_tracing_with(&config.observability);
    if let Some(path) = &path {
        info!(path = %path.display(), "configuration loaded");
    }

    let synthesizer: Arc<dyn Synthesizer> = Arc::new(EchoSynthesizer::with_delay(Duration::from_millis(10)));
    let ctx = GovernorContext::new(config, synthesizer)?;
    let handles = ctx.start();

    info!("Starting synth-governor demo");

    let demo_requests = [
        ("Good morning, and welcome aboard.", Priority::NORMAL),
        ("Your table is ready.", Priority::HIGH),
        ("Please mind the gap.", Priority::LOW),
        ("Good morning, and welcome aboard.", Priority::NORMAL),
        ("The next train departs in five minutes.", Priority::NORMAL),
        ("Emergency exits are located at the front and rear.", Priority::CRITICAL),
        ("Please mind the gap.", Priority::LOW),
        ("Thank you for waiting.", Priority::NORMAL),
    ];

    info!(count = demo_requests.len(), "Sending demo requests");

    let mut pending = Vec::with_capacity(demo_requests.len());
    for (text, priority) in demo_requests {
        let work = WorkRequest::new(SynthesisRequest::new(text, "af_heart"))
            .with_priority(priority)
            .with_timeout(Duration::from_secs(5));
        match ctx.submit(work) {
            Ok(handle) => pending.push(handle),
            Err(e) => warn!(priority = priority.0, error = %e, "request refused"),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for handle in pending {
        let id = handle.id();
        match handle.outcome().await {
            Ok(done) => info!(
                %id,
                cache_hit = done.cache_hit,
                output_s = done.output.output_duration.as_secs_f64(),
                processing_ms = done.processing.as_millis() as u64,
                "request completed"
            ),
            Err(e) => warn!(%id, error = %e, "request failed"),
        }
    }

    let report = ctx.report();
    println!("{}", serde_json::to_string_pretty(&report)?);

    handles.shutdown().await;
    info!("Demo complete");
    Ok(())
}
