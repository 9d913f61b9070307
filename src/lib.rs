//! # synth-governor
//!
//! Adaptive resource governor and request-batching layer for a compute-heavy,
//! latency-sensitive synthesis worker.
//!
//! ## Architecture
//!
//! ```text
//! ResourceSampler ──▶ AllocationController ──▶ WorkerPool (size)
//!                            ▲
//!                            │ rolling RTF
//! submit ──▶ RequestBatcher ──▶ WorkerPool ──▶ Synthesizer ──▶ TelemetryAggregator
//!               │   ▲                                 │
//!               │   └──────── FastPathCache ◀─────────┘
//!               ▼
//!        MemoryGovernor (pressure level, emergency eviction)
//! ```
//!
//! Every component is owned by a [`GovernorContext`] built once at startup;
//! there is no ambient global state.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ObservabilityConfig};

pub mod batcher;
pub mod cache;
pub mod config;
pub mod context;
pub mod memory;
pub mod metrics;
pub mod resource;
pub mod synth;
pub mod telemetry;

// Re-exports for convenience
pub use batcher::{BatchError, Completion, Priority, RequestBatcher, WorkHandle, WorkRequest};
pub use cache::{FastPathCache, Fingerprint};
pub use config::GovernorConfig;
pub use context::{GovernorContext, GovernorHandles};
pub use memory::{MemoryGovernor, MemoryTier, PressureLevel, TierProfile};
pub use resource::{AllocationController, AllocationState, ResourceSample, ResourceSampler};
pub use synth::{EchoSynthesizer, SynthesisOutput, SynthesisRequest, Synthesizer};
pub use telemetry::{PerformanceStat, TelemetryAggregator, TelemetryReport};

/// Initialise the global tracing subscriber with the default format.
///
/// Equivalent to [`init_tracing_with`] on a default [`ObservabilityConfig`].
///
/// # Errors
///
/// Returns [`GovernorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), GovernorError> {
    init_tracing_with(&ObservabilityConfig::default())
}

/// Initialise the global tracing subscriber from configuration.
///
/// The `LOG_FORMAT` environment variable, when set, takes precedence over
/// `config.log_format`:
/// - `"json"` — structured JSON output for log aggregators
/// - `"pretty"` — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`GovernorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing_with(config: &ObservabilityConfig) -> Result<(), GovernorError> {
    let env = std::env::var("LOG_FORMAT").ok();
    let result = match resolve_log_format(env.as_deref(), &config.log_format) {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| GovernorError::Other(format!("tracing init failed: {e}")))
}

/// Pick the log format: a recognised `LOG_FORMAT` value wins, otherwise the
/// configured one.
pub fn resolve_log_format(env: Option<&str>, configured: &LogFormat) -> LogFormat {
    match env.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
        _ => configured.clone(),
    }
}

/// Top-level governor errors.
///
/// Per-request outcomes use [`BatchError`]; this type covers everything that
/// crosses a component boundary (probes, listeners, eviction handlers, the
/// synthesis backend, configuration).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GovernorError {
    /// The external synthesis call failed.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading CPU, memory or thermal state from the OS failed.
    #[error("resource probe failed: {0}")]
    Probe(String),

    /// An allocation listener rejected or failed to apply a new state.
    #[error("allocation listener failed: {0}")]
    Listener(String),

    /// An emergency eviction or reclaim handler failed.
    #[error("eviction handler failed: {0}")]
    Eviction(String),

    /// An internal channel closed unexpectedly, indicating shutdown.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Describe a caught panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_includes_message() {
        let err = GovernorError::Config("cpu_target out of range".to_string());
        assert!(err.to_string().contains("cpu_target out of range"));
    }

    #[test]
    fn test_synthesis_error_display_has_prefix() {
        let err = GovernorError::Synthesis("model not loaded".into());
        assert_eq!(err.to_string(), "synthesis failed: model not loaded");
    }

    #[test]
    fn test_panic_message_extracts_str_and_string() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_unix_millis_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order.
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }

    #[test]
    fn test_configured_log_format_used_when_env_unset() {
        assert_eq!(resolve_log_format(None, &LogFormat::Json), LogFormat::Json);
        assert_eq!(resolve_log_format(None, &LogFormat::Pretty), LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_env_overrides_config() {
        assert_eq!(resolve_log_format(Some("json"), &LogFormat::Pretty), LogFormat::Json);
        assert_eq!(resolve_log_format(Some("PRETTY"), &LogFormat::Json), LogFormat::Pretty);
        // Unrecognised values fall back to the configured format
        assert_eq!(resolve_log_format(Some("xml"), &LogFormat::Json), LogFormat::Json);
    }
}
