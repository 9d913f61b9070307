//! # Governor Configuration
//!
//! ## Responsibility
//! Strongly-typed configuration for every governor component, parsed from
//! TOML, validated before use, and adjustable through an enumerated set of
//! named overrides.
//!
//! ## Guarantees
//! - Every field has a default: an empty TOML document is a valid config
//! - Validated: semantic constraints are checked before a config is accepted
//! - Overrides are restricted to [`ConfigField`]; unknown names are rejected
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Applying a config to running components (that belongs to `context`)
//! - Choosing memory-tier budgets (that belongs to `memory`)

pub mod loader;
pub mod validation;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_cpu_target() -> f64 {
    75.0
}

fn default_hysteresis_factor() -> f64 {
    0.6
}

fn default_monitoring_interval_s() -> f64 {
    1.0
}

fn default_allocation_cooldown_s() -> f64 {
    5.0
}

fn default_window_size() -> usize {
    10
}

fn default_reserved_units() -> usize {
    1
}

fn default_thermal_limit_c() -> f64 {
    85.0
}

fn default_thermal_safe_margin_c() -> f64 {
    10.0
}

fn default_memory_stress_percent() -> f64 {
    90.0
}

fn default_overload_rtf() -> f64 {
    1.0
}

fn default_overload_bias() -> f64 {
    10.0
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_max_batch_size() -> usize {
    6
}

fn default_batch_timeout_ms() -> u64 {
    25
}

fn default_high_water_mark() -> usize {
    256
}

fn default_cache_capacity() -> usize {
    512
}

fn default_cache_byte_budget() -> usize {
    64 * 1024 * 1024
}

fn default_cache_ttl_s() -> u64 {
    3600
}

fn default_cache_max_text_len() -> usize {
    256
}

fn default_memory_pressure_percent() -> f64 {
    15.0
}

fn default_memory_severe_percent() -> f64 {
    20.0
}

fn default_conservative_multiplier() -> f64 {
    1.5
}

fn default_telemetry_window_size() -> usize {
    100
}

fn default_report_interval_s() -> f64 {
    5.0
}

/// Convert a float seconds value to a [`Duration`], clamping negatives and
/// non-finite values to zero.
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a governor instance.
///
/// # Example
///
/// ```toml
/// [allocation]
/// cpu_target = 70.0
/// allocation_cooldown_s = 3.0
///
/// [batching]
/// max_batch_size = 8
/// batch_timeout_ms = 20
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    /// CPU-driven thread allocation and its safety clamps.
    pub allocation: AllocationConfig,
    /// Admission queue and batch collection.
    pub batching: BatchingConfig,
    /// Fast-path result cache bounds.
    pub cache: CacheConfig,
    /// Process memory thresholds.
    pub memory: MemoryConfig,
    /// Rolling statistics and report broadcast.
    pub telemetry: TelemetryConfig,
    /// Logging output.
    pub observability: ObservabilityConfig,
}

/// Allocation controller and resource sampler settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AllocationConfig {
    /// CPU utilisation (percent) above which one unit is added.
    pub cpu_target: f64,
    /// Multiplies `cpu_target` to get the scale-down bound.
    pub hysteresis_factor: f64,
    /// Sampler cadence in seconds.
    pub monitoring_interval_s: f64,
    /// Minimum spacing between allocation changes, in seconds.
    pub allocation_cooldown_s: f64,
    /// Number of samples kept in the rolling window.
    pub window_size: usize,
    /// Total schedulable units. `None` uses the detected parallelism.
    pub total_units: Option<usize>,
    /// Units never handed to the worker pool.
    pub reserved_units: usize,
    /// Starting allocation. `None` starts at half the maximum, rounded up.
    pub initial_units: Option<usize>,
    /// Temperature (°C) treated as the thermal ceiling.
    pub thermal_limit_c: f64,
    /// Minimum headroom below `thermal_limit_c` before protection engages.
    pub thermal_safe_margin_c: f64,
    /// System memory percent above which allocation is forced down.
    pub memory_stress_percent: f64,
    /// Rolling real-time factor above which the scale-up bound is lowered.
    pub overload_rtf: f64,
    /// Percentage points subtracted from `cpu_target` under overload.
    pub overload_bias: f64,
    /// Upper bound on a single OS probe read, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            cpu_target: default_cpu_target(),
            hysteresis_factor: default_hysteresis_factor(),
            monitoring_interval_s: default_monitoring_interval_s(),
            allocation_cooldown_s: default_allocation_cooldown_s(),
            window_size: default_window_size(),
            total_units: None,
            reserved_units: default_reserved_units(),
            initial_units: None,
            thermal_limit_c: default_thermal_limit_c(),
            thermal_safe_margin_c: default_thermal_safe_margin_c(),
            memory_stress_percent: default_memory_stress_percent(),
            overload_rtf: default_overload_rtf(),
            overload_bias: default_overload_bias(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl AllocationConfig {
    /// Sampler cadence as a [`Duration`].
    pub fn monitoring_interval(&self) -> Duration {
        secs(self.monitoring_interval_s)
    }

    /// Allocation cooldown as a [`Duration`].
    pub fn allocation_cooldown(&self) -> Duration {
        secs(self.allocation_cooldown_s)
    }

    /// Probe timeout as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Request batcher settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BatchingConfig {
    /// Upper bound on items per batch.
    pub max_batch_size: usize,
    /// Collection window duration in milliseconds.
    pub batch_timeout_ms: u64,
    /// Fixed worker pool size. `None` follows the allocation controller.
    pub worker_count: Option<usize>,
    /// Queue depth at which low-priority submissions are rejected.
    pub high_water_mark: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            worker_count: None,
            high_water_mark: default_high_water_mark(),
        }
    }
}

impl BatchingConfig {
    /// Collection window as a [`Duration`].
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Fast-path cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Maximum total payload bytes.
    pub byte_budget: usize,
    /// Entry time-to-live in seconds.
    pub ttl_s: u64,
    /// Requests with longer text are never cached.
    pub max_text_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            byte_budget: default_cache_byte_budget(),
            ttl_s: default_cache_ttl_s(),
            max_text_len: default_cache_max_text_len(),
        }
    }
}

impl CacheConfig {
    /// Entry time-to-live as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_s)
    }
}

/// Memory governor thresholds, as percent of total system memory used by
/// this process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Above this, a reclaim pass runs.
    pub pressure_percent: f64,
    /// Above this, emergency eviction handlers run as well.
    pub severe_percent: f64,
    /// Scale applied to both thresholds on conservative (high-memory) tiers.
    pub conservative_multiplier: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pressure_percent: default_memory_pressure_percent(),
            severe_percent: default_memory_severe_percent(),
            conservative_multiplier: default_conservative_multiplier(),
        }
    }
}

/// Telemetry aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Number of recent completions used for rolling averages.
    pub window_size: usize,
    /// Report broadcast cadence in seconds.
    pub report_interval_s: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_size: default_telemetry_window_size(),
            report_interval_s: default_report_interval_s(),
        }
    }
}

impl TelemetryConfig {
    /// Report cadence as a [`Duration`].
    pub fn report_interval(&self) -> Duration {
        secs(self.report_interval_s)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

// ── Named overrides ──────────────────────────────────────────────────────

/// A configuration field that may be overridden by name.
///
/// Names match the recognised option names (`cpu_target`,
/// `batch_timeout_ms`, ...), not the TOML section paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    /// `allocation.cpu_target`
    CpuTarget,
    /// `allocation.hysteresis_factor`
    HysteresisFactor,
    /// `allocation.monitoring_interval_s`
    MonitoringInterval,
    /// `allocation.allocation_cooldown_s`
    AllocationCooldown,
    /// `allocation.thermal_safe_margin_c`
    ThermalSafeMargin,
    /// `batching.max_batch_size`
    MaxBatchSize,
    /// `batching.batch_timeout_ms`
    BatchTimeoutMs,
    /// `batching.worker_count`
    WorkerCount,
    /// `batching.high_water_mark`
    HighWaterMark,
    /// `cache.capacity`
    CacheCapacity,
    /// `cache.byte_budget`
    CacheByteBudget,
    /// `memory.pressure_percent`
    MemoryPressurePercent,
    /// `memory.severe_percent`
    MemorySeverePercent,
}

impl ConfigField {
    /// Every overridable field, in declaration order.
    pub fn all() -> &'static [ConfigField] {
        &[
            ConfigField::CpuTarget,
            ConfigField::HysteresisFactor,
            ConfigField::MonitoringInterval,
            ConfigField::AllocationCooldown,
            ConfigField::ThermalSafeMargin,
            ConfigField::MaxBatchSize,
            ConfigField::BatchTimeoutMs,
            ConfigField::WorkerCount,
            ConfigField::HighWaterMark,
            ConfigField::CacheCapacity,
            ConfigField::CacheByteBudget,
            ConfigField::MemoryPressurePercent,
            ConfigField::MemorySeverePercent,
        ]
    }

    /// Canonical option name for this field.
    pub fn name(self) -> &'static str {
        match self {
            ConfigField::CpuTarget => "cpu_target",
            ConfigField::HysteresisFactor => "hysteresis_factor",
            ConfigField::MonitoringInterval => "monitoring_interval",
            ConfigField::AllocationCooldown => "allocation_cooldown",
            ConfigField::ThermalSafeMargin => "thermal_safe_margin",
            ConfigField::MaxBatchSize => "max_batch_size",
            ConfigField::BatchTimeoutMs => "batch_timeout_ms",
            ConfigField::WorkerCount => "worker_count",
            ConfigField::HighWaterMark => "high_water_mark",
            ConfigField::CacheCapacity => "cache_capacity",
            ConfigField::CacheByteBudget => "cache_byte_budget",
            ConfigField::MemoryPressurePercent => "memory_pressure_percent",
            ConfigField::MemorySeverePercent => "memory_severe_percent",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConfigField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ConfigField::all()
            .iter()
            .copied()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownField(s.to_string()))
    }
}

fn parse_value<T: FromStr>(field: ConfigField, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidField {
            field: field.name().into(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

impl GovernorConfig {
    /// Return a copy of this config with one field replaced.
    ///
    /// The value is parsed according to the field's type and the resulting
    /// config is validated as a whole. On error `self` is left untouched.
    ///
    /// `worker_count` accepts `"auto"` (or an empty string) to restore
    /// controller-driven sizing.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidField`] if the value does not parse.
    /// - [`ConfigError::Validation`] if the resulting config is invalid.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn with_override(&self, field: ConfigField, value: &str) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        match field {
            ConfigField::CpuTarget => next.allocation.cpu_target = parse_value(field, value)?,
            ConfigField::HysteresisFactor => {
                next.allocation.hysteresis_factor = parse_value(field, value)?
            }
            ConfigField::MonitoringInterval => {
                next.allocation.monitoring_interval_s = parse_value(field, value)?
            }
            ConfigField::AllocationCooldown => {
                next.allocation.allocation_cooldown_s = parse_value(field, value)?
            }
            ConfigField::ThermalSafeMargin => {
                next.allocation.thermal_safe_margin_c = parse_value(field, value)?
            }
            ConfigField::MaxBatchSize => next.batching.max_batch_size = parse_value(field, value)?,
            ConfigField::BatchTimeoutMs => {
                next.batching.batch_timeout_ms = parse_value(field, value)?
            }
            ConfigField::WorkerCount => {
                let trimmed = value.trim();
                next.batching.worker_count =
                    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
                        None
                    } else {
                        Some(parse_value(field, value)?)
                    };
            }
            ConfigField::HighWaterMark => {
                next.batching.high_water_mark = parse_value(field, value)?
            }
            ConfigField::CacheCapacity => next.cache.capacity = parse_value(field, value)?,
            ConfigField::CacheByteBudget => next.cache.byte_budget = parse_value(field, value)?,
            ConfigField::MemoryPressurePercent => {
                next.memory.pressure_percent = parse_value(field, value)?
            }
            ConfigField::MemorySeverePercent => {
                next.memory.severe_percent = parse_value(field, value)?
            }
        }

        validation::validate(&next).map_err(validation::join_errors)?;
        Ok(next)
    }

    /// Look up a field by name and apply [`GovernorConfig::with_override`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownField`] for names outside [`ConfigField`].
    pub fn with_named_override(&self, name: &str, value: &str) -> Result<Self, ConfigError> {
        let field: ConfigField = name.parse()?;
        self.with_override(field, value)
    }
}

/// Export the JSON Schema for [`GovernorConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GovernorConfig);
    serde_json::to_string_pretty(&schema)
}
