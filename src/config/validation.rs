//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`GovernorConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants such as `pressure < severe`).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value

use super::GovernorConfig;

/// Errors arising from configuration parsing, validation, overrides or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "batching.max_batch_size").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// An override named a field outside the known set.
    #[error("Unknown configuration field '{0}'")]
    UnknownField(String),

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for crate::GovernorError {
    fn from(e: ConfigError) -> Self {
        crate::GovernorError::Config(e.to_string())
    }
}

/// Fold a list of violations into a single [`ConfigError::Validation`].
pub(crate) fn join_errors(errors: Vec<ConfigError>) -> ConfigError {
    ConfigError::Validation(
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn positive_finite(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

/// Validate all semantic constraints on a [`GovernorConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &GovernorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let a = &config.allocation;

    // ── Allocation ───────────────────────────────────────────────────
    if !(positive_finite(a.cpu_target) && a.cpu_target <= 100.0) {
        errors.push(invalid(
            "allocation.cpu_target",
            a.cpu_target,
            "must be in (0, 100]",
        ));
    }

    if !(positive_finite(a.hysteresis_factor) && a.hysteresis_factor < 1.0) {
        errors.push(invalid(
            "allocation.hysteresis_factor",
            a.hysteresis_factor,
            "must be in (0, 1)",
        ));
    }

    if !positive_finite(a.monitoring_interval_s) {
        errors.push(invalid(
            "allocation.monitoring_interval_s",
            a.monitoring_interval_s,
            "must be greater than 0",
        ));
    }

    if !(a.allocation_cooldown_s.is_finite() && a.allocation_cooldown_s >= 0.0) {
        errors.push(invalid(
            "allocation.allocation_cooldown_s",
            a.allocation_cooldown_s,
            "must be non-negative",
        ));
    }

    if a.window_size == 0 {
        errors.push(invalid("allocation.window_size", 0, "must be at least 1"));
    }

    if let Some(total) = a.total_units {
        if total == 0 {
            errors.push(invalid("allocation.total_units", 0, "must be at least 1"));
        } else if a.reserved_units >= total {
            errors.push(invalid(
                "allocation.reserved_units",
                a.reserved_units,
                "must leave at least one unit for the worker pool",
            ));
        }
    }

    if a.initial_units == Some(0) {
        errors.push(invalid("allocation.initial_units", 0, "must be at least 1"));
    }

    if !(a.thermal_safe_margin_c.is_finite() && a.thermal_safe_margin_c >= 0.0) {
        errors.push(invalid(
            "allocation.thermal_safe_margin_c",
            a.thermal_safe_margin_c,
            "must be non-negative",
        ));
    }

    if !a.thermal_limit_c.is_finite() {
        errors.push(invalid(
            "allocation.thermal_limit_c",
            a.thermal_limit_c,
            "must be finite",
        ));
    }

    if !(positive_finite(a.memory_stress_percent) && a.memory_stress_percent <= 100.0) {
        errors.push(invalid(
            "allocation.memory_stress_percent",
            a.memory_stress_percent,
            "must be in (0, 100]",
        ));
    }

    if !positive_finite(a.overload_rtf) {
        errors.push(invalid(
            "allocation.overload_rtf",
            a.overload_rtf,
            "must be greater than 0",
        ));
    }

    if !(a.overload_bias.is_finite() && a.overload_bias >= 0.0) {
        errors.push(invalid(
            "allocation.overload_bias",
            a.overload_bias,
            "must be non-negative",
        ));
    }

    if a.probe_timeout_ms == 0 {
        errors.push(invalid("allocation.probe_timeout_ms", 0, "must be at least 1"));
    }

    // ── Batching ─────────────────────────────────────────────────────
    let b = &config.batching;
    if b.max_batch_size == 0 {
        errors.push(invalid("batching.max_batch_size", 0, "must be at least 1"));
    }

    if b.batch_timeout_ms == 0 {
        errors.push(invalid("batching.batch_timeout_ms", 0, "must be at least 1"));
    }

    if b.worker_count == Some(0) {
        errors.push(invalid("batching.worker_count", 0, "must be at least 1"));
    }

    if b.high_water_mark == 0 {
        errors.push(invalid("batching.high_water_mark", 0, "must be at least 1"));
    }

    // ── Cache ────────────────────────────────────────────────────────
    let c = &config.cache;
    if c.capacity == 0 {
        errors.push(invalid("cache.capacity", 0, "must be at least 1"));
    }

    if c.byte_budget == 0 {
        errors.push(invalid("cache.byte_budget", 0, "must be at least 1"));
    }

    if c.ttl_s == 0 {
        errors.push(invalid("cache.ttl_s", 0, "must be at least 1 second"));
    }

    // ── Memory ───────────────────────────────────────────────────────
    let m = &config.memory;
    if !(positive_finite(m.pressure_percent) && m.pressure_percent <= 100.0) {
        errors.push(invalid(
            "memory.pressure_percent",
            m.pressure_percent,
            "must be in (0, 100]",
        ));
    }

    if !(positive_finite(m.severe_percent) && m.severe_percent <= 100.0) {
        errors.push(invalid(
            "memory.severe_percent",
            m.severe_percent,
            "must be in (0, 100]",
        ));
    }

    if m.pressure_percent >= m.severe_percent {
        errors.push(invalid(
            "memory.pressure_percent",
            m.pressure_percent,
            "must be below memory.severe_percent",
        ));
    }

    if !(m.conservative_multiplier.is_finite() && m.conservative_multiplier >= 1.0) {
        errors.push(invalid(
            "memory.conservative_multiplier",
            m.conservative_multiplier,
            "must be at least 1.0",
        ));
    }

    // ── Telemetry ────────────────────────────────────────────────────
    if config.telemetry.window_size == 0 {
        errors.push(invalid("telemetry.window_size", 0, "must be at least 1"));
    }

    if !positive_finite(config.telemetry.report_interval_s) {
        errors.push(invalid(
            "telemetry.report_interval_s",
            config.telemetry.report_interval_s,
            "must be greater than 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
