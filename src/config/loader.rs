//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`GovernorConfig`], and run
//! validation before returning. Also layers start-time environment overrides
//! on top of a parsed config.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use tracing::{debug, warn};

use super::validation::{self, ConfigError};
use super::{ConfigField, GovernorConfig};

/// Prefix for environment variables read by [`apply_env_defaults`].
pub const ENV_PREFIX: &str = "SYNTH_GOVERNOR_";

/// Load a [`GovernorConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(GovernorConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_file(path: &Path) -> Result<GovernorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`GovernorConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<GovernorConfig, ConfigError> {
    let config: GovernorConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(validation::join_errors)?;

    Ok(config)
}

/// Apply overrides from a key/value source, one per [`ConfigField`].
///
/// `lookup` receives the upper-cased variable name (for example
/// `SYNTH_GOVERNOR_CPU_TARGET`). Values that fail to parse or validate are
/// logged and skipped; the remaining overrides still apply.
pub fn apply_overrides_from<F>(config: GovernorConfig, lookup: F) -> GovernorConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut current = config;
    for field in ConfigField::all() {
        let key = format!("{ENV_PREFIX}{}", field.name().to_ascii_uppercase());
        let Some(raw) = lookup(&key) else {
            continue;
        };
        match current.with_override(*field, &raw) {
            Ok(next) => {
                debug!(field = %field, value = %raw, "config override applied");
                current = next;
            }
            Err(e) => {
                warn!(field = %field, value = %raw, error = %e, "config override ignored");
            }
        }
    }
    current
}

/// Apply `SYNTH_GOVERNOR_<FIELD>` environment variables to `config`.
///
/// Read once at startup; later changes to the environment have no effect.
pub fn apply_env_defaults(config: GovernorConfig) -> GovernorConfig {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[allocation]
cpu_target = 70.0
hysteresis_factor = 0.5
allocation_cooldown_s = 2.0
total_units = 8

[batching]
max_batch_size = 4
batch_timeout_ms = 10

[cache]
capacity = 64

[memory]
pressure_percent = 10.0
severe_percent = 18.0

[observability]
log_format = "json"
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test").expect("test: valid config");
        assert_eq!(config.allocation.cpu_target, 70.0);
        assert_eq!(config.allocation.total_units, Some(8));
        assert_eq!(config.batching.max_batch_size, 4);
        assert_eq!(config.cache.capacity, 64);
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let result = load_from_str("not valid toml [[[", "bad.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml = "[batching]\nmax_batch_size = 0\n";
        let result = load_from_str(toml, "zero.toml");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_str_wrong_type_is_parse_error() {
        let toml = "[allocation]\ncpu_target = \"high\"\n";
        let result = load_from_str(toml, "typed.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_file_missing_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/governor.toml"));
        match result {
            Err(ConfigError::Io { file, .. }) => assert!(file.contains("governor.toml")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_valid_succeeds() {
        let mut file = tempfile::NamedTempFile::new().expect("test: tempfile");
        file.write_all(VALID_TOML.as_bytes()).expect("test: write");
        let config = load_from_file(file.path()).expect("test: load");
        assert_eq!(config.batching.batch_timeout_ms, 10);
    }

    #[test]
    fn test_apply_overrides_from_sets_known_fields() {
        let vars: HashMap<&str, &str> = [
            ("SYNTH_GOVERNOR_CPU_TARGET", "60"),
            ("SYNTH_GOVERNOR_MAX_BATCH_SIZE", "9"),
        ]
        .into_iter()
        .collect();
        let config = apply_overrides_from(GovernorConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.allocation.cpu_target, 60.0);
        assert_eq!(config.batching.max_batch_size, 9);
    }

    #[test]
    fn test_apply_overrides_from_skips_invalid_values() {
        let vars: HashMap<&str, &str> = [
            ("SYNTH_GOVERNOR_CPU_TARGET", "not-a-number"),
            ("SYNTH_GOVERNOR_BATCH_TIMEOUT_MS", "40"),
        ]
        .into_iter()
        .collect();
        let config = apply_overrides_from(GovernorConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.allocation.cpu_target, 75.0);
        assert_eq!(config.batching.batch_timeout_ms, 40);
    }

    #[test]
    fn test_apply_overrides_from_empty_source_is_identity() {
        let config = apply_overrides_from(GovernorConfig::default(), |_| None);
        assert_eq!(config, GovernorConfig::default());
    }
}
