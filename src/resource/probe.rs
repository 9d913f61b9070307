//! OS resource probes.
//!
//! [`ResourceProbe`] and [`MemoryProbe`] are the seams between the governor
//! and the operating system. [`SystemProbe`] implements both with `sysinfo`;
//! tests substitute scripted probes.

use sysinfo::{get_current_pid, Components, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::GovernorError;

/// One raw reading of system-wide resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    /// Global CPU utilisation, 0-100.
    pub cpu_percent: f64,
    /// System memory in use, 0-100.
    pub mem_percent: f64,
    /// Memory still available to allocate, in bytes.
    pub mem_available_bytes: u64,
    /// Hottest sensor reading in °C, if any sensor is exposed.
    pub temperature_c: Option<f64>,
}

/// Source of system-wide CPU, memory and thermal readings.
///
/// Reads may block; callers run them off the async executor.
pub trait ResourceProbe: Send {
    /// Take one reading.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Probe`] if the OS query fails.
    fn read(&mut self) -> Result<RawReading, GovernorError>;
}

/// Source of process memory readings for the memory governor.
pub trait MemoryProbe: Send {
    /// Resident memory of this process as a percentage of total system memory.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Probe`] if the OS query fails.
    fn process_memory_percent(&mut self) -> Result<f64, GovernorError>;

    /// Total physical memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Probe`] if the OS query fails.
    fn total_memory_bytes(&mut self) -> Result<u64, GovernorError>;
}

/// `sysinfo`-backed probe.
///
/// Caches the [`System`] and component list between reads; the first CPU
/// reading after construction may be 0 until sysinfo has two data points.
pub struct SystemProbe {
    system: System,
    components: Components,
    pid: Option<Pid>,
}

impl SystemProbe {
    /// Create a probe and take the baseline CPU and memory readings.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            components: Components::new_with_refreshed_list(),
            pid: get_current_pid().ok(),
        }
    }

    fn hottest_component(&mut self) -> Option<f64> {
        self.components
            .list_mut()
            .iter_mut()
            .filter_map(|c| {
                c.refresh();
                let t = f64::from(c.temperature());
                (t.is_finite() && t > 0.0).then_some(t)
            })
            .reduce(f64::max)
    }

    fn total_memory(&mut self) -> Result<u64, GovernorError> {
        self.system.refresh_memory();
        match self.system.total_memory() {
            0 => Err(GovernorError::Probe("total memory reported as zero".into())),
            total => Ok(total),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn read(&mut self) -> Result<RawReading, GovernorError> {
        self.system.refresh_cpu_usage();
        let cpu_percent = f64::from(self.system.global_cpu_usage());
        if !cpu_percent.is_finite() {
            return Err(GovernorError::Probe("cpu usage is not finite".into()));
        }

        let total = self.total_memory()?;
        let available = self.system.available_memory().min(total);
        let mem_percent = (total - available) as f64 / total as f64 * 100.0;

        Ok(RawReading {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            mem_percent,
            mem_available_bytes: available,
            temperature_c: self.hottest_component(),
        })
    }
}

impl MemoryProbe for SystemProbe {
    fn process_memory_percent(&mut self) -> Result<f64, GovernorError> {
        let pid = self
            .pid
            .ok_or_else(|| GovernorError::Probe("current pid unavailable".into()))?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        let rss = self
            .system
            .process(pid)
            .map(|p| p.memory())
            .ok_or_else(|| GovernorError::Probe(format!("process {pid} not found")))?;
        let total = self.total_memory()?;
        Ok(rss as f64 / total as f64 * 100.0)
    }

    fn total_memory_bytes(&mut self) -> Result<u64, GovernorError> {
        self.total_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_probe_reading_is_in_range() {
        let mut probe = SystemProbe::new();
        let reading = probe.read().expect("test: host exposes memory info");
        assert!((0.0..=100.0).contains(&reading.cpu_percent));
        assert!((0.0..=100.0).contains(&reading.mem_percent));
        if let Some(t) = reading.temperature_c {
            assert!(t > 0.0);
        }
    }

    #[test]
    fn test_system_probe_process_memory_is_small_positive() {
        let mut probe = SystemProbe::new();
        let pct = probe
            .process_memory_percent()
            .expect("test: current process visible");
        assert!(pct > 0.0 && pct < 100.0, "got {pct}");
        assert!(probe.total_memory_bytes().expect("test: total") > 0);
    }
}
