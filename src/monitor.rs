pub mod cpufreq;
pub mod hashrate;
pub mod hwmon;

use crate::monitor::cpufreq::CpuFreq;
use crate::monitor::hwmon::Hwmon;
use std::path::Path;

/// Read-only hardware telemetry. Implementations never fail: an unreadable
/// source reads as `0`.
pub trait MetricsSource {
    /// Current clock of one logical processor, in MHz.
    fn frequency_mhz(&self, cpu: usize) -> u32;

    /// Current temperature of one thermal domain (chiplet), in °C.
    fn temperature_c(&self, domain: usize) -> f64;

    fn frequencies_mhz(&self, cpus: &[usize]) -> Vec<u32> {
        cpus.iter().map(|&cpu| self.frequency_mhz(cpu)).collect()
    }
}

/// Production source: cpufreq for clocks, hwmon for chiplet temperatures.
#[derive(Debug)]
pub struct SysfsMetrics {
    cpufreq: CpuFreq,
    hwmon: Hwmon,
}

impl SysfsMetrics {
    pub fn new(cpu_root: &Path, hwmon_root: &Path, sensor_prefix: &str) -> Self {
        Self {
            cpufreq: CpuFreq::new(cpu_root),
            hwmon: Hwmon::new(hwmon_root, sensor_prefix),
        }
    }

    pub fn sensor_count(&self) -> usize {
        self.hwmon.sensor_count()
    }
}

impl MetricsSource for SysfsMetrics {
    fn frequency_mhz(&self, cpu: usize) -> u32 {
        self.cpufreq.read_mhz(cpu)
    }

    fn temperature_c(&self, domain: usize) -> f64 {
        self.hwmon.read_celsius(domain)
    }
}
