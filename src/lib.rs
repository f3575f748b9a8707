pub mod cli;
pub mod clock;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod retry;
pub mod stats;
pub mod thermal;
pub mod topology;
pub mod workload;

use crate::cli::Configuration;
use crate::error::PreconditionError;
use crate::monitor::hashrate::Throughput;
use crate::topology::UnitId;
use chrono::{DateTime, Local, SecondsFormat};
use lazy_static::lazy_static;
use log::error;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use sysconf::raw::{sysconf, SysconfVariable};

lazy_static! {
    /// Start of this run, shared by the names of every file the run writes so
    /// that samples and summaries of one run sort together.
    pub static ref RUN_TIMESTAMP: String = Local::now().format("%Y%m%d-%H%M%S").to_string();
}

/// Number of online logical processors.
#[must_use]
pub fn core_count() -> usize {
    match sysconf(SysconfVariable::ScNprocessorsOnln) {
        Ok(count) if count > 0 => count as usize,
        Ok(_) => 1,
        Err(e) => {
            error!("Failed to read online processor count: {e:?}");
            1
        }
    }
}

/// Everything that must hold before a single measurement is taken.
pub fn check_preconditions(config: &Configuration) -> Result<(), PreconditionError> {
    check_root()?;
    check_workload(&config.workload_path)
}

pub fn check_root() -> Result<(), PreconditionError> {
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        Ok(())
    } else {
        Err(PreconditionError::NotRoot(euid))
    }
}

pub fn check_workload(path: &Path) -> Result<(), PreconditionError> {
    let metadata =
        fs::metadata(path).map_err(|_| PreconditionError::MissingWorkload(path.to_path_buf()))?;
    if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
        Ok(())
    } else {
        Err(PreconditionError::NotExecutable(path.to_path_buf()))
    }
}

/// One telemetry observation taken while a unit's workload runs.
///
/// Failed reads are kept as sentinels: `throughput` is `None` when the status
/// endpoint never answered, and frequency/temperature read as `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub unit: UnitId,
    pub thermal_domain: usize,
    pub throughput: Option<Throughput>,
    /// One entry per monitored logical processor.
    pub frequency_mhz: Vec<u32>,
    pub temperature_c: f64,
}

impl Sample {
    /// Current hashrate, `0` when unavailable.
    pub fn hashrate(&self) -> f64 {
        self.throughput.map_or(0.0, |t| t.hashrate)
    }

    pub fn is_measured(&self) -> bool {
        self.throughput.is_some()
    }
}

impl Display for Sample {
    /// One CSV row: see `stats::SAMPLE_HEADER`.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let frequencies: Vec<String> = self.frequency_mhz.iter().map(u32::to_string).collect();
        write!(
            f,
            "{},{},{},{},{:.2},{},{},{:.2}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.unit,
            self.thermal_domain,
            if self.is_measured() { "measured" } else { "unavailable" },
            self.hashrate(),
            self.throughput.map_or(0, |t| t.hashes_total),
            frequencies.join(";"),
            self.temperature_c
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_core_count() {
        assert!(core_count() >= 1);
    }

    #[test]
    fn test_missing_workload() {
        let err = check_workload(Path::new("/nonexistent/xmrig")).unwrap_err();
        assert!(matches!(err, PreconditionError::MissingWorkload(_)));
    }

    #[test]
    fn test_workload_not_executable() {
        let path = std::env::temp_dir().join(format!("ccdbench-{}-noexec", std::process::id()));
        fs::write(&path, "").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = check_workload(&path).unwrap_err();
        assert!(matches!(err, PreconditionError::NotExecutable(_)));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_workload_directory_rejected() {
        let err = check_workload(&std::env::temp_dir()).unwrap_err();
        assert!(matches!(err, PreconditionError::NotExecutable(_)));
    }

    #[test]
    fn test_sample_row() {
        let timestamp = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
        let mut sample = Sample {
            timestamp,
            unit: UnitId::Core(3),
            thermal_domain: 0,
            throughput: Some(Throughput {
                hashrate: 1834.56,
                hashes_total: 9000,
            }),
            frequency_mhz: vec![5450, 5425],
            temperature_c: 61.25,
        };
        let row = sample.to_string();
        assert!(row.ends_with(",core3,0,measured,1834.56,9000,5450;5425,61.25"));

        sample.throughput = None;
        let row = sample.to_string();
        assert!(row.contains(",unavailable,0.00,0,"));
    }
}
