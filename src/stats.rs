use crate::driver::trial::UnitSummary;
use crate::Sample;
use log::trace;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const SAMPLE_HEADER: &str = "timestamp,\
    unit,\
    thermal_domain,\
    hashrate_status,\
    hashrate,\
    hashes_total,\
    frequency_mhz,\
    temperature_c";

pub const SUMMARY_HEADER: &str = "unit,\
    thermal_domain,\
    threads,\
    affinity_mask,\
    samples,\
    measured_samples,\
    avg_hashrate,\
    peak_hashrate,\
    avg_frequency_mhz,\
    peak_frequency_mhz,\
    baseline_c,\
    peak_temperature_c,\
    temperature_delta_c,\
    thermally_stable,\
    notes";

/// Where the sampler and scheduler send their records.
pub trait RunLog {
    fn record_sample(&mut self, sample: &Sample) -> io::Result<()>;

    fn record_summary(&mut self, summary: &UnitSummary) -> io::Result<()>;
}

/// Appends to `samples_<run>.csv` and `summary_<run>.csv` in the stats
/// directory, writing the header when a file is first created. Every record
/// is flushed as it arrives so an interrupted run keeps what it measured.
pub struct CsvLog {
    samples_path: PathBuf,
    summary_path: PathBuf,
}

impl CsvLog {
    pub fn new(stats_dir: &Path, run: &str) -> Self {
        Self {
            samples_path: stats_dir.join(format!("samples_{run}.csv")),
            summary_path: stats_dir.join(format!("summary_{run}.csv")),
        }
    }

    pub fn samples_path(&self) -> &Path {
        &self.samples_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }
}

impl RunLog for CsvLog {
    fn record_sample(&mut self, sample: &Sample) -> io::Result<()> {
        append_row(&self.samples_path, SAMPLE_HEADER, &sample.to_string())
    }

    fn record_summary(&mut self, summary: &UnitSummary) -> io::Result<()> {
        append_row(&self.summary_path, SUMMARY_HEADER, &summary.to_string())
    }
}

fn append_row(path: &Path, header: &str, row: &str) -> io::Result<()> {
    if !path.exists() {
        trace!("Log file {path:?} doesn't exist, creating...");
        create_csv_file(path, header)?;
    }
    let mut log_file = OpenOptions::new().append(true).open(path)?;
    writeln!(log_file, "{row}")
}

fn create_csv_file(path: &Path, header: &str) -> io::Result<()> {
    let mut log_file = OpenOptions::new().create_new(true).write(true).open(path)?;
    writeln!(log_file, "{header}")
    // File is closed when it goes out of scope
}

/// Quote a free-text CSV field.
pub fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::UnitId;
    use chrono::Local;
    use std::fs;

    #[test]
    fn test_header_written_once() {
        let dir = std::env::temp_dir().join(format!("ccdbench-{}-csv", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let mut log = CsvLog::new(&dir, "test");
        let sample = Sample {
            timestamp: Local::now(),
            unit: UnitId::Core(0),
            thermal_domain: 0,
            throughput: None,
            frequency_mhz: vec![0, 0],
            temperature_c: 0.0,
        };
        log.record_sample(&sample).unwrap();
        log.record_sample(&sample).unwrap();

        let text = fs::read_to_string(log.samples_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], SAMPLE_HEADER);
        assert_eq!(lines[0].split(',').count(), lines[1].split(',').count());
        assert!(!log.summary_path().exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("a, b"), "\"a, b\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
