use log::trace;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-cpu current frequency from `cpu<N>/cpufreq/scaling_cur_freq`.
#[derive(Debug)]
pub struct CpuFreq {
    cpu_root: PathBuf,
}

impl CpuFreq {
    pub fn new(cpu_root: &Path) -> Self {
        Self {
            cpu_root: cpu_root.to_path_buf(),
        }
    }

    fn path(&self, cpu: usize) -> PathBuf {
        self.cpu_root
            .join(format!("cpu{cpu}"))
            .join("cpufreq/scaling_cur_freq")
    }

    /// The kernel reports kHz; rounded to the nearest MHz. `0` when the file
    /// is missing, unreadable or garbled.
    pub fn read_mhz(&self, cpu: usize) -> u32 {
        let path = self.path(cpu);
        match fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(khz) => u32::try_from((khz + 500) / 1000).unwrap_or(u32::MAX),
                Err(e) => {
                    trace!("Bad frequency in {}: {e}", path.display());
                    0
                }
            },
            Err(e) => {
                trace!("Can't read {}: {e}", path.display());
                0
            }
        }
    }
}
