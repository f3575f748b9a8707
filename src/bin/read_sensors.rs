use anyhow::Result;
use ccdbench::clock::{Clock, SystemClock};
use ccdbench::monitor::hwmon::HWMON_DIR;
use ccdbench::monitor::{MetricsSource, SysfsMetrics};
use ccdbench::topology::{CpuTopology, CPU_SYSFS_DIR};
use clap::Parser;
use log::{info, trace, LevelFilter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Print the detected topology, then per-core clocks and chiplet temperatures
/// once a second. Handy for checking sensor labels before a benchmark run.
#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct CLI {
    #[arg(default_value_t = 5, help = "Number of readings to take")]
    count: u32,
    #[arg(long, default_value = "Tccd")]
    sensor_prefix: String,
    #[arg(long, default_value_t = 8)]
    cores_per_domain: usize,
}

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;
    let args = CLI::parse();
    ctrlc::set_handler(move || SHUTDOWN.store(true, Ordering::Relaxed))?;

    let topology = CpuTopology::detect_or_symmetric(Path::new(CPU_SYSFS_DIR), args.cores_per_domain);
    info!("Topology: {topology}");
    for core in &topology.cores {
        trace!("core {}: threads {:?}, chiplet {}", core.index, core.threads, core.domain);
    }

    let metrics = SysfsMetrics::new(Path::new(CPU_SYSFS_DIR), Path::new(HWMON_DIR), &args.sensor_prefix);
    let clock = SystemClock::new(&SHUTDOWN);
    for _ in 0..args.count {
        if clock.cancelled() {
            break;
        }
        let temps: Vec<String> = topology
            .domains()
            .iter()
            .map(|&domain| format!("{:.1}", metrics.temperature_c(domain)))
            .collect();
        let freqs = metrics.frequencies_mhz(&topology.logical_cpus());
        info!("°C: [{}] MHz: {freqs:?}", temps.join(", "));
        clock.sleep(Duration::from_secs(1));
    }
    Ok(())
}
