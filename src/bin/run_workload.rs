use anyhow::{anyhow, Result};
use ccdbench::cli::Mode;
use ccdbench::clock::{Clock, SystemClock};
use ccdbench::monitor::hashrate::{read_throughput, StatusEndpoint};
use ccdbench::retry::RetryPolicy;
use ccdbench::topology::{enumerate_units, CpuTopology, CPU_SYSFS_DIR};
use ccdbench::workload::{wait_until_ready, Controller, Workload, WorkloadSpec};
use clap::Parser;
use log::{info, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Run the workload pinned to one physical core for a few seconds, printing
/// its throughput, then stop it.
#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct CLI {
    #[arg(default_value_t = 0, help = "Physical core to pin to")]
    core: usize,
    #[arg(long, short, default_value_t = 10)]
    seconds: u64,
    #[arg(long, short = 'x', default_value = "/usr/local/bin/xmrig")]
    workload_path: PathBuf,
    #[arg(long, default_value_t = 18088)]
    http_port: u16,
}

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;
    let args = CLI::parse();
    ctrlc::set_handler(move || SHUTDOWN.store(true, Ordering::Relaxed))?;

    let topology = CpuTopology::detect_or_symmetric(Path::new(CPU_SYSFS_DIR), 8);
    let units = enumerate_units(&topology, Mode::PerCore, 0, Some(&[args.core]));
    let unit = units
        .first()
        .ok_or_else(|| anyhow!("no physical core {} in {topology}", args.core))?;

    let spec = WorkloadSpec {
        path: args.workload_path,
        http_host: String::from("127.0.0.1"),
        http_port: args.http_port,
        algo: String::from("rx/0"),
        cpu_priority: 5,
    };
    let endpoint = StatusEndpoint::new(&spec.http_host, spec.http_port, Duration::from_secs(1))?;
    let clock = SystemClock::new(&SHUTDOWN);
    let mut controller = Controller::new(spec);

    info!("{} pinned to {}", unit.id, unit.affinity_mask());
    controller.start(unit)?;
    wait_until_ready(&endpoint, &clock, Duration::from_secs(30));
    let start = clock.elapsed();
    while clock.elapsed() - start < Duration::from_secs(args.seconds) && !clock.cancelled() {
        match read_throughput(&endpoint, &clock, RetryPolicy::new(1, Duration::ZERO)) {
            Some(throughput) => info!("{:.1} H/s ({} hashes)", throughput.hashrate, throughput.hashes_total),
            None => info!("endpoint unavailable"),
        }
        clock.sleep(Duration::from_secs(1));
    }
    controller.stop();
    Ok(())
}
