use anyhow::{Context, Result};
use ccdbench::cli::Configuration;
use ccdbench::clock::SystemClock;
use ccdbench::driver::{Driver, RunReport};
use ccdbench::monitor::hashrate::StatusEndpoint;
use ccdbench::monitor::hwmon::HWMON_DIR;
use ccdbench::monitor::SysfsMetrics;
use ccdbench::stats::CsvLog;
use ccdbench::topology::CPU_SYSFS_DIR;
use ccdbench::workload::{Controller, Workload};
use ccdbench::{check_preconditions, RUN_TIMESTAMP};
use log::{error, info, LevelFilter};
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// Conventional exit status for a run ended by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
    {
        eprintln!("Failed to initialise logging: {e}");
    }
    let config = Configuration::new();

    match run(&config) {
        Ok(report) if report.interrupted => ExitCode::from(EXIT_INTERRUPTED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Configuration) -> Result<RunReport> {
    check_preconditions(config)?;

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    fs::create_dir_all(&config.stats_dir)
        .with_context(|| format!("failed to create {}", config.stats_dir.display()))?;

    let topology = config.topology();
    info!("Topology: {topology}");

    let metrics = SysfsMetrics::new(
        Path::new(CPU_SYSFS_DIR),
        Path::new(HWMON_DIR),
        &config.sensor_prefix,
    );
    info!("{} chiplet temperature sensor(s)", metrics.sensor_count());
    let endpoint = StatusEndpoint::new(&config.http_host, config.http_port, config.connect_timeout())
        .context("failed to build status client")?;
    let clock = SystemClock::new(&SHUTDOWN);

    let mut controller = Controller::new(config.workload_spec());
    // A workload left over from an earlier run would hold the status port
    controller.stop();

    let mut log = CsvLog::new(&config.stats_dir, &RUN_TIMESTAMP);
    info!("Writing samples to {}", log.samples_path().display());
    info!("Writing summaries to {}", log.summary_path().display());

    let driver = Driver::new(config, &topology, &metrics, &endpoint, &clock);
    let report = driver.run(&mut controller, &mut log);
    controller.stop();

    let report = report?;
    for unit in &report.units {
        info!("{}", unit.summary);
    }
    Ok(report)
}
