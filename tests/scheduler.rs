// End-to-end runs of the unit scheduler against virtual time, scripted
// telemetry and a recording stand-in for the workload process.

use anyhow::{bail, Result};
use ccdbench::cli::Configuration;
use ccdbench::clock::{Clock, ManualClock};
use ccdbench::driver::trial::UnitSummary;
use ccdbench::driver::Driver;
use ccdbench::error::TelemetryError;
use ccdbench::monitor::hashrate::{Throughput, ThroughputSource};
use ccdbench::monitor::MetricsSource;
use ccdbench::stats::RunLog;
use ccdbench::topology::{CpuTopology, TestUnit, UnitId};
use ccdbench::workload::Workload;
use ccdbench::Sample;
use std::cell::Cell;
use std::io;
use std::time::Duration;

struct IdleMetrics;

impl MetricsSource for IdleMetrics {
    fn frequency_mhz(&self, _cpu: usize) -> u32 {
        4800
    }

    fn temperature_c(&self, _domain: usize) -> f64 {
        45.0
    }
}

/// Every third poll fails; the others report a hashrate that keeps changing.
struct Erratic {
    calls: Cell<u32>,
}

impl ThroughputSource for Erratic {
    fn poll(&self) -> Result<Throughput, TelemetryError> {
        let n = self.calls.get() + 1;
        self.calls.set(n);
        if n % 3 == 0 {
            Err(TelemetryError::Status(503))
        } else {
            Ok(Throughput {
                hashrate: f64::from(n) * 10.0,
                hashes_total: u64::from(n),
            })
        }
    }
}

#[derive(Default)]
struct FakeWorkload {
    live: bool,
    starts: Vec<UnitId>,
    stops: u32,
    fail_on_start: bool,
}

impl Workload for FakeWorkload {
    fn start(&mut self, unit: &TestUnit) -> Result<u32> {
        assert!(!self.live, "second workload started while one is live");
        if self.fail_on_start {
            bail!("no such file");
        }
        self.live = true;
        self.starts.push(unit.id);
        Ok(1000 + self.starts.len() as u32)
    }

    fn is_alive(&mut self) -> bool {
        self.live
    }

    fn stop(&mut self) {
        self.live = false;
        self.stops += 1;
    }
}

#[derive(Default)]
struct Recorder {
    samples: Vec<Sample>,
    summaries: Vec<UnitSummary>,
}

impl RunLog for Recorder {
    fn record_sample(&mut self, sample: &Sample) -> io::Result<()> {
        self.samples.push(sample.clone());
        Ok(())
    }

    fn record_summary(&mut self, summary: &UnitSummary) -> io::Result<()> {
        self.summaries.push(summary.clone());
        Ok(())
    }
}

fn config(extra: &[&str]) -> Configuration {
    let mut args = vec!["ccdbench", "10", "5", "--settle", "0", "--retries", "1"];
    args.extend_from_slice(extra);
    Configuration::from_args(args).unwrap()
}

#[test]
fn per_core_run_on_one_chiplet() {
    let config = config(&[]);
    let topology = CpuTopology::symmetric(4, 8);
    let clock = ManualClock::new();
    let throughput = Erratic { calls: Cell::new(0) };
    let mut workload = FakeWorkload::default();
    let mut log = Recorder::default();

    let driver = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock);
    let report = driver.run(&mut workload, &mut log).unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.units.len(), 4);
    assert_eq!(workload.starts, (0..4).map(UnitId::Core).collect::<Vec<_>>());
    assert_eq!(workload.stops, 4);
    assert!(!workload.live);

    // gate before every unit but the first
    assert!(report.units[0].summary.gate.is_none());
    assert!(report.units[1..].iter().all(|u| u.summary.gate.is_some()));
    assert!(report.units.iter().all(|u| u.summary.thermally_stable()));

    assert!(report.units.iter().all(|u| u.samples.len() == 2));
    assert_eq!(log.samples.len(), 8);
    assert_eq!(log.summaries.len(), 4);
    assert!(log
        .samples
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(report.baselines.get(0), Some(45.0));
}

#[test]
fn total_cores_override_keeps_small_parts_on_one_chiplet() {
    let config = config(&["--total-cores", "4"]);
    let topology = config.topology();
    assert_eq!(topology.domains(), vec![0]);
    let clock = ManualClock::new();
    let throughput = Erratic { calls: Cell::new(0) };
    let mut workload = FakeWorkload::default();
    let mut log = Recorder::default();

    let report = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock)
        .run(&mut workload, &mut log)
        .unwrap();

    let gated: Vec<bool> = report.units.iter().map(|u| u.summary.gate.is_some()).collect();
    assert_eq!(gated, vec![false, true, true, true]);
    assert_eq!(log.samples.len(), 8);
    assert_eq!(workload.stops, 4);
}

#[test]
fn gate_skipped_when_chiplet_changes() {
    let config = config(&["--total-cores", "4", "--cores-per-domain", "2"]);
    let topology = config.topology();
    let clock = ManualClock::new();
    let throughput = Erratic { calls: Cell::new(0) };
    let mut workload = FakeWorkload::default();
    let mut log = Recorder::default();

    let report = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock)
        .run(&mut workload, &mut log)
        .unwrap();

    let gated: Vec<bool> = report.units.iter().map(|u| u.summary.gate.is_some()).collect();
    assert_eq!(gated, vec![false, true, false, true]);
}

#[test]
fn all_core_is_a_single_unit() {
    let config = config(&["--mode", "all-core"]);
    let topology = CpuTopology::symmetric(8, 4);
    let clock = ManualClock::new();
    let throughput = Erratic { calls: Cell::new(0) };
    let mut workload = FakeWorkload::default();
    let mut log = Recorder::default();

    let report = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock)
        .run(&mut workload, &mut log)
        .unwrap();

    assert_eq!(report.units.len(), 1);
    assert_eq!(workload.starts, vec![UnitId::AllCore]);
    assert_eq!(report.units[0].samples[0].frequency_mhz.len(), 16);
    assert_eq!(workload.stops, 1);
}

#[test]
fn interrupted_run_stops_the_workload() {
    let config = config(&[]);
    let topology = CpuTopology::symmetric(4, 8);
    let clock = ManualClock::new();
    // part way through the second unit
    clock.cancel_at(Duration::from_secs(25));
    let throughput = Erratic { calls: Cell::new(0) };
    let mut workload = FakeWorkload::default();
    let mut log = Recorder::default();

    let report = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock)
        .run(&mut workload, &mut log)
        .unwrap();

    assert!(report.interrupted);
    assert!(!workload.live);
    assert_eq!(workload.starts.len(), workload.stops as usize);
    assert!(report.units.len() < 4);
    assert!(clock.cancelled());
}

#[test]
fn launch_failure_aborts_the_run() {
    let config = config(&[]);
    let topology = CpuTopology::symmetric(2, 8);
    let clock = ManualClock::new();
    let throughput = Erratic { calls: Cell::new(0) };
    let mut workload = FakeWorkload {
        fail_on_start: true,
        ..FakeWorkload::default()
    };
    let mut log = Recorder::default();

    let result = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock)
        .run(&mut workload, &mut log);

    assert!(result.is_err());
    assert!(log.samples.is_empty());
    assert_eq!(workload.stops, 1);
}

#[test]
fn core_subset() {
    let config = config(&["--cores", "1,3"]);
    let topology = CpuTopology::symmetric(4, 8);
    let clock = ManualClock::new();
    let throughput = Erratic { calls: Cell::new(0) };
    let driver = Driver::new(&config, &topology, &IdleMetrics, &throughput, &clock);
    let ids: Vec<UnitId> = driver.units().iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![UnitId::Core(1), UnitId::Core(3)]);
}
