pub mod trial;

use crate::cli::Configuration;
use crate::clock::Clock;
use crate::driver::trial::{HashratePolicy, Trial, UnitSummary};
use crate::monitor::hashrate::ThroughputSource;
use crate::monitor::MetricsSource;
use crate::stats::RunLog;
use crate::thermal::{GateOutcome, ThermalBaselines, ThermalGate};
use crate::topology::{enumerate_units, CpuTopology, TestUnit};
use crate::workload::{wait_until_ready, Workload};
use crate::Sample;
use anyhow::{Context, Result};
use log::{error, info, trace, warn};
use std::collections::BTreeSet;

/// Everything measured for one unit.
#[derive(Debug)]
pub struct UnitReport {
    pub summary: UnitSummary,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub baselines: ThermalBaselines,
    pub units: Vec<UnitReport>,
    /// The run was cancelled before every unit completed.
    pub interrupted: bool,
}

/// The unit scheduler. For every unit in turn: let the chiplet cool if the
/// previous unit heated the same one, start the workload pinned to the unit,
/// sample it for the configured duration, stop it.
///
/// Units run strictly one after another and every wait goes through the
/// clock, so a cancelled run always falls through to stopping the workload.
pub struct Driver<'a> {
    config: &'a Configuration,
    units: Vec<TestUnit>,
    metrics: &'a dyn MetricsSource,
    throughput: &'a dyn ThroughputSource,
    clock: &'a dyn Clock,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: &'a Configuration,
        topology: &CpuTopology,
        metrics: &'a dyn MetricsSource,
        throughput: &'a dyn ThroughputSource,
        clock: &'a dyn Clock,
    ) -> Self {
        let units = enumerate_units(
            topology,
            config.mode,
            config.threads_per_core,
            config.cores.as_deref(),
        );
        trace!("Test units: {units:#?}");
        Self {
            config,
            units,
            metrics,
            throughput,
            clock,
        }
    }

    pub fn units(&self) -> &[TestUnit] {
        &self.units
    }

    fn hashrate_policy(&self) -> HashratePolicy {
        if self.config.include_zero_hashrate {
            HashratePolicy::IncludeZero
        } else {
            HashratePolicy::ExcludeZero
        }
    }

    /// Capture baselines, then run every unit. Only a workload launch failure
    /// is an error; everything else ends up in the report.
    pub fn run(&self, workload: &mut dyn Workload, log: &mut dyn RunLog) -> Result<RunReport> {
        info!(
            "{} mode: {} unit(s), {}s each, sampling every {}s",
            self.config.mode,
            self.units.len(),
            self.config.duration_secs,
            self.config.interval_secs
        );
        let domains: Vec<usize> = self
            .units
            .iter()
            .map(|unit| unit.thermal_domain)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let baselines =
            ThermalBaselines::capture(self.metrics, self.clock, &domains, self.config.settle());
        let gate = ThermalGate::new(self.config.gate_settings(), &baselines);

        let mut reports = Vec::<UnitReport>::with_capacity(self.units.len());
        let mut previous_domain: Option<usize> = None;
        let mut interrupted = false;

        for (n, unit) in self.units.iter().enumerate() {
            if self.clock.cancelled() {
                interrupted = true;
                break;
            }
            info!(
                "Unit {}/{}: {} on chiplet {}",
                n + 1,
                self.units.len(),
                unit.id,
                unit.thermal_domain
            );

            // Cooling only matters when this unit heats the chiplet the
            // previous one just left
            let gate_outcome = match previous_domain {
                Some(domain) if domain == unit.thermal_domain => {
                    Some(gate.wait(self.metrics, self.clock, unit.thermal_domain))
                }
                _ => None,
            };
            if let Some(GateOutcome::Cancelled { .. }) = gate_outcome {
                interrupted = true;
                break;
            }

            let report = self
                .run_unit(unit, gate_outcome, &baselines, workload, log)
                .with_context(|| format!("unit {} failed", unit.id))?;
            interrupted = report.summary.interrupted;
            reports.push(report);
            previous_domain = Some(unit.thermal_domain);
            if interrupted {
                break;
            }
        }

        if interrupted {
            warn!("Run interrupted after {} of {} unit(s)", reports.len(), self.units.len());
        }
        Ok(RunReport {
            baselines,
            units: reports,
            interrupted,
        })
    }

    fn run_unit(
        &self,
        unit: &TestUnit,
        gate: Option<GateOutcome>,
        baselines: &ThermalBaselines,
        workload: &mut dyn Workload,
        log: &mut dyn RunLog,
    ) -> Result<UnitReport> {
        if let Err(e) = workload.start(unit) {
            workload.stop();
            return Err(e);
        }
        wait_until_ready(self.throughput, self.clock, self.config.ready_timeout());

        let trial = Trial::new(
            unit,
            self.config.duration(),
            self.config.interval(),
            self.config.retry_policy(),
        );
        let samples = trial.run(self.metrics, self.throughput, self.clock, log);

        // Whatever the workload did, it goes
        workload.stop();

        let baseline = baselines.get(unit.thermal_domain).unwrap_or(0.0);
        let mut summary =
            UnitSummary::new(unit, gate, baseline, &samples, self.hashrate_policy());
        summary.interrupted = self.clock.cancelled();
        info!(
            "{}: {:.1} H/s avg, {:.0} MHz avg, peak {:.1}°C ({:+.1}°C)",
            unit.id,
            summary.avg_hashrate,
            summary.avg_frequency_mhz,
            summary.peak_temperature_c,
            summary.temperature_delta_c()
        );
        if let Err(e) = log.record_summary(&summary) {
            error!("Failed to log summary for {}: {e}", unit.id);
        }
        Ok(UnitReport { summary, samples })
    }
}
