use crate::clock::Clock;
use crate::monitor::hashrate::{read_throughput, ThroughputSource};
use crate::monitor::MetricsSource;
use crate::retry::RetryPolicy;
use crate::stats::{quote, RunLog};
use crate::thermal::GateOutcome;
use crate::topology::TestUnit;
use crate::Sample;
use log::{error, info};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Whether unavailable or zero throughput samples count towards a unit's
/// average hashrate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum HashratePolicy {
    #[default]
    ExcludeZero,
    IncludeZero,
}

/// The sampling loop for one unit: while the workload runs, read throughput,
/// frequency and temperature every `interval` until `duration` has passed.
///
/// Termination is purely time based. A silent workload produces a run of
/// "unavailable" samples rather than an early exit; that silence is itself
/// the measurement. Only cancellation of the whole run stops it short.
pub struct Trial<'a> {
    unit: &'a TestUnit,
    duration: Duration,
    interval: Duration,
    retry: RetryPolicy,
}

impl<'a> Trial<'a> {
    pub fn new(unit: &'a TestUnit, duration: Duration, interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            unit,
            duration,
            interval,
            retry,
        }
    }

    pub fn run(
        &self,
        metrics: &dyn MetricsSource,
        throughput: &dyn ThroughputSource,
        clock: &dyn Clock,
        log: &mut dyn RunLog,
    ) -> Vec<Sample> {
        let estimate = self.duration.as_secs() / self.interval.as_secs().max(1) + 1;
        let mut samples = Vec::<Sample>::with_capacity(estimate as usize);
        let start = clock.elapsed();

        while clock.elapsed() - start < self.duration && !clock.cancelled() {
            let reading = read_throughput(throughput, clock, self.retry);
            let sample = Sample {
                timestamp: clock.wall(),
                unit: self.unit.id,
                thermal_domain: self.unit.thermal_domain,
                throughput: reading,
                frequency_mhz: metrics.frequencies_mhz(&self.unit.monitored_cpus),
                temperature_c: metrics.temperature_c(self.unit.thermal_domain),
            };
            self.report_progress(&sample, clock.elapsed() - start);
            if let Err(e) = log.record_sample(&sample) {
                error!("Failed to log sample for {}: {e}", self.unit.id);
            }
            samples.push(sample);
            clock.sleep(self.interval);
        }
        samples
    }

    fn report_progress(&self, sample: &Sample, elapsed: Duration) {
        let peak_mhz = sample.frequency_mhz.iter().max().copied().unwrap_or(0);
        match sample.throughput {
            Some(throughput) => info!(
                "{} [{:>4}s/{}s] measured: {:.1} H/s, {peak_mhz} MHz, {:.1}°C",
                self.unit.id,
                elapsed.as_secs(),
                self.duration.as_secs(),
                throughput.hashrate,
                sample.temperature_c
            ),
            None => info!(
                "{} [{:>4}s/{}s] endpoint unavailable: {peak_mhz} MHz, {:.1}°C",
                self.unit.id,
                elapsed.as_secs(),
                self.duration.as_secs(),
                sample.temperature_c
            ),
        }
    }
}

/// One summary row per unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSummary {
    pub unit: TestUnit,
    /// `None` when the gate was not consulted before this unit.
    pub gate: Option<GateOutcome>,
    pub samples: usize,
    pub measured_samples: usize,
    pub avg_hashrate: f64,
    pub peak_hashrate: f64,
    pub avg_frequency_mhz: f64,
    pub peak_frequency_mhz: u32,
    pub baseline_c: f64,
    pub peak_temperature_c: f64,
    pub interrupted: bool,
}

impl UnitSummary {
    pub fn new(
        unit: &TestUnit,
        gate: Option<GateOutcome>,
        baseline_c: f64,
        samples: &[Sample],
        policy: HashratePolicy,
    ) -> Self {
        let hashrates: Vec<f64> = samples
            .iter()
            .map(Sample::hashrate)
            .filter(|&h| policy == HashratePolicy::IncludeZero || h > 0.0)
            .collect();
        // Unreadable frequencies are sentinels, not measurements
        let frequencies: Vec<u32> = samples
            .iter()
            .flat_map(|s| s.frequency_mhz.iter().copied())
            .filter(|&f| f > 0)
            .collect();

        Self {
            unit: unit.clone(),
            gate,
            samples: samples.len(),
            measured_samples: samples.iter().filter(|s| s.is_measured()).count(),
            avg_hashrate: mean(hashrates.iter().copied()),
            peak_hashrate: hashrates.iter().copied().fold(0.0, f64::max),
            avg_frequency_mhz: mean(frequencies.iter().map(|&f| f64::from(f))),
            peak_frequency_mhz: frequencies.iter().copied().max().unwrap_or(0),
            baseline_c,
            peak_temperature_c: samples.iter().map(|s| s.temperature_c).fold(0.0, f64::max),
            interrupted: false,
        }
    }

    /// Peak temperature over the idle baseline.
    pub fn temperature_delta_c(&self) -> f64 {
        if self.baseline_c > 0.0 && self.peak_temperature_c > 0.0 {
            self.peak_temperature_c - self.baseline_c
        } else {
            0.0
        }
    }

    /// The unit started from a chiplet at (or near) baseline.
    pub fn thermally_stable(&self) -> bool {
        self.gate.map_or(true, |gate| gate.is_stable())
    }

    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if let Some(gate) = self.gate {
            if !matches!(gate, GateOutcome::Stable { .. }) {
                notes.push(gate.to_string());
            }
        }
        if self.samples > 0 && self.measured_samples == 0 {
            notes.push(String::from("no throughput reported"));
        } else if self.measured_samples < self.samples {
            notes.push(format!(
                "{} of {} samples unavailable",
                self.samples - self.measured_samples,
                self.samples
            ));
        }
        if self.baseline_c <= 0.0 {
            notes.push(String::from("no baseline temperature"));
        }
        if self.interrupted {
            notes.push(String::from("interrupted"));
        }
        notes
    }
}

impl Display for UnitSummary {
    /// One CSV row: see `stats::SUMMARY_HEADER`.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{:.2},{:.2},{:.0},{},{:.2},{:.2},{:.2},{},{}",
            self.unit.id,
            self.unit.thermal_domain,
            self.unit.thread_count,
            self.unit.affinity_mask(),
            self.samples,
            self.measured_samples,
            self.avg_hashrate,
            self.peak_hashrate,
            self.avg_frequency_mhz,
            self.peak_frequency_mhz,
            self.baseline_c,
            self.peak_temperature_c,
            self.temperature_delta_c(),
            self.thermally_stable(),
            quote(&self.notes().join("; "))
        )
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}
