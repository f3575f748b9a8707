use crate::clock::Clock;
use crate::monitor::MetricsSource;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Idle temperature of each thermal domain, captured once before the first
/// unit runs and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThermalBaselines {
    idle_c: BTreeMap<usize, f64>,
}

impl ThermalBaselines {
    pub fn insert(&mut self, domain: usize, idle_temp_c: f64) {
        self.idle_c.insert(domain, idle_temp_c);
    }

    pub fn get(&self, domain: usize) -> Option<f64> {
        self.idle_c.get(&domain).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.idle_c.iter().map(|(&domain, &temp)| (domain, temp))
    }

    /// Wait `settle` for the machine to go idle, then read every domain once.
    pub fn capture(
        metrics: &dyn MetricsSource,
        clock: &dyn Clock,
        domains: &[usize],
        settle: Duration,
    ) -> Self {
        info!("Idling {settle:?} before capturing baseline temperatures");
        clock.sleep(settle);
        let mut baselines = Self::default();
        for &domain in domains {
            let temp = metrics.temperature_c(domain);
            if temp <= 0.0 {
                warn!("No temperature for chiplet {domain}: thermal gating disabled for it");
            }
            info!("Chiplet {domain} idle baseline: {temp:.1}°C");
            baselines.insert(domain, temp);
        }
        baselines
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GateSettings {
    /// Degrees above baseline still counted as cooled down.
    pub tolerance_c: f64,
    pub poll_interval: Duration,
    /// How long the temperature must stay within tolerance.
    pub min_stable: Duration,
    pub max_wait: Duration,
}

impl GateSettings {
    /// Consecutive in-tolerance polls needed to declare the domain stable.
    pub fn required_stable_polls(&self) -> u32 {
        let poll = self.poll_interval.as_millis().max(1);
        let polls = self.min_stable.as_millis().div_ceil(poll);
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GateState {
    Cooling,
    Stabilizing,
    Stable,
    TimedOut,
}

/// Result of one pass through the gate.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum GateOutcome {
    /// Not consulted: first unit, chiplet change, or no usable baseline.
    Skipped,
    Stable { waited: Duration, temp_c: f64 },
    TimedOut { waited: Duration, temp_c: f64, baseline_c: f64 },
    Cancelled { waited: Duration },
}

impl GateOutcome {
    /// False only when the next unit starts on a chiplet still warmer than
    /// its baseline allows.
    pub fn is_stable(&self) -> bool {
        !matches!(self, GateOutcome::TimedOut { .. })
    }
}

impl Display for GateOutcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            GateOutcome::Skipped => write!(f, "gate skipped"),
            GateOutcome::Stable { waited, temp_c } => {
                write!(f, "stable at {temp_c:.1}C after {}s", waited.as_secs())
            }
            GateOutcome::TimedOut {
                waited,
                temp_c,
                baseline_c,
            } => write!(
                f,
                "gate timed out after {}s at {temp_c:.1}C ({:+.1}C over baseline)",
                waited.as_secs(),
                temp_c - baseline_c
            ),
            GateOutcome::Cancelled { waited } => {
                write!(f, "gate cancelled after {}s", waited.as_secs())
            }
        }
    }
}

/// Holds the next unit back until its chiplet has cooled to baseline.
pub struct ThermalGate<'a> {
    settings: GateSettings,
    baselines: &'a ThermalBaselines,
}

impl<'a> ThermalGate<'a> {
    pub fn new(settings: GateSettings, baselines: &'a ThermalBaselines) -> Self {
        Self { settings, baselines }
    }

    /// Block until `domain` has stayed within tolerance of its baseline for
    /// the required number of consecutive polls, or `max_wait` has passed.
    /// Never fails: a timeout is reported in the outcome and the caller
    /// carries on.
    pub fn wait(&self, metrics: &dyn MetricsSource, clock: &dyn Clock, domain: usize) -> GateOutcome {
        let baseline = match self.baselines.get(domain) {
            Some(temp) if temp > 0.0 => temp,
            _ => {
                debug!("Chiplet {domain} has no baseline, not gating");
                return GateOutcome::Skipped;
            }
        };
        let target = baseline + self.settings.tolerance_c;
        let required = self.settings.required_stable_polls();
        info!("Waiting for chiplet {domain} to cool to {target:.1}°C");

        let start = clock.elapsed();
        let mut stable_polls = 0;
        let mut temp = 0.0;
        loop {
            let waited = clock.elapsed() - start;
            if clock.cancelled() {
                return GateOutcome::Cancelled { waited };
            }
            if waited >= self.settings.max_wait {
                debug!("Chiplet {domain} gate: {:?}", GateState::TimedOut);
                warn!(
                    "Chiplet {domain} still at {temp:.1}°C after {}s (baseline {baseline:.1}°C), starting next unit anyway",
                    waited.as_secs()
                );
                return GateOutcome::TimedOut {
                    waited,
                    temp_c: temp,
                    baseline_c: baseline,
                };
            }

            temp = metrics.temperature_c(domain);
            // A failed read proves nothing about cooling
            let state = if temp > 0.0 && temp <= target {
                stable_polls += 1;
                GateState::Stabilizing
            } else {
                stable_polls = 0;
                GateState::Cooling
            };
            debug!("Chiplet {domain}: {temp:.1}°C {state:?} ({stable_polls}/{required})");

            if stable_polls >= required {
                info!(
                    "Chiplet {domain} {:?} at {temp:.1}°C after {}s",
                    GateState::Stable,
                    waited.as_secs()
                );
                return GateOutcome::Stable { waited, temp_c: temp };
            }
            // The last poll is cut short so the timeout lands on max_wait
            let remaining = self.settings.max_wait.saturating_sub(clock.elapsed() - start);
            clock.sleep(self.settings.poll_interval.min(remaining));
        }
    }
}
