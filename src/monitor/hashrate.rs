use crate::clock::Clock;
use crate::error::TelemetryError;
use crate::retry::{retry, RetryPolicy};
use log::{debug, trace};
use serde::Deserialize;
use std::time::Duration;

// Upper bound on reading the body once connected.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// One successful poll of the workload's status endpoint.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Throughput {
    /// Current hashrate, H/s. Always positive.
    pub hashrate: f64,
    /// Hashes computed since the workload started.
    pub hashes_total: u64,
}

#[derive(Deserialize)]
struct Summary {
    hashrate: HashrateBlock,
    #[serde(default)]
    results: ResultsBlock,
}

#[derive(Deserialize)]
struct HashrateBlock {
    // [10s, 60s, 15m] averages; null until the window has filled
    #[serde(default)]
    total: Vec<Option<f64>>,
}

#[derive(Deserialize, Default)]
struct ResultsBlock {
    #[serde(default)]
    hashes_total: u64,
}

/// Extract the current throughput from a `/1/summary` document. A missing,
/// null, zero or negative `hashrate.total[0]` is an error.
pub fn parse_summary(body: &str) -> Result<Throughput, TelemetryError> {
    let summary: Summary = serde_json::from_str(body)?;
    match summary.hashrate.total.first().copied().flatten() {
        Some(hashrate) if hashrate > 0.0 => Ok(Throughput {
            hashrate,
            hashes_total: summary.results.hashes_total,
        }),
        _ => Err(TelemetryError::NoThroughput),
    }
}

/// A single-attempt throughput poll.
pub trait ThroughputSource {
    fn poll(&self) -> Result<Throughput, TelemetryError>;
}

/// The workload generator's HTTP API.
pub struct StatusEndpoint {
    url: String,
    client: reqwest::blocking::Client,
}

impl StatusEndpoint {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, TelemetryError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout + READ_TIMEOUT)
            .build()?;
        Ok(Self {
            url: format!("http://{host}:{port}/1/summary"),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ThroughputSource for StatusEndpoint {
    fn poll(&self) -> Result<Throughput, TelemetryError> {
        let response = self.client.get(&self.url).send()?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TelemetryError::Status(status.as_u16()));
        }
        let body = response.text()?;
        trace!("{}: {body}", self.url);
        parse_summary(&body)
    }
}

/// Poll `source` under `policy`; the first positive reading wins. `None`
/// means the endpoint stayed unavailable for the whole retry budget.
pub fn read_throughput(
    source: &dyn ThroughputSource,
    clock: &dyn Clock,
    policy: RetryPolicy,
) -> Option<Throughput> {
    retry(clock, policy, |attempt| match source.poll() {
        Ok(throughput) => Some(throughput),
        Err(e) => {
            debug!("Throughput poll {attempt} failed: {e}");
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::cell::Cell;

    const SUMMARY: &str = r#"{
        "id": "a1b2",
        "worker_id": "bench",
        "hashrate": {"total": [1834.6, 1830.2, null], "highest": 1902.0},
        "results": {"diff_current": 0, "hashes_total": 912344}
    }"#;

    #[test]
    fn test_parse_summary() {
        let throughput = parse_summary(SUMMARY).unwrap();
        assert_eq!(throughput.hashrate, 1834.6);
        assert_eq!(throughput.hashes_total, 912344);
    }

    #[test]
    fn test_parse_summary_not_warmed_up() {
        let body = r#"{"hashrate": {"total": [null, null, null]}, "results": {"hashes_total": 0}}"#;
        assert!(matches!(parse_summary(body), Err(TelemetryError::NoThroughput)));
        let body = r#"{"hashrate": {"total": [0.0]}}"#;
        assert!(matches!(parse_summary(body), Err(TelemetryError::NoThroughput)));
        let body = r#"{"hashrate": {"total": []}}"#;
        assert!(matches!(parse_summary(body), Err(TelemetryError::NoThroughput)));
    }

    #[test]
    fn test_parse_summary_malformed() {
        assert!(matches!(parse_summary("<html>"), Err(TelemetryError::Malformed(_))));
        assert!(matches!(parse_summary("{}"), Err(TelemetryError::Malformed(_))));
    }

    /// Fails `failures` times, then reports a fixed throughput.
    struct FlakySource {
        failures: u32,
        calls: Cell<u32>,
    }

    impl ThroughputSource for FlakySource {
        fn poll(&self) -> Result<Throughput, TelemetryError> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() <= self.failures {
                Err(TelemetryError::Status(503))
            } else {
                Ok(Throughput {
                    hashrate: 640.0,
                    hashes_total: 1,
                })
            }
        }
    }

    #[test]
    fn test_success_on_final_attempt() {
        let clock = ManualClock::new();
        let source = FlakySource {
            failures: 29,
            calls: Cell::new(0),
        };
        let policy = RetryPolicy::new(30, Duration::from_secs(1));
        let throughput = read_throughput(&source, &clock, policy).unwrap();
        assert_eq!(throughput.hashrate, 640.0);
        assert_eq!(source.calls.get(), 30);
    }

    #[test]
    fn test_unavailable_after_budget() {
        let clock = ManualClock::new();
        let source = FlakySource {
            failures: 30,
            calls: Cell::new(0),
        };
        let policy = RetryPolicy::new(30, Duration::from_secs(1));
        assert!(read_throughput(&source, &clock, policy).is_none());
        assert_eq!(source.calls.get(), 30);
        assert_eq!(clock.elapsed(), Duration::from_secs(29));
    }

    #[test]
    fn test_unreachable_endpoint() {
        // Nothing listens on port 9 of localhost in a test sandbox
        let endpoint = StatusEndpoint::new("127.0.0.1", 9, Duration::from_millis(200)).unwrap();
        assert_eq!(endpoint.url(), "http://127.0.0.1:9/1/summary");
        assert!(endpoint.poll().is_err());
    }
}
