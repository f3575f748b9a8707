use std::path::PathBuf;
use thiserror::Error;

/// Conditions that abort the run before anything is measured.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("must run as root (euid {0}): affinity pinning and priority hints require it")]
    NotRoot(u32),
    #[error("workload binary not found at {}", .0.display())]
    MissingWorkload(PathBuf),
    #[error("workload binary {} is not an executable file", .0.display())]
    NotExecutable(PathBuf),
}

/// A single failed throughput poll. Never crosses the sampler boundary: the
/// retry loop absorbs it and the sample records "unavailable".
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status endpoint answered HTTP {0}")]
    Status(u16),
    #[error("malformed status document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no throughput reported yet")]
    NoThroughput,
}
