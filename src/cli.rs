use crate::retry::RetryPolicy;
use crate::thermal::GateSettings;
use crate::topology::{parse_cpu_list, CpuList, CpuTopology, CPU_SYSFS_DIR};
use crate::workload::WorkloadSpec;
use clap::{Parser, ValueEnum};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What gets scheduled: one unit per physical core, or a single unit
/// spanning every logical processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    PerCore,
    AllCore,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Mode::PerCore => write!(f, "per-core"),
            Mode::AllCore => write!(f, "all-core"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub duration_secs: u64,
    pub interval_secs: u64,
    pub mode: Mode,
    pub workload_path: PathBuf,
    pub http_host: String,
    pub http_port: u16,
    pub algo: String,
    pub cpu_priority: u8,
    pub threads_per_core: usize,
    pub ready_timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub settle_secs: u64,
    pub tolerance_c: f64,
    pub gate_poll_secs: u64,
    pub gate_stable_secs: u64,
    pub gate_max_wait_secs: u64,
    pub total_cores: Option<usize>,
    pub cores_per_domain: usize,
    pub sensor_prefix: String,
    pub stats_dir: PathBuf,
    pub include_zero_hashrate: bool,
    pub cores: Option<Vec<usize>>,
}

impl Configuration {
    /// Build the configuration from the process command line.
    pub fn new() -> Self {
        Self::from(CLI::parse())
    }

    /// Build the configuration from an explicit argument list, first item
    /// being the program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        CLI::try_parse_from(args).map(Self::from)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.retry_delay_ms))
    }

    /// The `--total-cores` layout when given, otherwise what sysfs reports.
    pub fn topology(&self) -> CpuTopology {
        match self.total_cores {
            Some(total_cores) => CpuTopology::symmetric(total_cores, self.cores_per_domain),
            None => CpuTopology::detect_or_symmetric(Path::new(CPU_SYSFS_DIR), self.cores_per_domain),
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            tolerance_c: self.tolerance_c,
            poll_interval: Duration::from_secs(self.gate_poll_secs),
            min_stable: Duration::from_secs(self.gate_stable_secs),
            max_wait: Duration::from_secs(self.gate_max_wait_secs),
        }
    }

    pub fn workload_spec(&self) -> WorkloadSpec {
        WorkloadSpec {
            path: self.workload_path.clone(),
            http_host: self.http_host.clone(),
            http_port: self.http_port,
            algo: self.algo.clone(),
            cpu_priority: self.cpu_priority,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::from(CLI::parse_from(["ccdbench"]))
    }
}

impl From<CLI> for Configuration {
    fn from(args: CLI) -> Self {
        Configuration {
            duration_secs: args.duration,
            interval_secs: args.interval,
            mode: args.mode,
            workload_path: args.workload_path,
            http_host: args.http_host,
            http_port: args.http_port,
            algo: args.algo,
            cpu_priority: args.cpu_priority,
            threads_per_core: args.threads_per_core,
            ready_timeout_secs: args.ready_timeout,
            retries: args.retries,
            retry_delay_ms: args.retry_delay_ms,
            connect_timeout_ms: args.connect_timeout_ms,
            settle_secs: args.settle,
            tolerance_c: args.tolerance,
            gate_poll_secs: args.gate_poll,
            gate_stable_secs: args.gate_stable,
            gate_max_wait_secs: args.gate_max_wait,
            total_cores: args.total_cores,
            cores_per_domain: args.cores_per_domain,
            sensor_prefix: args.sensor_prefix,
            stats_dir: args.stats_dir,
            include_zero_hashrate: args.include_zero_hashrate,
            cores: args.cores.map(|list| list.0),
        }
    }
}

/*
  >>> ATTENTION <<<

    When updating this structure, you probably want to update
    the Configuration structure (and its From implementation) too.
*/

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct CLI {
    #[arg(
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..),
        name = "duration seconds",
        help = "Number of seconds to run the workload on each test unit"
    )]
    duration: u64,
    #[arg(
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..),
        name = "interval seconds",
        help = "Number of seconds between telemetry samples"
    )]
    interval: u64,
    #[arg(long, short, value_enum, default_value_t = Mode::PerCore)]
    mode: Mode,
    #[arg(
        long,
        short = 'x',
        default_value = "/usr/local/bin/xmrig",
        help = "Path to the workload generator binary"
    )]
    workload_path: PathBuf,
    #[arg(long, default_value = "127.0.0.1")]
    http_host: String,
    #[arg(long, default_value_t = 18088)]
    http_port: u16,
    #[arg(long, default_value = "rx/0")]
    algo: String,
    #[arg(
        long,
        default_value_t = 5,
        value_parser = clap::value_parser!(u8).range(0..=5),
        help = "Workload process priority hint, 0 (idle) to 5 (highest)"
    )]
    cpu_priority: u8,
    #[arg(
        long,
        default_value_t = 0,
        help = "Worker threads per test unit, 0 uses one per logical processor in the unit"
    )]
    threads_per_core: usize,
    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds to wait for the status endpoint to answer after launch"
    )]
    ready_timeout: u64,
    #[arg(
        long,
        default_value_t = 30,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Attempts per throughput reading before recording it as unavailable"
    )]
    retries: u32,
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,
    #[arg(long, default_value_t = 1000)]
    connect_timeout_ms: u64,
    #[arg(
        long,
        short,
        default_value_t = 30,
        help = "Idle seconds before capturing the per-chiplet baseline temperatures"
    )]
    settle: u64,
    #[arg(
        long,
        short,
        default_value_t = 2.0,
        help = "Degrees above baseline still considered cooled down"
    )]
    tolerance: f64,
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    gate_poll: u64,
    #[arg(
        long,
        default_value_t = 10,
        help = "Seconds the temperature must stay within tolerance before the next unit starts"
    )]
    gate_stable: u64,
    #[arg(long, default_value_t = 180)]
    gate_max_wait: u64,
    #[arg(
        long,
        value_parser = clap::value_parser!(usize),
        help = "Override topology detection: physical core i pairs with logical processor i + total_cores"
    )]
    total_cores: Option<usize>,
    #[arg(
        long,
        default_value_t = 8,
        help = "Physical cores sharing one chiplet when the layout is not detected"
    )]
    cores_per_domain: usize,
    #[arg(
        long,
        default_value = "Tccd",
        help = "hwmon label prefix identifying per-chiplet temperature sensors"
    )]
    sensor_prefix: String,
    #[arg(
        long,
        short = 'd',
        default_value = "./stats",
        help = "Directory to store the sample and summary logs in"
    )]
    stats_dir: PathBuf,
    #[arg(
        long,
        help = "Count zero/unavailable throughput samples in the per-unit average"
    )]
    include_zero_hashrate: bool,
    #[arg(
        long,
        value_parser = parse_cpu_list,
        help = "Only test these physical cores, e.g. 0,2-4"
    )]
    cores: Option<CpuList>,
}
