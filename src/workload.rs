use crate::clock::Clock;
use crate::monitor::hashrate::ThroughputSource;
use crate::topology::{AffinityMask, TestUnit};
use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

// Time a workload gets to exit on SIGTERM before it is killed outright.
const STOP_GRACE: Duration = Duration::from_secs(3);
const STOP_POLL: Duration = Duration::from_millis(50);
// Longest wait for swept orphans to disappear from /proc.
const SWEEP_WAIT: Duration = Duration::from_secs(2);
const READY_POLL: Duration = Duration::from_secs(1);
// The kernel truncates comm to 15 bytes plus NUL.
const COMM_LEN: usize = 15;

/// How to launch the workload generator. Everything except the unit-specific
/// thread count and affinity.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub path: PathBuf,
    pub http_host: String,
    pub http_port: u16,
    pub algo: String,
    pub cpu_priority: u8,
}

impl WorkloadSpec {
    pub fn args(&self, unit: &TestUnit) -> Vec<String> {
        let mut args = vec![
            String::from("--http-enabled"),
            format!("--http-host={}", self.http_host),
            format!("--http-port={}", self.http_port),
            format!("--algo={}", self.algo),
            String::from("--stress"),
            String::from("--randomx-1gb-pages"),
            format!("--cpu-priority={}", self.cpu_priority),
            format!("--threads={}", unit.thread_count),
        ];
        if !unit.affinity.is_empty() {
            args.push(format!("--cpu-affinity={}", unit.affinity_mask()));
        }
        args
    }

    /// The command name the kernel reports for the workload, used to sweep
    /// for orphans.
    pub fn process_name(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.chars()
            .scan(0, |len, c| {
                *len += c.len_utf8();
                (*len <= COMM_LEN).then_some(c)
            })
            .collect()
    }

    pub fn status_endpoint(&self) -> String {
        format!("http://{}:{}/1/summary", self.http_host, self.http_port)
    }
}

impl Display for WorkloadSpec {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} --http-port {} --algo {} --cpu-priority {}",
            self.path.display(),
            self.http_port,
            self.algo,
            self.cpu_priority
        )
    }
}

/// The running workload generator. Owned exclusively by its `Controller`.
#[derive(Debug)]
pub struct WorkloadProcess {
    pub pid: u32,
    pub affinity_mask: AffinityMask,
    pub status_endpoint: String,
    child: Child,
}

/// Lifecycle of the workload under test. At most one instance is alive at a
/// time: `start` stops any previous instance first, and `stop` is safe to
/// call whether or not anything is running.
pub trait Workload {
    /// Launch the workload pinned to `unit`, returning its pid.
    fn start(&mut self, unit: &TestUnit) -> Result<u32>;

    fn is_alive(&mut self) -> bool;

    fn stop(&mut self);
}

/// Launches the workload generator as a detached child process.
pub struct Controller {
    spec: WorkloadSpec,
    current: Option<WorkloadProcess>,
}

impl Controller {
    pub fn new(spec: WorkloadSpec) -> Self {
        Self {
            spec,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&WorkloadProcess> {
        self.current.as_ref()
    }
}

impl Workload for Controller {
    fn start(&mut self, unit: &TestUnit) -> Result<u32> {
        // The status port is fixed: the previous instance must be gone
        self.stop();

        let args = self.spec.args(unit);
        debug!("Launching {} {}", self.spec.path.display(), args.join(" "));
        let child = Command::new(&self.spec.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group: detached from the terminal's SIGINT, and
            // the whole group can be signalled at once on stop
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to launch {}", self.spec.path.display()))?;

        let pid = child.id();
        info!("{}: workload pid {pid} ({} threads)", unit.id, unit.thread_count);
        self.current = Some(WorkloadProcess {
            pid,
            affinity_mask: unit.affinity_mask(),
            status_endpoint: self.spec.status_endpoint(),
            child,
        });
        Ok(pid)
    }

    fn is_alive(&mut self) -> bool {
        match self.current.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.current.take() {
            terminate(&mut process.child, STOP_GRACE);
            debug!("Workload pid {} stopped", process.pid);
        }
        let swept = terminate_all_matching(&self.spec.process_name());
        if swept > 0 {
            warn!("Killed {swept} orphaned {} process(es)", self.spec.process_name());
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// SIGTERM the child's process group, SIGKILL it after `grace`, and reap it.
pub fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                trace!("pid {pgid} exited: {status}");
                break;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(STOP_POLL),
            _ => {
                warn!("pid {pgid} ignored SIGTERM, killing");
                unsafe {
                    libc::killpg(pgid, libc::SIGKILL);
                }
                let _ = child.kill();
                let _ = child.wait();
                break;
            }
        }
    }
    // Once the leader is reaped its pgid may be reused, so group members
    // that outlive it are left to the name sweep
}

/// SIGKILL every process whose command name is `name`, then wait (bounded)
/// for them to go. Returns how many were signalled.
pub fn terminate_all_matching(name: &str) -> usize {
    if name.is_empty() {
        return 0;
    }
    let own = std::process::id();
    let pids: Vec<u32> = processes_named(name)
        .into_iter()
        .filter(|&pid| pid != own)
        .collect();
    for &pid in &pids {
        debug!("Killing stray {name} pid {pid}");
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let deadline = Instant::now() + SWEEP_WAIT;
    while pids.iter().any(|&pid| is_running(pid)) && Instant::now() < deadline {
        thread::sleep(STOP_POLL);
    }
    pids.len()
}

/// Live pids whose `/proc/<pid>/comm` is `name`.
pub fn processes_named(name: &str) -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_string_lossy().parse::<u32>().ok())
        .filter(|&pid| {
            fs::read_to_string(format!("/proc/{pid}/comm"))
                .is_ok_and(|comm| comm.trim_end() == name)
        })
        .filter(|&pid| is_running(pid))
        .collect()
}

/// A pid counts as running until it is reaped or becomes a zombie.
fn is_running(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        // state follows the parenthesised comm, which may itself hold spaces
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Poll the status endpoint until it answers or `timeout` passes. A timeout
/// only warns: the sampler's own retries cover a slow start.
pub fn wait_until_ready(source: &dyn ThroughputSource, clock: &dyn Clock, timeout: Duration) -> bool {
    let start = clock.elapsed();
    loop {
        match source.poll() {
            Ok(throughput) => {
                debug!(
                    "Workload ready after {:?}: {:.1} H/s",
                    clock.elapsed() - start,
                    throughput.hashrate
                );
                return true;
            }
            Err(e) => trace!("Workload not ready: {e}"),
        }
        if clock.cancelled() || clock.elapsed() - start >= timeout {
            warn!("Workload status endpoint not ready after {timeout:?}, sampling anyway");
            return false;
        }
        clock.sleep(READY_POLL);
    }
}
