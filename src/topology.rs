use crate::cli::Mode;
use glob::glob;
use log::{error, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;

pub const CPU_SYSFS_DIR: &str = "/sys/devices/system/cpu";

/// A parsed kernel-style cpu list such as `0-3,8,10-11`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuList(pub Vec<usize>);

/// Parse `0-3,8` style lists. Duplicates are removed and the result sorted.
pub fn parse_cpu_list(text: &str) -> Result<CpuList, String> {
    let mut cpus = BTreeSet::new();
    for range in text.trim().split(',').filter(|r| !r.trim().is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| format!("bad cpu number '{s}': {e}"))
        };
        match range.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("descending cpu range '{range}'"));
                }
                cpus.extend(lo..=hi);
            }
            None => {
                cpus.insert(parse(range)?);
            }
        }
    }
    if cpus.is_empty() {
        return Err(String::from("empty cpu list"));
    }
    Ok(CpuList(cpus.into_iter().collect()))
}

/// Bit-set of logical processors, printed as the hex mask the workload
/// generator expects (`0x101` for cpus 0 and 8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityMask {
    // Little-endian 64-bit words, no trailing zero words.
    words: Vec<u64>,
}

impl AffinityMask {
    pub fn from_cpus(cpus: &[usize]) -> Self {
        let mut words = Vec::<u64>::new();
        for &cpu in cpus {
            let (word, bit) = (cpu / 64, cpu % 64);
            if words.len() <= word {
                words.resize(word + 1, 0);
            }
            words[word] |= 1u64 << bit;
        }
        Self { words }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.words
            .get(cpu / 64)
            .is_some_and(|word| word & (1u64 << (cpu % 64)) != 0)
    }
}

impl Display for AffinityMask {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut words = self.words.iter().rev();
        match words.next() {
            None => write!(f, "0x0"),
            Some(top) => {
                write!(f, "{top:#x}")?;
                for word in words {
                    write!(f, "{word:016x}")?;
                }
                Ok(())
            }
        }
    }
}

/// One physical core: its SMT siblings and the chiplet it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalCore {
    pub index: usize,
    pub threads: Vec<usize>,
    pub domain: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    pub cores: Vec<PhysicalCore>,
}

impl CpuTopology {
    /// The layout the kernel gives a symmetric multi-chiplet part: physical
    /// core `i` is logical processors `i` and `i + total_cores`, and chiplets
    /// are filled in order, `cores_per_domain` cores each.
    pub fn symmetric(total_cores: usize, cores_per_domain: usize) -> Self {
        let per_domain = cores_per_domain.max(1);
        let cores = (0..total_cores)
            .map(|index| PhysicalCore {
                index,
                threads: vec![index, index + total_cores],
                domain: index / per_domain,
            })
            .collect();
        Self { cores }
    }

    /// Read the topology from a sysfs cpu directory. Chiplets are identified
    /// by their shared L3 cache; packages without L3 information fall back to
    /// one domain per package. Returns `None` if nothing usable was found.
    pub fn detect(cpu_root: &Path) -> Option<Self> {
        let pattern = format!("{}/cpu[0-9]*", cpu_root.display());
        let paths = match glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                error!("Bad topology glob {pattern}: {e}");
                return None;
            }
        };

        // (package, core_id) -> (l3 id, logical cpus)
        let mut cores = BTreeMap::<(u64, u64), (u64, Vec<usize>)>::new();
        for path in paths.flatten() {
            let Some(cpu) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("cpu"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            // Offline cpus have no topology directory
            let Some(core_id) = read_u64(&path.join("topology/core_id")) else {
                continue;
            };
            let package = read_u64(&path.join("topology/physical_package_id")).unwrap_or(0);
            let l3 = read_u64(&path.join("cache/index3/id")).unwrap_or(package);
            let entry = cores.entry((package, core_id)).or_insert((l3, Vec::new()));
            entry.1.push(cpu);
        }
        if cores.is_empty() {
            return None;
        }

        let l3_ids: BTreeSet<(u64, u64)> = cores
            .iter()
            .map(|(&(package, _), &(l3, _))| (package, l3))
            .collect();
        let domain_of = |package: u64, l3: u64| {
            l3_ids
                .iter()
                .position(|&id| id == (package, l3))
                .unwrap_or(0)
        };

        let mut physical: Vec<(usize, Vec<usize>)> = cores
            .into_iter()
            .map(|((package, _), (l3, mut threads))| {
                threads.sort_unstable();
                (domain_of(package, l3), threads)
            })
            .collect();
        physical.sort_by_key(|(_, threads)| threads[0]);

        let cores = physical
            .into_iter()
            .enumerate()
            .map(|(index, (domain, threads))| PhysicalCore {
                index,
                threads,
                domain,
            })
            .collect();
        let topology = Self { cores };
        trace!("Detected topology: {topology:#?}");
        Some(topology)
    }

    /// Detect from sysfs, falling back to a symmetric layout sized from the
    /// online processor count.
    pub fn detect_or_symmetric(cpu_root: &Path, cores_per_domain: usize) -> Self {
        Self::detect(cpu_root).unwrap_or_else(|| {
            let logical = crate::core_count().max(2);
            warn!(
                "Could not read cpu topology from {}, assuming {} cores x 2 threads, {cores_per_domain} per chiplet",
                cpu_root.display(),
                logical / 2
            );
            Self::symmetric(logical / 2, cores_per_domain)
        })
    }

    pub fn logical_cpus(&self) -> Vec<usize> {
        let cpus: BTreeSet<usize> = self
            .cores
            .iter()
            .flat_map(|core| core.threads.iter().copied())
            .collect();
        cpus.into_iter().collect()
    }

    pub fn domains(&self) -> Vec<usize> {
        let domains: BTreeSet<usize> = self.cores.iter().map(|core| core.domain).collect();
        domains.into_iter().collect()
    }
}

impl Display for CpuTopology {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} cores, {} threads, {} chiplets",
            self.cores.len(),
            self.logical_cpus().len(),
            self.domains().len()
        )
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitId {
    Core(usize),
    AllCore,
}

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            UnitId::Core(index) => write!(f, "core{index}"),
            UnitId::AllCore => write!(f, "all-core"),
        }
    }
}

/// One schedulable benchmark target. An empty `affinity` means the workload
/// is free to run anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    pub id: UnitId,
    pub affinity: Vec<usize>,
    /// Processors whose frequency is sampled while this unit runs.
    pub monitored_cpus: Vec<usize>,
    pub thermal_domain: usize,
    pub thread_count: usize,
}

impl TestUnit {
    pub fn affinity_mask(&self) -> AffinityMask {
        AffinityMask::from_cpus(&self.affinity)
    }
}

/// Build the ordered unit sequence for `mode`.
///
/// `threads_per_core == 0` requests one worker per logical processor of the
/// unit. `subset` restricts per-core mode to the listed physical cores.
pub fn enumerate_units(
    topology: &CpuTopology,
    mode: Mode,
    threads_per_core: usize,
    subset: Option<&[usize]>,
) -> Vec<TestUnit> {
    match mode {
        Mode::PerCore => topology
            .cores
            .iter()
            .filter(|core| subset.map_or(true, |s| s.contains(&core.index)))
            .map(|core| TestUnit {
                id: UnitId::Core(core.index),
                affinity: core.threads.clone(),
                monitored_cpus: core.threads.clone(),
                thermal_domain: core.domain,
                thread_count: if threads_per_core == 0 {
                    core.threads.len()
                } else {
                    threads_per_core
                },
            })
            .collect(),
        Mode::AllCore => {
            let cpus = topology.logical_cpus();
            let thread_count = if threads_per_core == 0 {
                cpus.len()
            } else {
                threads_per_core * topology.cores.len()
            };
            vec![TestUnit {
                id: UnitId::AllCore,
                affinity: Vec::new(),
                monitored_cpus: cpus,
                thermal_domain: topology.domains().first().copied().unwrap_or(0),
                thread_count,
            }]
        }
    }
}
