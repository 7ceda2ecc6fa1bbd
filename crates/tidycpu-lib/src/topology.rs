//! CPU topology discovery
//!
//! Reads the package / core / sibling layout of every online logical core
//! from sysfs (`/sys/devices/system/cpu/cpuN/topology`). Hosts that do not
//! expose sibling information degrade to one logical core per physical core.

use crate::cpumask::parse_cpu_list;
use crate::error::{Result, TidyError};
use crate::models::{CoreSet, LogicalCore, PhysicalCore, PhysicalCoreId, PhysicalCpu};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Nested package -> physical core -> logical core layout of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub packages: Vec<PhysicalCpu>,
    pub physical_cores: Vec<PhysicalCore>,
    pub logical_cores: Vec<LogicalCore>,
}

impl Topology {
    /// Build a topology from `(logical id, package, core id, siblings)` rows.
    ///
    /// Rows are grouped by `(package, core id)`; the sibling lists only
    /// decide which thread is primary. A row without a core id becomes its
    /// own physical core, numbered above every real core id.
    pub fn from_rows(rows: Vec<CoreRow>) -> Result<Self> {
        if rows.is_empty() {
            return Err(TidyError::TopologyUnavailable(
                "no online logical cores".to_string(),
            ));
        }

        let mut next_free = rows
            .iter()
            .filter_map(|r| r.core)
            .max()
            .map_or(0, |max| max.saturating_add(1));
        let ids: Vec<PhysicalCoreId> = rows
            .iter()
            .map(|row| {
                let core = row.core.unwrap_or_else(|| {
                    let core = next_free;
                    next_free = next_free.saturating_add(1);
                    core
                });
                PhysicalCoreId {
                    package: row.package,
                    core,
                }
            })
            .collect();

        let mut by_core: BTreeMap<PhysicalCoreId, CoreSet> = BTreeMap::new();
        for (row, id) in rows.iter().zip(&ids) {
            by_core.entry(*id).or_default().insert(row.logical_id);
        }

        let mut logical_cores: Vec<LogicalCore> = rows
            .iter()
            .zip(ids)
            .map(|(row, id)| {
                let first_sibling = row
                    .siblings
                    .as_ref()
                    .and_then(|s| s.iter().next().copied())
                    .or_else(|| by_core.get(&id).and_then(|s| s.iter().next().copied()))
                    .unwrap_or(row.logical_id);
                LogicalCore {
                    id: row.logical_id,
                    physical_core: id,
                    package: row.package,
                    is_primary: first_sibling == row.logical_id,
                }
            })
            .collect();
        logical_cores.sort_by_key(|c| c.id);

        let physical_cores: Vec<PhysicalCore> = by_core
            .iter()
            .map(|(id, logical)| PhysicalCore {
                id: *id,
                package: id.package,
                logical_cores: logical.clone(),
            })
            .collect();

        let mut packages: BTreeMap<u32, PhysicalCpu> = BTreeMap::new();
        for core in &physical_cores {
            packages
                .entry(core.package)
                .or_insert_with(|| PhysicalCpu {
                    id: core.package,
                    cores: Default::default(),
                })
                .cores
                .insert(core.id);
        }

        Ok(Self {
            packages: packages.into_values().collect(),
            physical_cores,
            logical_cores,
        })
    }

    pub fn logical_ids(&self) -> CoreSet {
        self.logical_cores.iter().map(|c| c.id).collect()
    }

    pub fn logical_count(&self) -> usize {
        self.logical_cores.len()
    }

    pub fn physical_core_count(&self) -> usize {
        self.physical_cores.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Whether any physical core carries more than one logical core
    pub fn has_smt(&self) -> bool {
        self.physical_cores.iter().any(|c| c.logical_cores.len() > 1)
    }

    pub fn contains(&self, logical_id: u32) -> bool {
        self.logical_cores.iter().any(|c| c.id == logical_id)
    }

    pub fn logical_core(&self, logical_id: u32) -> Option<&LogicalCore> {
        self.logical_cores.iter().find(|c| c.id == logical_id)
    }

    /// Logical cores sharing a physical core with `logical_id`, itself included
    pub fn siblings_of(&self, logical_id: u32) -> Option<&CoreSet> {
        let core = self.logical_core(logical_id)?;
        self.physical_cores
            .iter()
            .find(|p| p.id == core.physical_core)
            .map(|p| &p.logical_cores)
    }
}

/// One logical core as read from sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreRow {
    pub logical_id: u32,
    pub package: u32,
    /// Absent when sysfs exposes no `core_id`
    pub core: Option<u32>,
    pub siblings: Option<CoreSet>,
}

/// Reads topology from a sysfs root (normally `/sys`)
pub struct SysfsTopology {
    sys_root: PathBuf,
}

impl SysfsTopology {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }

    fn cpu_dir(&self) -> PathBuf {
        self.sys_root.join("devices/system/cpu")
    }

    /// Discover the host topology
    pub async fn discover(&self) -> Result<Topology> {
        let cpu_dir = self.cpu_dir();
        let online = self.online_cpus(&cpu_dir).await?;

        let mut rows = Vec::with_capacity(online.len());
        for logical_id in online {
            rows.push(Self::read_row(&cpu_dir, logical_id).await);
        }

        let topology = Topology::from_rows(rows)?;
        debug!(
            logical = topology.logical_count(),
            physical = topology.physical_core_count(),
            packages = topology.package_count(),
            smt = topology.has_smt(),
            "Discovered CPU topology"
        );
        Ok(topology)
    }

    /// Online cores from `online`, or every `cpuN` directory if that file is absent
    async fn online_cpus(&self, cpu_dir: &Path) -> Result<CoreSet> {
        match fs::read_to_string(cpu_dir.join("online")).await {
            Ok(content) => {
                let cores = parse_cpu_list(&content)?;
                if !cores.is_empty() {
                    return Ok(cores);
                }
            }
            Err(e) => {
                debug!(error = %e, "No online cpu list, scanning cpu directories");
            }
        }

        let mut entries = fs::read_dir(cpu_dir).await.map_err(|e| {
            TidyError::TopologyUnavailable(format!("{}: {}", cpu_dir.display(), e))
        })?;

        let mut cores = CoreSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("cpu").and_then(|n| n.parse::<u32>().ok()) {
                cores.insert(id);
            }
        }

        if cores.is_empty() {
            return Err(TidyError::TopologyUnavailable(format!(
                "no cpu entries under {}",
                cpu_dir.display()
            )));
        }
        Ok(cores)
    }

    async fn read_row(cpu_dir: &Path, logical_id: u32) -> CoreRow {
        let topo_dir = cpu_dir.join(format!("cpu{}/topology", logical_id));

        let package = read_id(&topo_dir.join("physical_package_id")).await;
        let core = read_id(&topo_dir.join("core_id")).await;
        let siblings = match fs::read_to_string(topo_dir.join("thread_siblings_list")).await {
            Ok(content) => parse_cpu_list(&content).ok().filter(|s| !s.is_empty()),
            Err(_) => None,
        };

        if core.is_none() {
            warn!(cpu = logical_id, "Missing core_id, treating as its own physical core");
        }

        CoreRow {
            logical_id,
            package: package.unwrap_or(0),
            core,
            // Without a core id the sibling list cannot be trusted either
            siblings: core.and(siblings),
        }
    }
}

/// Read a sysfs id file; `-1` (unknown package) reads as absent
async fn read_id(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).await.ok()?;
    content.trim().parse::<i64>().ok().and_then(|v| u32::try_from(v).ok())
}
