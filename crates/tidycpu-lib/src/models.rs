//! Core data models for the rebalancer
//!
//! Every value here is a point-in-time snapshot. Stages hand them to each
//! other by value and never mutate what they received.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Ordered set of logical core ids
pub type CoreSet = BTreeSet<u32>;

/// Identity of a physical core: core ids are only unique within a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalCoreId {
    pub package: u32,
    pub core: u32,
}

impl fmt::Display for PhysicalCoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package, self.core)
    }
}

/// A schedulable CPU unit as seen by the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalCore {
    pub id: u32,
    pub physical_core: PhysicalCoreId,
    pub package: u32,
    /// Lowest-numbered thread among its siblings
    pub is_primary: bool,
}

/// A physical core and the logical cores (hyperthreads) sharing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalCore {
    pub id: PhysicalCoreId,
    pub package: u32,
    pub logical_cores: CoreSet,
}

/// A physical CPU package (socket)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalCpu {
    pub id: u32,
    pub cores: BTreeSet<PhysicalCoreId>,
}

/// Raw cumulative tick counters for one logical core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSample {
    pub core_id: u32,
    pub busy: u64,
    pub idle: u64,
    pub total: u64,
}

/// Utilization band of a logical core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoreLabel {
    Hot,
    Warm,
    Cold,
}

impl CoreLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreLabel::Hot => "HOT",
            CoreLabel::Warm => "WARM",
            CoreLabel::Cold => "COLD",
        }
    }
}

impl fmt::Display for CoreLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification thresholds in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Usage at or above this is HOT
    pub hot: f64,
    /// Usage at or above this (and below `hot`) is WARM
    pub warm: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            hot: 80.0,
            warm: 40.0,
        }
    }
}

impl Thresholds {
    pub fn classify(&self, usage: f64) -> CoreLabel {
        if usage >= self.hot {
            CoreLabel::Hot
        } else if usage >= self.warm {
            CoreLabel::Warm
        } else {
            CoreLabel::Cold
        }
    }
}

/// Utilization of one logical core over a sampling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStat {
    pub core_id: u32,
    /// Percentage in [0, 100], unrounded
    pub usage: f64,
    pub label: CoreLabel,
}

/// Why a core produced no stat for a sampling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    MissingFromFirst,
    MissingFromSecond,
    NoElapsedTicks,
}

/// A core dropped from a usage sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleGap {
    pub core_id: u32,
    pub reason: GapReason,
}

/// A thread of an inventoried process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub tid: i32,
    pub pid: i32,
    pub name: String,
    pub cpu_percent: f64,
    pub cores: CoreSet,
}

/// A CPU-consuming process and where it may run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    /// As reported by the process table, not recomputed from counters
    pub cpu_percent: f64,
    /// Kernel hex mask as read, e.g. `ff` or `ffffffff,ffffffff`
    pub affinity_mask: String,
    pub cores: CoreSet,
    pub threads: Option<Vec<ThreadInfo>>,
}

/// Soft, per-entry inventory failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub pid: i32,
    pub tid: Option<i32>,
    pub reason: String,
}

/// A proposed affinity change for one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAction {
    pub pid: i32,
    pub name: String,
    pub cpu_percent: f64,
    pub from_cores: CoreSet,
    pub to_cores: CoreSet,
    pub manual_only: bool,
    pub failure_reason: Option<String>,
}

/// Result of attempting one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Kernel reports the destination mask
    Applied { confirmed: CoreSet },
    /// Could not be applied automatically
    ManualOnly { reason: String },
}

/// Per-action execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub pid: i32,
    pub name: String,
    pub to_cores: CoreSet,
    pub status: OutcomeStatus,
}

impl ExecutionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self.status, OutcomeStatus::Applied { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Applied { .. } => None,
            OutcomeStatus::ManualOnly { reason } => Some(reason),
        }
    }

    /// Copy of the planned action carrying this outcome
    pub fn annotate(&self, action: &RebalanceAction) -> RebalanceAction {
        let mut annotated = action.clone();
        if let OutcomeStatus::ManualOnly { reason } = &self.status {
            annotated.manual_only = true;
            annotated.failure_reason = Some(reason.clone());
        }
        annotated
    }
}
