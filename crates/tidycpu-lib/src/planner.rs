//! Conflict detection and rebalance planning
//!
//! A process is in conflict when any core it may run on is HOT while at
//! least one COLD core exists. Conflicts are resolved greedily, heaviest
//! process first, by moving each onto the least loaded COLD cores not yet
//! claimed in the same plan. WARM cores are never targets. A process
//! already allowed on every sampled core is spread as wide as it can be
//! and is left alone.

use crate::models::{CoreLabel, CoreSet, CoreStat, ProcessInfo, RebalanceAction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a conflicting process received no action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnplannedReason {
    /// Fewer unclaimed COLD cores remain than the process's affinity width
    ColdCoresExhausted,
}

/// A conflict left without an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnplannedConflict {
    pub pid: i32,
    pub name: String,
    pub cpu_percent: f64,
    pub cores: CoreSet,
    pub reason: UnplannedReason,
}

/// Overall state of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// No conflicts
    Balanced,
    /// At least one action
    Actionable,
    /// Conflicts exist but none could be assigned
    Saturated,
}

/// Ordered migration plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalancePlan {
    /// Heaviest process first; this is also the execution order
    pub actions: Vec<RebalanceAction>,
    pub unplanned: Vec<UnplannedConflict>,
    pub hot_cores: CoreSet,
    /// Least loaded first
    pub cold_cores: Vec<u32>,
}

impl RebalancePlan {
    pub fn status(&self) -> PlanStatus {
        if !self.actions.is_empty() {
            PlanStatus::Actionable
        } else if self.unplanned.is_empty() {
            PlanStatus::Balanced
        } else {
            PlanStatus::Saturated
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.status() == PlanStatus::Balanced
    }
}

/// Build a rebalance plan from core stats and the process inventory.
///
/// Deterministic: COLD cores are ordered by utilization then id, processes
/// by CPU share (descending) then pid.
pub fn build_plan(core_stats: &[CoreStat], processes: &[ProcessInfo]) -> RebalancePlan {
    let hot_cores: CoreSet = core_stats
        .iter()
        .filter(|s| s.label == CoreLabel::Hot)
        .map(|s| s.core_id)
        .collect();

    let mut cold: Vec<&CoreStat> = core_stats
        .iter()
        .filter(|s| s.label == CoreLabel::Cold)
        .collect();
    cold.sort_by(|a, b| a.usage.total_cmp(&b.usage).then(a.core_id.cmp(&b.core_id)));
    let cold_cores: Vec<u32> = cold.iter().map(|s| s.core_id).collect();

    let mut plan = RebalancePlan {
        actions: Vec::new(),
        unplanned: Vec::new(),
        hot_cores,
        cold_cores,
    };
    if plan.hot_cores.is_empty() || plan.cold_cores.is_empty() {
        return plan;
    }

    let mut ordered: Vec<&ProcessInfo> = processes.iter().collect();
    ordered.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then(a.pid.cmp(&b.pid))
    });

    let sampled: CoreSet = core_stats.iter().map(|s| s.core_id).collect();
    let mut claimed: BTreeSet<u32> = BTreeSet::new();
    for process in ordered {
        if !is_conflict(process, &plan.hot_cores, &sampled) {
            continue;
        }

        let needed = process.cores.len();
        let available: Vec<u32> = plan
            .cold_cores
            .iter()
            .copied()
            .filter(|c| !claimed.contains(c))
            .take(needed)
            .collect();

        if available.len() < needed {
            plan.unplanned.push(UnplannedConflict {
                pid: process.pid,
                name: process.name.clone(),
                cpu_percent: process.cpu_percent,
                cores: process.cores.clone(),
                reason: UnplannedReason::ColdCoresExhausted,
            });
            continue;
        }

        claimed.extend(available.iter().copied());
        plan.actions.push(RebalanceAction {
            pid: process.pid,
            name: process.name.clone(),
            cpu_percent: process.cpu_percent,
            from_cores: process.cores.clone(),
            to_cores: available.into_iter().collect(),
            manual_only: false,
            failure_reason: None,
        });
    }

    plan
}

/// Any HOT core in the affinity set makes a conflict, even alongside COLD
/// ones, unless the set already covers every sampled core
fn is_conflict(process: &ProcessInfo, hot_cores: &CoreSet, sampled: &CoreSet) -> bool {
    !process.cores.is_empty()
        && !process.cores.is_superset(sampled)
        && process.cores.iter().any(|c| hot_cores.contains(c))
}
