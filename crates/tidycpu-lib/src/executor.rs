//! Plan execution
//!
//! Each action is applied on its own: set the destination mask, read it
//! back, and record either `Applied` or `ManualOnly`. A failure never stops
//! the remaining actions and never rolls back earlier ones. Nothing is
//! retried within a run.

use crate::error::{Result, TidyError};
use crate::models::{CoreSet, ExecutionOutcome, OutcomeStatus, RebalanceAction};
use async_trait::async_trait;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Query and set the affinity of a process
#[async_trait]
pub trait AffinityControl: Send + Sync {
    /// Restrict `pid` to `cores`
    async fn set_affinity(&self, pid: i32, cores: &CoreSet) -> Result<()>;

    /// Cores `pid` may currently run on
    async fn get_affinity(&self, pid: i32) -> Result<CoreSet>;
}

/// Affinity control through `sched_setaffinity(2)` / `sched_getaffinity(2)`
pub struct SchedAffinity {
    proc_path: PathBuf,
    /// Apply to every thread of the process, like `taskset -a`
    all_threads: bool,
}

impl SchedAffinity {
    pub fn new() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
            all_threads: false,
        }
    }

    pub fn with_proc_path(mut self, proc_path: impl Into<PathBuf>) -> Self {
        self.proc_path = proc_path.into();
        self
    }

    pub fn all_threads(mut self, all_threads: bool) -> Self {
        self.all_threads = all_threads;
        self
    }

    fn cpu_set(pid: i32, cores: &CoreSet) -> Result<CpuSet> {
        if cores.is_empty() {
            return Err(TidyError::InvalidCores {
                pid,
                reason: "empty core set".to_string(),
            });
        }
        let mut set = CpuSet::new();
        for core in cores {
            set.set(*core as usize).map_err(|_| TidyError::InvalidCores {
                pid,
                reason: format!("core {} exceeds the kernel cpu set size", core),
            })?;
        }
        Ok(set)
    }

    async fn thread_ids(&self, pid: i32) -> Vec<i32> {
        let mut tids = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.proc_path.join(format!("{}/task", pid))).await
        else {
            return tids;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(tid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
                if tid != pid {
                    tids.push(tid);
                }
            }
        }
        tids
    }
}

impl Default for SchedAffinity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AffinityControl for SchedAffinity {
    async fn set_affinity(&self, pid: i32, cores: &CoreSet) -> Result<()> {
        let set = Self::cpu_set(pid, cores)?;
        sched_setaffinity(Pid::from_raw(pid), &set).map_err(|e| TidyError::from_errno(pid, e))?;

        if self.all_threads {
            for tid in self.thread_ids(pid).await {
                // Threads exit between listing and the call
                if let Err(e) = sched_setaffinity(Pid::from_raw(tid), &set) {
                    debug!(pid = pid, tid = tid, error = %e, "Thread affinity not changed");
                }
            }
        }
        Ok(())
    }

    async fn get_affinity(&self, pid: i32) -> Result<CoreSet> {
        let set = sched_getaffinity(Pid::from_raw(pid)).map_err(|e| TidyError::from_errno(pid, e))?;
        let mut cores = CoreSet::new();
        for core in 0..CpuSet::count() {
            if set.is_set(core).unwrap_or(false) {
                cores.insert(core as u32);
            }
        }
        Ok(cores)
    }
}

/// Applies rebalance actions one at a time, in plan order
pub struct Executor {
    control: Arc<dyn AffinityControl>,
}

impl Executor {
    pub fn new(control: Arc<dyn AffinityControl>) -> Self {
        Self { control }
    }

    /// Apply every action; one outcome per action, in the same order
    pub async fn apply(&self, actions: &[RebalanceAction]) -> Vec<ExecutionOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            outcomes.push(self.apply_one(action).await);
        }
        outcomes
    }

    async fn apply_one(&self, action: &RebalanceAction) -> ExecutionOutcome {
        debug!(pid = action.pid, state = "applying", to = ?action.to_cores, "Applying action");

        let status = match self.try_apply(action).await {
            Ok(confirmed) => OutcomeStatus::Applied { confirmed },
            Err(reason) => OutcomeStatus::ManualOnly { reason },
        };

        debug!(
            pid = action.pid,
            state = if matches!(status, OutcomeStatus::Applied { .. }) {
                "applied"
            } else {
                "manual_only"
            },
            "Action finished"
        );

        ExecutionOutcome {
            pid: action.pid,
            name: action.name.clone(),
            to_cores: action.to_cores.clone(),
            status,
        }
    }

    async fn try_apply(&self, action: &RebalanceAction) -> std::result::Result<CoreSet, String> {
        self.control
            .set_affinity(action.pid, &action.to_cores)
            .await
            .map_err(|e| e.to_string())?;

        let confirmed = self
            .control
            .get_affinity(action.pid)
            .await
            .map_err(|e| format!("affinity set but not confirmed: {}", e))?;

        if confirmed != action.to_cores {
            return Err(format!(
                "kernel reports cores {} instead of {}",
                crate::cpumask::format_cpu_list(&confirmed),
                crate::cpumask::format_cpu_list(&action.to_cores)
            ));
        }
        Ok(confirmed)
    }
}
