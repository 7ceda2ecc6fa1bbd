//! One rebalancing run
//!
//! Stages run in sequence: preflight, topology, utilization sample,
//! process inventory, plan, and (in apply mode) execution. Fatal errors
//! surface before any partial report is produced.

use crate::collector::{
    CounterSource, InventoryConfig, InventoryReport, ProcessInventory, ProcessSource, UsageReport,
    UsageSampler,
};
use crate::error::Result;
use crate::executor::{AffinityControl, Executor};
use crate::models::{ExecutionOutcome, RebalanceAction, Thresholds};
use crate::observability::{StructuredLogger, TidyMetrics};
use crate::planner::{build_plan, RebalancePlan};
use crate::preflight::{EffectiveUid, PrivilegeCheck};
use crate::topology::{SysfsTopology, Topology};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Whether a run may modify affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Report and plan only
    Plan,
    /// Plan, then apply every action
    Apply,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Plan => "plan",
            RunMode::Apply => "apply",
        }
    }
}

/// Configuration for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Gap between the two counter reads (default: 500ms)
    pub interval: Duration,
    pub thresholds: Thresholds,
    pub inventory: InventoryConfig,
    /// Inventory only this process and its threads
    pub filter_pid: Option<i32>,
    pub mode: RunMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            thresholds: Thresholds::default(),
            inventory: InventoryConfig::default(),
            filter_pid: None,
            mode: RunMode::Plan,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing to move
    Balanced,
    /// Conflicts found, nothing applied
    Planned,
    /// Actions were handed to the executor
    Executed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Balanced => "balanced",
            RunStatus::Planned => "planned",
            RunStatus::Executed => "executed",
        }
    }
}

/// Everything a run observed, planned and did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub topology: Topology,
    pub usage: UsageReport,
    pub inventory: InventoryReport,
    pub plan: RebalancePlan,
    /// One per planned action once executed, in plan order
    pub outcomes: Vec<ExecutionOutcome>,
}

impl RunReport {
    /// Plan actions annotated with their execution result
    pub fn annotated_actions(&self) -> Vec<RebalanceAction> {
        self.plan
            .actions
            .iter()
            .map(|action| {
                self.outcomes
                    .iter()
                    .find(|o| o.pid == action.pid)
                    .map(|o| o.annotate(action))
                    .unwrap_or_else(|| action.clone())
            })
            .collect()
    }
}

/// Sample, inventory, plan and optionally apply
pub struct Pipeline {
    counters: Arc<dyn CounterSource>,
    processes: Arc<dyn ProcessSource>,
    affinity: Arc<dyn AffinityControl>,
    privilege: Arc<dyn PrivilegeCheck>,
    topology: SysfsTopology,
    config: PipelineConfig,
    metrics: TidyMetrics,
    logger: StructuredLogger,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Discover the host topology only
    pub async fn topology(&self) -> Result<Topology> {
        let topology = self.topology.discover().await?;
        self.metrics.set_logical_cores(topology.logical_count());
        Ok(topology)
    }

    /// Run every stage the configured mode allows
    pub async fn run(&self) -> Result<RunReport> {
        let report = self.survey().await?;
        match self.config.mode {
            RunMode::Apply => Ok(self.execute(report).await),
            RunMode::Plan => {
                self.finish(&report);
                Ok(report)
            }
        }
    }

    /// Everything up to and including the plan; never modifies affinity.
    ///
    /// In apply mode the privilege check runs first so an unprivileged run
    /// fails before sampling.
    pub async fn survey(&self) -> Result<RunReport> {
        if self.config.mode == RunMode::Apply {
            self.privilege.require()?;
        }

        let topology = self.topology().await?;
        self.logger
            .log_run_started(self.config.mode.as_str(), topology.logical_count());

        let start = Instant::now();
        let sampler = UsageSampler::new(self.counters.clone(), self.config.thresholds);
        let mut usage = sampler
            .sample(topology.logical_count(), self.config.interval)
            .await?;
        self.metrics
            .observe_sample_duration(start.elapsed().as_secs_f64());

        // Offline or hot-added cores cannot be planned for
        usage.stats.retain(|s| {
            let known = topology.contains(s.core_id);
            if !known {
                debug!(core = s.core_id, "Dropping sampled core outside topology");
            }
            known
        });
        self.metrics.set_core_labels(&usage);
        self.logger.log_usage_sampled(&usage);

        let inventory = ProcessInventory::new(self.processes.clone())
            .with_host_cores(topology.logical_ids())
            .top_processes(&self.config.inventory, self.config.filter_pid)
            .await?;
        for failure in &inventory.failures {
            self.logger.log_query_failed(failure);
        }
        self.metrics.add_query_failures(inventory.failures.len());

        let plan = build_plan(&usage.stats, &inventory.processes);
        self.metrics.add_actions_planned(plan.actions.len());
        self.logger.log_plan_built(&plan);

        let status = if plan.is_balanced() {
            RunStatus::Balanced
        } else {
            RunStatus::Planned
        };

        Ok(RunReport {
            status,
            topology,
            usage,
            inventory,
            plan,
            outcomes: Vec::new(),
        })
    }

    /// Apply a surveyed plan. A plan without actions is returned unchanged.
    pub async fn execute(&self, mut report: RunReport) -> RunReport {
        if !report.plan.actions.is_empty() {
            let outcomes = Executor::new(self.affinity.clone())
                .apply(&report.plan.actions)
                .await;
            for outcome in &outcomes {
                self.metrics.record_outcome(outcome);
                self.logger.log_outcome(outcome);
            }
            report.outcomes = outcomes;
            report.status = RunStatus::Executed;
        }
        self.finish(&report);
        report
    }

    /// Record the end of a run that will not be executed
    pub fn finish(&self, report: &RunReport) {
        self.metrics.inc_runs(report.status.as_str());
        let applied = report.outcomes.iter().filter(|o| o.is_applied()).count();
        self.logger.log_run_finished(
            report.status.as_str(),
            report.plan.actions.len(),
            applied,
        );
    }
}

/// Builder for a pipeline
pub struct PipelineBuilder {
    counters: Option<Arc<dyn CounterSource>>,
    processes: Option<Arc<dyn ProcessSource>>,
    affinity: Option<Arc<dyn AffinityControl>>,
    privilege: Arc<dyn PrivilegeCheck>,
    sys_path: PathBuf,
    config: PipelineConfig,
    logger: Option<StructuredLogger>,
}

impl PipelineBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            counters: None,
            processes: None,
            affinity: None,
            privilege: Arc::new(EffectiveUid),
            sys_path: PathBuf::from("/sys"),
            config: PipelineConfig::default(),
            logger: None,
        }
    }

    pub fn counters(mut self, counters: Arc<dyn CounterSource>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn processes(mut self, processes: Arc<dyn ProcessSource>) -> Self {
        self.processes = Some(processes);
        self
    }

    pub fn affinity(mut self, affinity: Arc<dyn AffinityControl>) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn privilege(mut self, privilege: Arc<dyn PrivilegeCheck>) -> Self {
        self.privilege = privilege;
        self
    }

    /// Root of the sysfs tree topology is read from
    pub fn sys_path(mut self, sys_path: impl Into<PathBuf>) -> Self {
        self.sys_path = sys_path.into();
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the pipeline
    pub fn build(self) -> anyhow::Result<Pipeline> {
        let counters = self
            .counters
            .ok_or_else(|| anyhow::anyhow!("Counter source is required"))?;
        let processes = self
            .processes
            .ok_or_else(|| anyhow::anyhow!("Process source is required"))?;
        let affinity = self
            .affinity
            .ok_or_else(|| anyhow::anyhow!("Affinity control is required"))?;

        Ok(Pipeline {
            counters,
            processes,
            affinity,
            privilege: self.privilege,
            topology: SysfsTopology::new(self.sys_path),
            config: self.config,
            metrics: TidyMetrics::new(),
            logger: self.logger.unwrap_or_default(),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{async_trait, ProcessEntry, ThreadEntry};
    use crate::error::TidyError;
    use crate::models::{CoreSample, CoreSet, OutcomeStatus};
    use crate::preflight::StaticPrivilege;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Returns each scripted snapshot once, then repeats the last
    struct ScriptedCounters {
        snapshots: Mutex<Vec<Vec<CoreSample>>>,
    }

    impl ScriptedCounters {
        /// Two snapshots producing the given per-core utilization
        fn with_usage(usage: &[u64]) -> Self {
            let before: Vec<CoreSample> = (0..usage.len() as u32)
                .map(|id| CoreSample {
                    core_id: id,
                    busy: 0,
                    idle: 0,
                    total: 0,
                })
                .collect();
            let after = usage
                .iter()
                .enumerate()
                .map(|(id, busy)| CoreSample {
                    core_id: id as u32,
                    busy: *busy,
                    idle: 100 - busy,
                    total: 100,
                })
                .collect();
            Self {
                snapshots: Mutex::new(vec![after, before]),
            }
        }
    }

    #[async_trait]
    impl CounterSource for ScriptedCounters {
        async fn read_counters(&self) -> Result<Vec<CoreSample>> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.pop().unwrap())
            } else {
                Ok(snapshots[0].clone())
            }
        }
    }

    struct FakeProcesses {
        entries: Vec<(ProcessEntry, String)>,
    }

    impl FakeProcesses {
        fn new(entries: &[(i32, f64, &str)]) -> Self {
            Self {
                entries: entries
                    .iter()
                    .map(|(pid, cpu, mask)| {
                        (
                            ProcessEntry {
                                pid: *pid,
                                name: format!("proc{}", pid),
                                cpu_percent: *cpu,
                            },
                            mask.to_string(),
                        )
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ProcessSource for FakeProcesses {
        async fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
            Ok(self.entries.iter().map(|(e, _)| e.clone()).collect())
        }

        async fn process(&self, pid: i32) -> Result<ProcessEntry> {
            self.entries
                .iter()
                .find(|(e, _)| e.pid == pid)
                .map(|(e, _)| e.clone())
                .ok_or(TidyError::ProcessGone(pid))
        }

        async fn affinity_mask(&self, pid: i32) -> Result<String> {
            self.entries
                .iter()
                .find(|(e, _)| e.pid == pid)
                .map(|(_, m)| m.clone())
                .ok_or(TidyError::ProcessGone(pid))
        }

        async fn list_threads(&self, _pid: i32) -> Result<Vec<ThreadEntry>> {
            Ok(Vec::new())
        }

        async fn thread_affinity_mask(&self, _pid: i32, tid: i32) -> Result<String> {
            Err(TidyError::ProcessGone(tid))
        }
    }

    #[derive(Default)]
    struct FakeAffinity {
        applied: Mutex<HashMap<i32, CoreSet>>,
        deny: Vec<i32>,
    }

    #[async_trait]
    impl AffinityControl for FakeAffinity {
        async fn set_affinity(&self, pid: i32, cores: &CoreSet) -> Result<()> {
            if self.deny.contains(&pid) {
                return Err(TidyError::PermissionDenied(pid));
            }
            self.applied.lock().unwrap().insert(pid, cores.clone());
            Ok(())
        }

        async fn get_affinity(&self, pid: i32) -> Result<CoreSet> {
            self.applied
                .lock()
                .unwrap()
                .get(&pid)
                .cloned()
                .ok_or(TidyError::ProcessGone(pid))
        }
    }

    async fn mock_sys(dir: &Path, cores: u32) -> PathBuf {
        let cpu_dir = dir.join("sys/devices/system/cpu");
        tokio::fs::create_dir_all(&cpu_dir).await.unwrap();
        tokio::fs::write(cpu_dir.join("online"), format!("0-{}\n", cores - 1))
            .await
            .unwrap();
        for cpu in 0..cores {
            let topo = cpu_dir.join(format!("cpu{}/topology", cpu));
            tokio::fs::create_dir_all(&topo).await.unwrap();
            tokio::fs::write(topo.join("physical_package_id"), "0\n")
                .await
                .unwrap();
            tokio::fs::write(topo.join("core_id"), format!("{}\n", cpu))
                .await
                .unwrap();
        }
        dir.join("sys")
    }

    fn builder(
        sys: &Path,
        usage: &[u64],
        processes: &[(i32, f64, &str)],
        affinity: Arc<FakeAffinity>,
    ) -> PipelineBuilder {
        PipelineBuilder::new()
            .counters(Arc::new(ScriptedCounters::with_usage(usage)))
            .processes(Arc::new(FakeProcesses::new(processes)))
            .affinity(affinity)
            .privilege(Arc::new(StaticPrivilege(true)))
            .sys_path(sys)
            .interval(Duration::from_millis(1))
            .logger(StructuredLogger::new("test-host"))
    }

    #[tokio::test]
    async fn test_plan_mode_does_not_apply() {
        let temp_dir = TempDir::new().unwrap();
        let sys = mock_sys(temp_dir.path(), 2).await;
        let affinity = Arc::new(FakeAffinity::default());

        let pipeline = builder(&sys, &[95, 5], &[(100, 80.0, "1")], affinity.clone())
            .build()
            .unwrap();
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Planned);
        assert_eq!(report.plan.actions.len(), 1);
        assert_eq!(report.plan.actions[0].to_cores, CoreSet::from([1]));
        assert!(report.outcomes.is_empty());
        assert!(affinity.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_mode_executes() {
        let temp_dir = TempDir::new().unwrap();
        let sys = mock_sys(temp_dir.path(), 4).await;
        let affinity = Arc::new(FakeAffinity {
            deny: vec![200],
            ..Default::default()
        });

        let pipeline = builder(
            &sys,
            &[95, 90, 5, 10],
            &[(100, 80.0, "1"), (200, 60.0, "2"), (300, 1.0, "4")],
            affinity.clone(),
        )
        .mode(RunMode::Apply)
        .build()
        .unwrap();
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Executed);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            report.outcomes[0].status,
            OutcomeStatus::Applied {
                confirmed: CoreSet::from([2])
            }
        );
        assert!(report.outcomes[1].reason().unwrap().contains("not permitted"));

        let annotated = report.annotated_actions();
        assert!(!annotated[0].manual_only);
        assert!(annotated[1].manual_only);
    }

    #[tokio::test]
    async fn test_balanced_host() {
        let temp_dir = TempDir::new().unwrap();
        let sys = mock_sys(temp_dir.path(), 3).await;

        let pipeline = builder(
            &sys,
            &[45, 60, 79],
            &[(1, 50.0, "1")],
            Arc::new(FakeAffinity::default()),
        )
        .mode(RunMode::Apply)
        .build()
        .unwrap();
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Balanced);
        assert!(report.plan.actions.is_empty());
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_default_mask_process_is_balanced() {
        let temp_dir = TempDir::new().unwrap();
        let sys = mock_sys(temp_dir.path(), 4).await;

        let pipeline = builder(
            &sys,
            &[95, 5, 5, 5],
            &[(1, 90.0, "f")],
            Arc::new(FakeAffinity::default()),
        )
        .build()
        .unwrap();
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Balanced);
        assert!(report.plan.unplanned.is_empty());
    }

    #[tokio::test]
    async fn test_unprivileged_apply_fails_first() {
        let temp_dir = TempDir::new().unwrap();
        // No sysfs at all: the privilege error must come before topology
        let pipeline = builder(
            &temp_dir.path().join("missing"),
            &[95, 5],
            &[],
            Arc::new(FakeAffinity::default()),
        )
        .privilege(Arc::new(StaticPrivilege(false)))
        .mode(RunMode::Apply)
        .build()
        .unwrap();

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, TidyError::NotPrivileged));
    }

    #[tokio::test]
    async fn test_unprivileged_plan_allowed() {
        let temp_dir = TempDir::new().unwrap();
        let sys = mock_sys(temp_dir.path(), 2).await;

        let pipeline = builder(&sys, &[95, 5], &[], Arc::new(FakeAffinity::default()))
            .privilege(Arc::new(StaticPrivilege(false)))
            .build()
            .unwrap();
        assert!(pipeline.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_topology_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = builder(
            temp_dir.path(),
            &[95, 5],
            &[],
            Arc::new(FakeAffinity::default()),
        )
        .build()
        .unwrap();

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, TidyError::TopologyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_stats_restricted_to_topology() {
        let temp_dir = TempDir::new().unwrap();
        // Counters report three cores, topology knows two
        let sys = mock_sys(temp_dir.path(), 2).await;

        let pipeline = builder(
            &sys,
            &[95, 50, 1],
            &[(100, 80.0, "1")],
            Arc::new(FakeAffinity::default()),
        )
        .build()
        .unwrap();
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.usage.stats.len(), 2);
        // Core 2 was the only COLD core, so nothing can move
        assert_eq!(report.status, RunStatus::Balanced);
    }

    #[tokio::test]
    async fn test_survey_then_execute() {
        let temp_dir = TempDir::new().unwrap();
        let sys = mock_sys(temp_dir.path(), 2).await;
        let affinity = Arc::new(FakeAffinity::default());

        let pipeline = builder(&sys, &[95, 5], &[(100, 80.0, "1")], affinity.clone())
            .mode(RunMode::Apply)
            .build()
            .unwrap();
        let surveyed = pipeline.survey().await.unwrap();
        assert_eq!(surveyed.status, RunStatus::Planned);
        assert!(affinity.applied.lock().unwrap().is_empty());

        let executed = pipeline.execute(surveyed).await;
        assert_eq!(executed.status, RunStatus::Executed);
        assert_eq!(
            affinity.applied.lock().unwrap().get(&100),
            Some(&CoreSet::from([1]))
        );
    }

    #[test]
    fn test_builder_requires_sources() {
        assert!(PipelineBuilder::new().build().is_err());
        assert!(PipelineBuilder::new()
            .counters(Arc::new(ScriptedCounters::with_usage(&[1])))
            .build()
            .is_err());
    }
}
