//! Top-N process inventory with affinity
//!
//! Affinity queries are independent per process and per thread: one that
//! fails (the process exited, access was denied, the mask was malformed)
//! is recorded and the entry left out, the rest of the inventory goes on.

use super::{ProcessEntry, ProcessSource};
use crate::cpumask::CpuMask;
use crate::error::Result;
use crate::models::{CoreSet, ProcessInfo, QueryFailure, ThreadInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How many processes to inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Processes to keep
    pub top_n: usize,
    /// Busiest processes considered before failures are dropped
    pub candidate_pool: usize,
    /// Also inventory threads of each kept process
    pub include_threads: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            top_n: 5,
            candidate_pool: 20,
            include_threads: false,
        }
    }
}

/// Inventory result with its soft failures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryReport {
    pub processes: Vec<ProcessInfo>,
    pub failures: Vec<QueryFailure>,
}

/// Builds the process inventory from a process source
pub struct ProcessInventory {
    source: Arc<dyn ProcessSource>,
    /// Cores the host exposes; decoded masks are restricted to these
    host_cores: Option<CoreSet>,
}

impl ProcessInventory {
    pub fn new(source: Arc<dyn ProcessSource>) -> Self {
        Self {
            source,
            host_cores: None,
        }
    }

    /// Restrict decoded core sets to the given host cores
    pub fn with_host_cores(mut self, cores: CoreSet) -> Self {
        self.host_cores = Some(cores);
        self
    }

    /// The busiest processes, or only `filter_pid` (with its threads) when given
    pub async fn top_processes(
        &self,
        config: &InventoryConfig,
        filter_pid: Option<i32>,
    ) -> Result<InventoryReport> {
        let mut report = InventoryReport::default();

        if let Some(pid) = filter_pid {
            match self.source.process(pid).await {
                Ok(entry) => self.inventory_one(entry, true, &mut report).await,
                Err(e) => report.failures.push(QueryFailure {
                    pid,
                    tid: None,
                    reason: e.to_string(),
                }),
            }
            return Ok(report);
        }

        let mut candidates = self.source.list_processes().await?;
        candidates.sort_by(|a, b| {
            b.cpu_percent
                .total_cmp(&a.cpu_percent)
                .then_with(|| a.pid.cmp(&b.pid))
        });
        candidates.truncate(config.candidate_pool.max(config.top_n));

        for entry in candidates {
            if report.processes.len() == config.top_n {
                break;
            }
            self.inventory_one(entry, config.include_threads, &mut report)
                .await;
        }

        debug!(
            processes = report.processes.len(),
            failures = report.failures.len(),
            "Process inventory complete"
        );
        Ok(report)
    }

    async fn inventory_one(
        &self,
        entry: ProcessEntry,
        with_threads: bool,
        report: &mut InventoryReport,
    ) {
        let pid = entry.pid;
        let (affinity_mask, cores) = match self.decode(self.source.affinity_mask(pid).await) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(pid = pid, error = %e, "Affinity query failed");
                report.failures.push(QueryFailure {
                    pid,
                    tid: None,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let threads = if with_threads {
            Some(self.threads_of(pid, &mut report.failures).await)
        } else {
            None
        };

        report.processes.push(ProcessInfo {
            pid,
            name: entry.name,
            cpu_percent: entry.cpu_percent,
            affinity_mask,
            cores,
            threads,
        });
    }

    async fn threads_of(&self, pid: i32, failures: &mut Vec<QueryFailure>) -> Vec<ThreadInfo> {
        let entries = match self.source.list_threads(pid).await {
            Ok(entries) => entries,
            Err(e) => {
                failures.push(QueryFailure {
                    pid,
                    tid: None,
                    reason: format!("thread listing failed: {}", e),
                });
                return Vec::new();
            }
        };

        let mut threads = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.decode(self.source.thread_affinity_mask(pid, entry.tid).await) {
                Ok((_, cores)) => threads.push(ThreadInfo {
                    tid: entry.tid,
                    pid,
                    name: entry.name,
                    cpu_percent: entry.cpu_percent,
                    cores,
                }),
                Err(e) => failures.push(QueryFailure {
                    pid,
                    tid: Some(entry.tid),
                    reason: e.to_string(),
                }),
            }
        }
        threads
    }

    fn decode(&self, raw: Result<String>) -> Result<(String, CoreSet)> {
        let raw = raw?;
        let mut cores = CpuMask::parse(&raw)?.cores();
        if let Some(host) = &self.host_cores {
            cores.retain(|c| host.contains(c));
        }
        Ok((raw, cores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{async_trait, ThreadEntry};
    use crate::error::TidyError;
    use std::collections::HashMap;

    /// In-memory process table
    #[derive(Default)]
    struct FakeTable {
        processes: Vec<ProcessEntry>,
        masks: HashMap<i32, String>,
        threads: HashMap<i32, Vec<ThreadEntry>>,
        thread_masks: HashMap<i32, String>,
    }

    impl FakeTable {
        fn with(mut self, pid: i32, cpu: f64, mask: Option<&str>) -> Self {
            self.processes.push(ProcessEntry {
                pid,
                name: format!("proc{}", pid),
                cpu_percent: cpu,
            });
            if let Some(mask) = mask {
                self.masks.insert(pid, mask.to_string());
            }
            self
        }
    }

    #[async_trait]
    impl ProcessSource for FakeTable {
        async fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
            Ok(self.processes.clone())
        }

        async fn process(&self, pid: i32) -> Result<ProcessEntry> {
            self.processes
                .iter()
                .find(|p| p.pid == pid)
                .cloned()
                .ok_or(TidyError::ProcessGone(pid))
        }

        async fn affinity_mask(&self, pid: i32) -> Result<String> {
            self.masks
                .get(&pid)
                .cloned()
                .ok_or(TidyError::PermissionDenied(pid))
        }

        async fn list_threads(&self, pid: i32) -> Result<Vec<ThreadEntry>> {
            Ok(self.threads.get(&pid).cloned().unwrap_or_default())
        }

        async fn thread_affinity_mask(&self, _pid: i32, tid: i32) -> Result<String> {
            self.thread_masks
                .get(&tid)
                .cloned()
                .ok_or(TidyError::ProcessGone(tid))
        }
    }

    #[tokio::test]
    async fn test_top_n_ordering() {
        let table = FakeTable::default()
            .with(10, 5.0, Some("1"))
            .with(11, 50.0, Some("2"))
            .with(12, 20.0, Some("3"))
            .with(13, 50.0, Some("f"));
        let inventory = ProcessInventory::new(Arc::new(table));

        let config = InventoryConfig {
            top_n: 3,
            ..Default::default()
        };
        let report = inventory.top_processes(&config, None).await.unwrap();

        let pids: Vec<i32> = report.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![11, 13, 12]);
        assert_eq!(report.processes[1].cores, CoreSet::from([0, 1, 2, 3]));
        assert_eq!(report.processes[1].affinity_mask, "f");
    }

    #[tokio::test]
    async fn test_failed_query_excluded_and_recorded() {
        let table = FakeTable::default()
            .with(1, 90.0, None)
            .with(2, 80.0, Some("1"))
            .with(3, 70.0, Some("zz"))
            .with(4, 60.0, Some("2"));
        let inventory = ProcessInventory::new(Arc::new(table));

        let config = InventoryConfig {
            top_n: 2,
            ..Default::default()
        };
        let report = inventory.top_processes(&config, None).await.unwrap();

        let pids: Vec<i32> = report.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 4]);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].pid, 1);
        assert!(report.failures[0].reason.contains("not permitted"));
        assert_eq!(report.failures[1].pid, 3);
    }

    #[tokio::test]
    async fn test_candidate_pool_limits_search() {
        let table = FakeTable::default()
            .with(1, 90.0, None)
            .with(2, 80.0, None)
            .with(3, 70.0, Some("1"));
        let inventory = ProcessInventory::new(Arc::new(table));

        let config = InventoryConfig {
            top_n: 1,
            candidate_pool: 2,
            include_threads: false,
        };
        let report = inventory.top_processes(&config, None).await.unwrap();
        assert!(report.processes.is_empty());
        assert_eq!(report.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_filter_pid_includes_threads() {
        let mut table = FakeTable::default()
            .with(7, 10.0, Some("3"))
            .with(8, 99.0, Some("3"));
        table.threads.insert(
            7,
            vec![
                ThreadEntry {
                    tid: 7,
                    name: "main".to_string(),
                    cpu_percent: 6.0,
                },
                ThreadEntry {
                    tid: 70,
                    name: "worker".to_string(),
                    cpu_percent: 4.0,
                },
                ThreadEntry {
                    tid: 71,
                    name: "gone".to_string(),
                    cpu_percent: 0.0,
                },
            ],
        );
        table.thread_masks.insert(7, "3".to_string());
        table.thread_masks.insert(70, "100000002".to_string());
        let inventory =
            ProcessInventory::new(Arc::new(table)).with_host_cores(CoreSet::from([0, 1, 2, 3]));

        let report = inventory
            .top_processes(&InventoryConfig::default(), Some(7))
            .await
            .unwrap();

        assert_eq!(report.processes.len(), 1);
        let threads = report.processes[0].threads.as_ref().unwrap();
        assert_eq!(threads.len(), 2);
        // Bit 32 is not a host core
        assert_eq!(threads[1].cores, CoreSet::from([1]));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tid, Some(71));
    }

    #[tokio::test]
    async fn test_filter_pid_missing() {
        let inventory = ProcessInventory::new(Arc::new(FakeTable::default()));
        let report = inventory
            .top_processes(&InventoryConfig::default(), Some(4242))
            .await
            .unwrap();
        assert!(report.processes.is_empty());
        assert_eq!(report.failures[0].pid, 4242);
    }
}
