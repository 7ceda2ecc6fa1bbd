//! Process table and affinity masks from `/proc`
//!
//! CPU percentages follow `ps` semantics: CPU time consumed over the
//! lifetime of the process divided by its elapsed wall time.

use super::{async_trait, ProcessEntry, ProcessSource, ThreadEntry};
use crate::error::{Result, TidyError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Fallback when the tick rate cannot be queried
const DEFAULT_CLOCK_TICKS: u64 = 100;

/// Fields of `/proc/<pid>/stat` the inventory uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub name: String,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
}

/// Parse `/proc/<pid>/stat`.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat(content: &str) -> Result<StatFields> {
    let open = content
        .find('(')
        .ok_or_else(|| TidyError::parse("process stat", "missing command name"))?;
    let close = content
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| TidyError::parse("process stat", "unterminated command name"))?;

    let name = content[open + 1..close].to_string();
    // Field 3 (state) is index 0 here
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let field = |index: usize, label: &'static str| -> Result<u64> {
        fields
            .get(index)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| TidyError::parse("process stat", format!("bad {} field", label)))
    };

    Ok(StatFields {
        name,
        utime: field(11, "utime")?,
        stime: field(12, "stime")?,
        starttime: field(19, "starttime")?,
    })
}

/// Lifetime CPU share in percent, rounded to one decimal like `ps`
pub fn cpu_percent(stat: &StatFields, clock_ticks: u64, uptime_secs: f64) -> f64 {
    let ticks = clock_ticks.max(1) as f64;
    let elapsed = uptime_secs - stat.starttime as f64 / ticks;
    if elapsed <= 0.0 {
        return 0.0;
    }
    let cpu_secs = (stat.utime + stat.stime) as f64 / ticks;
    (cpu_secs / elapsed * 1000.0).round() / 10.0
}

/// Extract the `Cpus_allowed` hex mask from `/proc/<pid>/status`
pub fn parse_cpus_allowed(status: &str) -> Result<String> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Cpus_allowed:"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TidyError::parse("process status", "no Cpus_allowed entry"))
}

/// Process source backed by the proc filesystem
pub struct ProcfsProcessSource {
    proc_path: PathBuf,
    clock_ticks: u64,
}

impl ProcfsProcessSource {
    pub fn new() -> Self {
        Self::with_proc_path("/proc")
    }

    /// Create source with custom proc path (for testing)
    pub fn with_proc_path(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
            clock_ticks: host_clock_ticks(),
        }
    }

    /// Override the kernel tick rate
    pub fn with_clock_ticks(mut self, clock_ticks: u64) -> Self {
        self.clock_ticks = clock_ticks;
        self
    }

    async fn uptime(&self) -> Result<f64> {
        let path = self.proc_path.join("uptime");
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| TidyError::PrimitiveUnavailable {
                primitive: "process table (/proc/uptime)",
                reason: format!("{}: {}", path.display(), e),
            })?;
        content
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| TidyError::parse("/proc/uptime", content.trim().to_string()))
    }

    async fn read_stat(&self, dir: &Path, pid: i32) -> Result<StatFields> {
        let content = fs::read_to_string(dir.join("stat"))
            .await
            .map_err(|e| TidyError::from_proc_io(pid, e))?;
        parse_stat(&content)
    }

    async fn read_mask(&self, dir: &Path, id: i32) -> Result<String> {
        let content = fs::read_to_string(dir.join("status"))
            .await
            .map_err(|e| TidyError::from_proc_io(id, e))?;
        parse_cpus_allowed(&content)
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.proc_path.join(pid.to_string())
    }

    fn task_dir(&self, pid: i32, tid: i32) -> PathBuf {
        self.pid_dir(pid).join("task").join(tid.to_string())
    }
}

impl Default for ProcfsProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSource for ProcfsProcessSource {
    async fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let uptime = self.uptime().await?;
        let mut entries = fs::read_dir(&self.proc_path).await.map_err(|e| {
            TidyError::PrimitiveUnavailable {
                primitive: "process table",
                reason: format!("{}: {}", self.proc_path.display(), e),
            }
        })?;

        let mut processes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };

            // Processes exit while the table is being read
            match self.read_stat(&entry.path(), pid).await {
                Ok(stat) => processes.push(ProcessEntry {
                    pid,
                    cpu_percent: cpu_percent(&stat, self.clock_ticks, uptime),
                    name: stat.name,
                }),
                Err(e) => debug!(pid = pid, error = %e, "Skipping unreadable process"),
            }
        }

        Ok(processes)
    }

    async fn process(&self, pid: i32) -> Result<ProcessEntry> {
        let uptime = self.uptime().await?;
        let stat = self.read_stat(&self.pid_dir(pid), pid).await?;
        Ok(ProcessEntry {
            pid,
            cpu_percent: cpu_percent(&stat, self.clock_ticks, uptime),
            name: stat.name,
        })
    }

    async fn affinity_mask(&self, pid: i32) -> Result<String> {
        self.read_mask(&self.pid_dir(pid), pid).await
    }

    async fn list_threads(&self, pid: i32) -> Result<Vec<ThreadEntry>> {
        let uptime = self.uptime().await?;
        let task_dir = self.pid_dir(pid).join("task");
        let mut entries = fs::read_dir(&task_dir)
            .await
            .map_err(|e| TidyError::from_proc_io(pid, e))?;

        let mut threads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(tid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };
            match self.read_stat(&entry.path(), tid).await {
                Ok(stat) => threads.push(ThreadEntry {
                    tid,
                    cpu_percent: cpu_percent(&stat, self.clock_ticks, uptime),
                    name: stat.name,
                }),
                Err(e) => debug!(pid = pid, tid = tid, error = %e, "Skipping unreadable thread"),
            }
        }

        threads.sort_by_key(|t| t.tid);
        Ok(threads)
    }

    async fn thread_affinity_mask(&self, pid: i32, tid: i32) -> Result<String> {
        self.read_mask(&self.task_dir(pid, tid), tid).await
    }
}

fn host_clock_ticks() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => DEFAULT_CLOCK_TICKS,
    }
}
