//! Host collectors
//!
//! This module reads everything the planner needs from the host:
//! per-core tick counters from `/proc/stat` and the process table with
//! per-process and per-thread affinity from `/proc/<pid>`. The OS access
//! sits behind narrow traits so the rest of the crate can be tested with
//! scripted sources.

mod inventory;
mod proc_stat;
mod procfs;


pub use inventory::{InventoryConfig, InventoryReport, ProcessInventory};
pub use proc_stat::{compute_stats, parse_proc_stat, ProcStatSource, UsageReport, UsageSampler};
pub use procfs::{cpu_percent, parse_cpus_allowed, parse_stat, ProcfsProcessSource, StatFields};

use crate::error::Result;
use crate::models::CoreSample;
use serde::{Deserialize, Serialize};

pub use async_trait::async_trait;

/// Source of cumulative per-core tick counters
#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Read one snapshot of every core's counters. Never cached.
    async fn read_counters(&self) -> Result<Vec<CoreSample>>;
}

/// A row of the process table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: i32,
    pub name: String,
    pub cpu_percent: f64,
}

/// A row of a process's thread table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub tid: i32,
    pub name: String,
    pub cpu_percent: f64,
}

/// Read-only access to the process table and affinity masks
#[async_trait]
pub trait ProcessSource: Send + Sync {
    /// Every visible process, in no particular order
    async fn list_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// A single process by pid
    async fn process(&self, pid: i32) -> Result<ProcessEntry>;

    /// Raw kernel hex affinity mask of a process
    async fn affinity_mask(&self, pid: i32) -> Result<String>;

    /// Threads of a process
    async fn list_threads(&self, pid: i32) -> Result<Vec<ThreadEntry>>;

    /// Raw kernel hex affinity mask of one thread
    async fn thread_affinity_mask(&self, pid: i32, tid: i32) -> Result<String>;
}
