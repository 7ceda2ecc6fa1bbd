//! Per-core CPU load rebalancing library
//!
//! This crate provides the core functionality for:
//! - Host topology discovery from sysfs
//! - Per-core utilization sampling from kernel tick counters
//! - Process and thread affinity inventory
//! - Conflict detection and greedy rebalance planning
//! - Applying affinity changes with per-action outcomes
//! - Metrics and structured logging

pub mod collector;
pub mod cpumask;
pub mod error;
pub mod executor;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod planner;
pub mod preflight;
pub mod topology;

pub use cpumask::{format_cpu_list, parse_cpu_list, CpuMask};
pub use error::{Result, TidyError};
pub use executor::{AffinityControl, Executor, SchedAffinity};
pub use models::*;
pub use observability::{StructuredLogger, TidyMetrics};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, RunMode, RunReport, RunStatus};
pub use planner::{build_plan, PlanStatus, RebalancePlan, UnplannedConflict, UnplannedReason};
pub use preflight::{EffectiveUid, PrivilegeCheck, StaticPrivilege};
pub use topology::{SysfsTopology, Topology};
