//! CLI subcommands

pub mod apply;
pub mod scan;
pub mod topology;
pub mod watch;

use crate::config::Settings;
use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tidycpu_lib::collector::{ProcStatSource, ProcfsProcessSource};
use tidycpu_lib::{Pipeline, PipelineBuilder, RunMode, SchedAffinity};

/// Flags shared by every command that samples the host
#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Number of processes to inventory
    #[arg(long, short = 'n')]
    pub top: Option<usize>,

    /// Only inspect this process (threads included)
    #[arg(long, short)]
    pub pid: Option<i32>,

    /// List threads of each process
    #[arg(long, short)]
    pub threads: bool,

    /// Sampling window in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

/// Pipeline over the host's proc and sys filesystems
pub fn host_pipeline(
    settings: &Settings,
    args: &ScanArgs,
    mode: RunMode,
    all_threads: bool,
) -> Result<Pipeline> {
    let proc_path = settings.proc_path.clone();
    PipelineBuilder::new()
        .counters(Arc::new(ProcStatSource::with_proc_path(proc_path.clone())))
        .processes(Arc::new(ProcfsProcessSource::with_proc_path(proc_path.clone())))
        .affinity(Arc::new(
            SchedAffinity::new()
                .with_proc_path(proc_path)
                .all_threads(all_threads || settings.all_threads),
        ))
        .sys_path(settings.sys_path.clone())
        .config(settings.pipeline_config(args, mode))
        .build()
}
