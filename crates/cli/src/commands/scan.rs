//! Scan command: report load and plan without changing anything

use anyhow::Result;
use tabled::Tabled;
use tidycpu_lib::{CoreLabel, RunMode, RunReport};

use super::{host_pipeline, ScanArgs};
use crate::config::Settings;
use crate::output::{
    color_bar, color_label, format_cores, format_percent, manual_command, print_heading,
    print_info, print_json, print_success, print_table, print_warning, truncate_name,
    OutputFormat,
};
use colored::Colorize;

/// Row for the per-core table
#[derive(Tabled)]
struct CoreRow {
    #[tabled(rename = "Core")]
    core: u32,
    #[tabled(rename = "Usage")]
    usage: String,
    #[tabled(rename = "Load")]
    bar: String,
    #[tabled(rename = "State")]
    label: String,
}

/// Row for the process table
#[derive(Tabled)]
struct ProcessRow {
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Mask")]
    mask: String,
    #[tabled(rename = "Cores")]
    cores: String,
}

/// Row for a process's thread table
#[derive(Tabled)]
struct ThreadRow {
    #[tabled(rename = "TID")]
    tid: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Cores")]
    cores: String,
}

/// Row for the plan table
#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
    #[tabled(rename = "Status")]
    status: String,
}

pub async fn run(settings: &Settings, args: &ScanArgs, format: OutputFormat) -> Result<()> {
    let pipeline = host_pipeline(settings, args, RunMode::Plan, false)?;
    let report = pipeline.run().await?;
    render_report(&report, format)
}

/// Render a full run report
pub fn render_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            render_cores(report);
            render_processes(report);
            render_plan(report);
            Ok(())
        }
    }
}

fn render_cores(report: &RunReport) {
    let usage = &report.usage;
    println!(
        "{} logical cores on {} physical cores, {} package(s), sampled over {}ms",
        report.topology.logical_count(),
        report.topology.physical_core_count(),
        report.topology.package_count(),
        usage.interval_ms
    );

    let rows: Vec<CoreRow> = usage
        .stats
        .iter()
        .map(|s| CoreRow {
            core: s.core_id,
            usage: format_percent(s.usage),
            bar: color_bar(s.usage, s.label),
            label: color_label(s.label),
        })
        .collect();
    print_table(rows);

    println!(
        "{} {}  {} {}  {} {}",
        color_label(CoreLabel::Hot),
        usage.count(CoreLabel::Hot),
        color_label(CoreLabel::Warm),
        usage.count(CoreLabel::Warm),
        color_label(CoreLabel::Cold),
        usage.count(CoreLabel::Cold)
    );

    for gap in &usage.gaps {
        print_warning(&format!("core {} not sampled ({:?})", gap.core_id, gap.reason));
    }
}

fn render_processes(report: &RunReport) {
    let inventory = &report.inventory;
    print_heading("Top processes");

    if inventory.processes.is_empty() {
        print_warning("No processes found");
    } else {
        let rows: Vec<ProcessRow> = inventory
            .processes
            .iter()
            .map(|p| ProcessRow {
                pid: p.pid,
                name: truncate_name(&p.name, 24),
                cpu: format_percent(p.cpu_percent),
                mask: p.affinity_mask.clone(),
                cores: format_cores(&p.cores),
            })
            .collect();
        print_table(rows);
    }

    for process in &inventory.processes {
        let Some(threads) = &process.threads else {
            continue;
        };
        println!("\nThreads of {} ({})", process.name, process.pid);
        let rows: Vec<ThreadRow> = threads
            .iter()
            .map(|t| ThreadRow {
                tid: t.tid,
                name: truncate_name(&t.name, 24),
                cpu: format_percent(t.cpu_percent),
                cores: format_cores(&t.cores),
            })
            .collect();
        print_table(rows);
    }

    if !inventory.failures.is_empty() {
        print_warning(&format!(
            "{} affinity queries failed",
            inventory.failures.len()
        ));
        for failure in &inventory.failures {
            let who = match failure.tid {
                Some(tid) => format!("pid {} tid {}", failure.pid, tid),
                None => format!("pid {}", failure.pid),
            };
            println!("  {}: {}", who, failure.reason.dimmed());
        }
    }
}

fn render_plan(report: &RunReport) {
    print_heading("Rebalance plan");
    let plan = &report.plan;

    if plan.is_balanced() {
        if plan.hot_cores.is_empty() {
            print_success("No overloaded cores, nothing to move");
        } else {
            print_success("No process is pinned to an overloaded core while an idle core exists");
        }
        return;
    }

    if !plan.actions.is_empty() {
        let rows: Vec<ActionRow> = report
            .annotated_actions()
            .iter()
            .map(|a| ActionRow {
                pid: a.pid,
                name: truncate_name(&a.name, 24),
                cpu: format_percent(a.cpu_percent),
                from: format_cores(&a.from_cores),
                to: format_cores(&a.to_cores),
                status: action_status(report, a.manual_only),
            })
            .collect();
        print_table(rows);
    }

    for conflict in &plan.unplanned {
        print_warning(&format!(
            "{} ({}) on cores {} stays put: not enough idle cores left",
            conflict.name,
            conflict.pid,
            format_cores(&conflict.cores)
        ));
    }
}

fn action_status(report: &RunReport, manual_only: bool) -> String {
    if report.outcomes.is_empty() {
        "planned".blue().to_string()
    } else if manual_only {
        "manual".red().to_string()
    } else {
        "applied".green().to_string()
    }
}

/// Print the commands that apply every planned action by hand
pub fn render_manual_commands(report: &RunReport) {
    if report.plan.actions.is_empty() {
        return;
    }
    print_info("To apply the plan manually:");
    for action in &report.plan.actions {
        println!("  {}", manual_command(action.pid, &action.to_cores));
    }
}
