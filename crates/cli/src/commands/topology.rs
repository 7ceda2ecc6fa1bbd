//! Topology command

use anyhow::Result;
use tabled::Tabled;
use tidycpu_lib::{RunMode, Topology};

use super::{host_pipeline, ScanArgs};
use crate::config::Settings;
use crate::output::{format_cores, print_json, print_table, OutputFormat};

/// Row for the logical core table
#[derive(Tabled)]
struct LogicalRow {
    #[tabled(rename = "CPU")]
    cpu: u32,
    #[tabled(rename = "Package")]
    package: u32,
    #[tabled(rename = "Core")]
    core: String,
    #[tabled(rename = "Siblings")]
    siblings: String,
    #[tabled(rename = "Primary")]
    primary: String,
}

pub async fn run(settings: &Settings, format: OutputFormat) -> Result<()> {
    let pipeline = host_pipeline(settings, &ScanArgs::default(), RunMode::Plan, false)?;
    let topology = pipeline.topology().await?;

    match format {
        OutputFormat::Json => print_json(&topology),
        OutputFormat::Table => {
            render(&topology);
            Ok(())
        }
    }
}

fn render(topology: &Topology) {
    println!(
        "{} package(s), {} physical cores, {} logical cores{}",
        topology.package_count(),
        topology.physical_core_count(),
        topology.logical_count(),
        if topology.has_smt() {
            " (SMT enabled)"
        } else {
            ""
        }
    );

    let rows: Vec<LogicalRow> = topology
        .logical_cores
        .iter()
        .map(|core| LogicalRow {
            cpu: core.id,
            package: core.package,
            core: core.physical_core.to_string(),
            siblings: topology
                .siblings_of(core.id)
                .map(format_cores)
                .unwrap_or_else(|| "-".to_string()),
            primary: if core.is_primary { "yes" } else { "" }.to_string(),
        })
        .collect();
    print_table(rows);
}
