//! Apply command: plan, confirm, and move processes off overloaded cores

use anyhow::{Context, Result};
use colored::Colorize;
use tabled::Tabled;
use tidycpu_lib::{OutcomeStatus, RunMode, RunReport, TidyError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::scan::{render_manual_commands, render_report};
use super::{host_pipeline, ScanArgs};
use crate::config::Settings;
use crate::output::{
    format_cores, manual_command, print_error, print_heading, print_info, print_json,
    print_success, print_table, print_warning, OutputFormat,
};

/// Row for the execution results table
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Cores")]
    cores: String,
    #[tabled(rename = "Result")]
    result: String,
}

pub async fn run(
    settings: &Settings,
    args: &ScanArgs,
    yes: bool,
    all_threads: bool,
    format: OutputFormat,
) -> Result<()> {
    let pipeline = host_pipeline(settings, args, RunMode::Apply, all_threads)?;

    let report = match pipeline.survey().await {
        Ok(report) => report,
        Err(e @ TidyError::NotPrivileged) => {
            return Err(e).context("run `sudo tidycpu apply`, or use `tidycpu scan` to only plan");
        }
        Err(e) => return Err(e.into()),
    };

    if report.plan.actions.is_empty() {
        pipeline.finish(&report);
        return render_report(&report, format);
    }

    // JSON output is for scripts; never prompt there
    let confirmed = match format {
        OutputFormat::Json => yes,
        OutputFormat::Table => {
            render_report(&report, format)?;
            yes || confirm(&format!("Apply {} change(s)?", report.plan.actions.len())).await?
        }
    };

    if !confirmed {
        pipeline.finish(&report);
        match format {
            OutputFormat::Json => return print_json(&report),
            OutputFormat::Table => {
                print_warning("No changes made");
                render_manual_commands(&report);
            }
        }
        return Ok(());
    }

    let report = pipeline.execute(report).await;
    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            render_outcomes(&report);
            Ok(())
        }
    }
}

/// Ask a yes/no question on the terminal; anything but yes is a no
async fn confirm(question: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("\n{} [y/N] ", question).as_bytes())
        .await?;
    stdout.flush().await?;

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("Failed to read confirmation")?;

    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn render_outcomes(report: &RunReport) {
    print_heading("Results");

    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|o| OutcomeRow {
            pid: o.pid,
            name: o.name.clone(),
            cores: format_cores(&o.to_cores),
            result: match &o.status {
                OutcomeStatus::Applied { .. } => "applied".green().to_string(),
                OutcomeStatus::ManualOnly { reason } => reason.red().to_string(),
            },
        })
        .collect();
    print_table(rows);

    let manual: Vec<_> = report.outcomes.iter().filter(|o| !o.is_applied()).collect();
    let applied = report.outcomes.len() - manual.len();

    if manual.is_empty() {
        print_success(&format!("Applied {} change(s)", applied));
        return;
    }

    if applied > 0 {
        print_success(&format!("Applied {} change(s)", applied));
    }
    print_error(&format!("{} change(s) could not be applied", manual.len()));
    print_info("Apply these by hand:");
    for outcome in manual {
        println!("  {}", manual_command(outcome.pid, &outcome.to_cores));
    }
}
