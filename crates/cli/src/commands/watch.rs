//! Watch command: repeat the scan until interrupted

use anyhow::Result;
use colored::Colorize;
use std::time::Duration;
use tidycpu_lib::RunMode;
use tracing::{info, warn};

use super::scan::render_report;
use super::{host_pipeline, ScanArgs};
use crate::config::Settings;
use crate::output::OutputFormat;

/// Clear the terminal and move the cursor home
const CLEAR_SCREEN: &str = "\x1B[2J\x1B[H";

pub async fn run(
    settings: &Settings,
    args: &ScanArgs,
    refresh_secs: u64,
    format: OutputFormat,
) -> Result<()> {
    let pipeline = host_pipeline(settings, args, RunMode::Plan, false)?;
    let refresh = Duration::from_secs(refresh_secs.max(1));
    info!(refresh_secs = refresh.as_secs(), "Starting watch");

    loop {
        tokio::select! {
            result = pipeline.run() => {
                match result {
                    Ok(report) => {
                        if matches!(format, OutputFormat::Table) {
                            print!("{}", CLEAR_SCREEN);
                            println!(
                                "{}",
                                format!(
                                    "tidycpu watch, every {}s (ctrl-c to stop), {}",
                                    refresh.as_secs(),
                                    chrono::Local::now().format("%H:%M:%S")
                                )
                                .dimmed()
                            );
                        }
                        render_report(&report, format)?;
                    }
                    // Fatal errors will not go away by retrying
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => warn!(error = %e, "Scan failed, retrying"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(refresh) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Watch stopped");
    Ok(())
}
