//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tidycpu_lib::{format_cpu_list, CoreLabel, CoreSet};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Width of the utilization bar in cells
const BAR_WIDTH: usize = 20;

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a table with the rounded style
pub fn print_table<I, T>(rows: I)
where
    I: IntoIterator<Item = T>,
    T: tabled::Tabled,
{
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}

/// Print a section heading
pub fn print_heading(title: &str) {
    println!("\n{}", title.bold());
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Fixed-width bar like `[########            ]`
pub fn usage_bar(usage: f64) -> String {
    let filled = ((usage.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), " ".repeat(BAR_WIDTH - filled))
}

/// Bar colored by label
pub fn color_bar(usage: f64, label: CoreLabel) -> String {
    paint(&usage_bar(usage), label)
}

/// Label name colored red / yellow / green
pub fn color_label(label: CoreLabel) -> String {
    paint(label.as_str(), label)
}

fn paint(text: &str, label: CoreLabel) -> String {
    match label {
        CoreLabel::Hot => text.red().bold().to_string(),
        CoreLabel::Warm => text.yellow().to_string(),
        CoreLabel::Cold => text.green().to_string(),
    }
}

/// Percentage with one decimal
pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

/// Compact core list, `-` when empty
pub fn format_cores(cores: &CoreSet) -> String {
    if cores.is_empty() {
        "-".to_string()
    } else {
        format_cpu_list(cores)
    }
}

/// Command that applies a destination by hand
pub fn manual_command(pid: i32, cores: &CoreSet) -> String {
    format!("sudo taskset -pc {} {}", format_cpu_list(cores), pid)
}

/// Shorten long process names to keep tables narrow
pub fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        name.to_string()
    } else {
        let kept: String = name.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_bar() {
        assert_eq!(usage_bar(0.0), format!("[{}]", " ".repeat(20)));
        assert_eq!(usage_bar(100.0), format!("[{}]", "#".repeat(20)));
        assert_eq!(usage_bar(50.0).matches('#').count(), 10);
        assert_eq!(usage_bar(150.0).matches('#').count(), 20);
    }

    #[test]
    fn test_manual_command() {
        assert_eq!(
            manual_command(1234, &CoreSet::from([2, 3, 4, 7])),
            "sudo taskset -pc 2-4,7 1234"
        );
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_percent(12.345), "12.3%");
        assert_eq!(format_cores(&CoreSet::new()), "-");
        assert_eq!(truncate_name("short", 10), "short");
        assert_eq!(truncate_name("a-very-long-process-name", 8), "a-very-…");
    }
}
