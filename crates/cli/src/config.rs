//! Configuration management for the CLI
//!
//! Settings come from an optional TOML file, overridden by `TIDYCPU_*`
//! environment variables, overridden by command line flags.

use crate::commands::ScanArgs;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidycpu_lib::collector::InventoryConfig;
use tidycpu_lib::{PipelineConfig, RunMode, Thresholds};

/// CLI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Gap between the two counter reads
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Processes shown and considered for moves
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Busiest processes searched for the top N
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,

    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: f64,

    #[serde(default = "default_warm_threshold")]
    pub warm_threshold: f64,

    #[serde(default = "default_proc_path")]
    pub proc_path: PathBuf,

    #[serde(default = "default_sys_path")]
    pub sys_path: PathBuf,

    /// Move every thread of a process, not just the main one
    #[serde(default)]
    pub all_threads: bool,

    /// Seconds between refreshes in watch mode
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_sample_interval_ms() -> u64 {
    500
}

fn default_top_n() -> usize {
    5
}

fn default_candidate_pool() -> usize {
    20
}

fn default_hot_threshold() -> f64 {
    80.0
}

fn default_warm_threshold() -> f64 {
    40.0
}

fn default_proc_path() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_sys_path() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_refresh_secs() -> u64 {
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            top_n: default_top_n(),
            candidate_pool: default_candidate_pool(),
            hot_threshold: default_hot_threshold(),
            warm_threshold: default_warm_threshold(),
            proc_path: default_proc_path(),
            sys_path: default_sys_path(),
            all_threads: false,
            refresh_secs: default_refresh_secs(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (must exist) or the default location (optional)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(default) = Self::config_path() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }

        let settings: Settings = builder
            .add_source(config::Environment::with_prefix("TIDYCPU").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Default configuration file path
    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("tidycpu").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.warm_threshold)
            || !(0.0..=100.0).contains(&self.hot_threshold)
        {
            bail!("thresholds must be between 0 and 100");
        }
        if self.warm_threshold >= self.hot_threshold {
            bail!(
                "warm_threshold ({}) must be below hot_threshold ({})",
                self.warm_threshold,
                self.hot_threshold
            );
        }
        if self.sample_interval_ms == 0 {
            bail!("sample_interval_ms must be positive");
        }
        if self.top_n == 0 {
            bail!("top_n must be positive");
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            hot: self.hot_threshold,
            warm: self.warm_threshold,
        }
    }

    /// Pipeline configuration with command line overrides applied
    pub fn pipeline_config(&self, args: &ScanArgs, mode: RunMode) -> PipelineConfig {
        let interval_ms = args.interval_ms.unwrap_or(self.sample_interval_ms).max(1);
        PipelineConfig {
            interval: Duration::from_millis(interval_ms),
            thresholds: self.thresholds(),
            inventory: InventoryConfig {
                top_n: args.top.unwrap_or(self.top_n).max(1),
                candidate_pool: self.candidate_pool,
                include_threads: args.threads,
            },
            filter_pid: args.pid,
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.sample_interval_ms, 500);
        assert_eq!(settings.top_n, 5);
        assert_eq!(settings.candidate_pool, 20);
        assert_eq!(settings.thresholds(), Thresholds::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tidycpu.toml");
        std::fs::write(&path, "top_n = 8\nhot_threshold = 90.0\nsys_path = \"/host/sys\"\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.top_n, 8);
        assert_eq!(settings.hot_threshold, 90.0);
        assert_eq!(settings.warm_threshold, 40.0);
        assert_eq!(settings.sys_path, PathBuf::from("/host/sys"));
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(Settings::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let settings = Settings {
            hot_threshold: 30.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_flags_override_settings() {
        let settings = Settings::default();
        let args = ScanArgs {
            top: Some(3),
            pid: Some(42),
            threads: true,
            interval_ms: Some(100),
        };

        let config = settings.pipeline_config(&args, RunMode::Apply);
        assert_eq!(config.interval, Duration::from_millis(100));
        assert_eq!(config.inventory.top_n, 3);
        assert!(config.inventory.include_threads);
        assert_eq!(config.filter_pid, Some(42));
        assert_eq!(config.mode, RunMode::Apply);

        let config = settings.pipeline_config(&ScanArgs::default(), RunMode::Plan);
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.inventory.top_n, 5);
    }
}
