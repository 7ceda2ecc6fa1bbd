//! Per-core utilization sampling
//!
//! `/proc/stat` counters are cumulative since boot, so a single read says
//! nothing about current load. The sampler reads twice, a fixed interval
//! apart, and derives utilization from the deltas.

use super::{async_trait, CounterSource};
use crate::error::{Result, TidyError};
use crate::models::{CoreLabel, CoreSample, CoreStat, GapReason, SampleGap, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// Counter source backed by `/proc/stat`
pub struct ProcStatSource {
    proc_path: PathBuf,
}

impl ProcStatSource {
    pub fn new() -> Self {
        Self::with_proc_path("/proc")
    }

    /// Create source with custom proc path (for testing)
    pub fn with_proc_path(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
        }
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterSource for ProcStatSource {
    async fn read_counters(&self) -> Result<Vec<CoreSample>> {
        let path = self.proc_path.join("stat");
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| TidyError::PrimitiveUnavailable {
                primitive: "kernel time accounting (/proc/stat)",
                reason: format!("{}: {}", path.display(), e),
            })?;
        parse_proc_stat(&content)
    }
}

/// Parse the `cpuN` lines of `/proc/stat`.
///
/// Fields are `user nice system idle iowait irq softirq steal [guest guest_nice]`.
/// Guest time is already folded into user/nice, so only the first eight
/// count towards the total. Idle time is `idle + iowait`.
pub fn parse_proc_stat(content: &str) -> Result<Vec<CoreSample>> {
    let mut samples = Vec::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else {
            continue;
        };
        let Some(core_id) = label.strip_prefix("cpu").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };

        let parsed: std::result::Result<Vec<u64>, _> =
            parts.take(8).map(str::parse::<u64>).collect();
        let values = match parsed {
            Ok(values) => values,
            Err(e) => {
                debug!(core = core_id, error = %e, "Skipping malformed /proc/stat line");
                continue;
            }
        };
        if values.len() < 4 {
            debug!(core = core_id, fields = values.len(), "Skipping short /proc/stat line");
            continue;
        }

        let idle = values[3].checked_add(values.get(4).copied().unwrap_or(0));
        let total = values
            .iter()
            .try_fold(0u64, |acc, v| acc.checked_add(*v));
        let (Some(idle), Some(total)) = (idle, total) else {
            debug!(core = core_id, "Skipping overflowing /proc/stat line");
            continue;
        };
        samples.push(CoreSample {
            core_id,
            busy: total - idle,
            idle,
            total,
        });
    }

    if samples.is_empty() {
        return Err(TidyError::parse("/proc/stat", "no per-cpu counter lines"));
    }
    Ok(samples)
}

/// Utilization of every core over one sampling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub stats: Vec<CoreStat>,
    pub gaps: Vec<SampleGap>,
    pub interval_ms: u64,
    pub taken_at: i64,
}

impl UsageReport {
    pub fn count(&self, label: CoreLabel) -> usize {
        self.stats.iter().filter(|s| s.label == label).count()
    }
}

/// Derive core stats from two snapshots.
///
/// Deltas saturate at zero: individual fields are not guaranteed to be
/// monotonic. A core whose total did not advance is excluded, as is any
/// core present in only one snapshot.
pub fn compute_stats(
    before: &[CoreSample],
    after: &[CoreSample],
    thresholds: &Thresholds,
) -> (Vec<CoreStat>, Vec<SampleGap>) {
    let first: BTreeMap<u32, &CoreSample> = before.iter().map(|s| (s.core_id, s)).collect();
    let second: BTreeMap<u32, &CoreSample> = after.iter().map(|s| (s.core_id, s)).collect();
    let ids: BTreeSet<u32> = first.keys().chain(second.keys()).copied().collect();

    let mut stats = Vec::with_capacity(ids.len());
    let mut gaps = Vec::new();

    for core_id in ids {
        let (b, a) = match (first.get(&core_id), second.get(&core_id)) {
            (Some(b), Some(a)) => (b, a),
            (Some(_), None) => {
                gaps.push(SampleGap {
                    core_id,
                    reason: GapReason::MissingFromSecond,
                });
                continue;
            }
            (None, Some(_)) => {
                gaps.push(SampleGap {
                    core_id,
                    reason: GapReason::MissingFromFirst,
                });
                continue;
            }
            (None, None) => continue,
        };

        let total_delta = a.total.saturating_sub(b.total);
        if total_delta == 0 {
            gaps.push(SampleGap {
                core_id,
                reason: GapReason::NoElapsedTicks,
            });
            continue;
        }
        let busy_delta = a.busy.saturating_sub(b.busy).min(total_delta);

        let usage = (busy_delta as f64 / total_delta as f64 * 100.0).clamp(0.0, 100.0);
        stats.push(CoreStat {
            core_id,
            usage,
            label: thresholds.classify(usage),
        });
    }

    (stats, gaps)
}

/// Two-snapshot utilization sampler
pub struct UsageSampler {
    source: Arc<dyn CounterSource>,
    thresholds: Thresholds,
}

impl UsageSampler {
    pub fn new(source: Arc<dyn CounterSource>, thresholds: Thresholds) -> Self {
        Self { source, thresholds }
    }

    /// Sample every core over `interval`.
    ///
    /// `core_count` is the number of logical cores the caller expects; a
    /// different count is logged, not rejected.
    pub async fn sample(&self, core_count: usize, interval: Duration) -> Result<UsageReport> {
        let before = self.source.read_counters().await?;
        tokio::time::sleep(interval).await;
        let after = self.source.read_counters().await?;

        let (stats, gaps) = compute_stats(&before, &after, &self.thresholds);

        if stats.len() != core_count {
            warn!(
                expected = core_count,
                sampled = stats.len(),
                gaps = gaps.len(),
                "Sampled core count differs from topology"
            );
        }
        for gap in &gaps {
            debug!(core = gap.core_id, reason = ?gap.reason, "Core dropped from sample");
        }

        Ok(UsageReport {
            stats,
            gaps,
            interval_ms: interval.as_millis() as u64,
            taken_at: chrono::Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sample(core_id: u32, busy: u64, idle: u64) -> CoreSample {
        CoreSample {
            core_id,
            busy,
            idle,
            total: busy + idle,
        }
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "cpu  400 0 200 1000 50 0 10 0 0 0
cpu0 100 0 50 500 25 0 5 0 0 0
cpu1 300 0 150 500 25 0 5 0 0 0
intr 12345 0 0
ctxt 999
";
        let samples = parse_proc_stat(content).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].core_id, 0);
        assert_eq!(samples[0].idle, 525);
        assert_eq!(samples[0].total, 680);
        assert_eq!(samples[0].busy, 155);
        assert_eq!(samples[1].busy, 455);
    }

    #[test]
    fn test_parse_proc_stat_short_kernel_format() {
        // Old kernels only report four fields
        let samples = parse_proc_stat("cpu0 10 0 10 80\n").unwrap();
        assert_eq!(samples[0].total, 100);
        assert_eq!(samples[0].busy, 20);
    }

    #[test]
    fn test_parse_proc_stat_skips_overflowing_line() {
        let content = format!("cpu0 {} 0 {} 0\ncpu1 10 0 10 80\n", u64::MAX, u64::MAX);
        let samples = parse_proc_stat(&content).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].core_id, 1);

        let idle_overflow = format!("cpu0 0 0 0 {} 1\n", u64::MAX);
        assert!(parse_proc_stat(&idle_overflow).is_err());
    }

    #[test]
    fn test_parse_proc_stat_without_cores() {
        assert!(parse_proc_stat("cpu 1 2 3 4\nintr 0\n").is_err());
    }

    #[test]
    fn test_compute_stats_labels() {
        let t = Thresholds::default();
        let before = vec![sample(0, 0, 0), sample(1, 0, 0), sample(2, 0, 0)];
        let after = vec![sample(0, 95, 5), sample(1, 50, 50), sample(2, 5, 95)];

        let (stats, gaps) = compute_stats(&before, &after, &t);
        assert!(gaps.is_empty());
        assert_eq!(stats[0].label, CoreLabel::Hot);
        assert_eq!(stats[1].label, CoreLabel::Warm);
        assert_eq!(stats[2].label, CoreLabel::Cold);
        assert!((stats[0].usage - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_stats_exact_boundaries() {
        let t = Thresholds::default();
        let before = vec![sample(0, 0, 0), sample(1, 0, 0)];
        // 80.0% and 79.999%
        let after = vec![sample(0, 80, 20), sample(1, 79_999, 20_001)];

        let (stats, _) = compute_stats(&before, &after, &t);
        assert_eq!(stats[0].label, CoreLabel::Hot);
        assert_eq!(stats[1].label, CoreLabel::Warm);
    }

    #[test]
    fn test_zero_elapsed_core_excluded() {
        let t = Thresholds::default();
        let before = vec![sample(0, 100, 100), sample(1, 100, 100)];
        let after = vec![sample(0, 100, 100), sample(1, 150, 150)];

        let (stats, gaps) = compute_stats(&before, &after, &t);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].core_id, 1);
        assert_eq!(
            gaps,
            vec![SampleGap {
                core_id: 0,
                reason: GapReason::NoElapsedTicks
            }]
        );
        assert!(stats.iter().all(|s| s.usage.is_finite()));
    }

    #[test]
    fn test_backwards_counters_never_negative() {
        let t = Thresholds::default();
        // total went backwards: excluded
        let before = vec![sample(0, 500, 500), sample(1, 500, 500)];
        // core 1: busy went backwards while total advanced
        let after = vec![
            sample(0, 400, 400),
            CoreSample {
                core_id: 1,
                busy: 450,
                idle: 650,
                total: 1100,
            },
        ];

        let (stats, gaps) = compute_stats(&before, &after, &t);
        assert_eq!(gaps.len(), 1);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].usage, 0.0);
    }

    #[test]
    fn test_hotplug_gap() {
        let t = Thresholds::default();
        let before = vec![sample(0, 0, 0), sample(1, 0, 0)];
        let after = vec![sample(0, 10, 10), sample(2, 10, 10)];

        let (stats, gaps) = compute_stats(&before, &after, &t);
        assert_eq!(stats.len(), 1);
        assert_eq!(
            gaps,
            vec![
                SampleGap {
                    core_id: 1,
                    reason: GapReason::MissingFromSecond
                },
                SampleGap {
                    core_id: 2,
                    reason: GapReason::MissingFromFirst
                },
            ]
        );
    }

    /// Returns scripted snapshots in order
    struct ScriptedCounters {
        snapshots: Mutex<Vec<Vec<CoreSample>>>,
    }

    #[async_trait]
    impl CounterSource for ScriptedCounters {
        async fn read_counters(&self) -> Result<Vec<CoreSample>> {
            let mut snapshots = self.snapshots.lock().unwrap();
            Ok(snapshots.remove(0))
        }
    }

    #[tokio::test]
    async fn test_sampler_reads_twice() {
        let source = Arc::new(ScriptedCounters {
            snapshots: Mutex::new(vec![
                vec![sample(0, 0, 0), sample(1, 0, 0)],
                vec![sample(0, 90, 10), sample(1, 10, 90)],
            ]),
        });
        let sampler = UsageSampler::new(source.clone(), Thresholds::default());

        let report = sampler.sample(2, Duration::from_millis(1)).await.unwrap();
        assert_eq!(report.stats.len(), 2);
        assert_eq!(report.count(CoreLabel::Hot), 1);
        assert_eq!(report.count(CoreLabel::Cold), 1);
        assert_eq!(report.interval_ms, 1);
        assert!(source.snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_proc_stat_is_unavailable() {
        let source = ProcStatSource::with_proc_path("/nonexistent/proc");
        let err = source.read_counters().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
