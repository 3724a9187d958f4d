//! CPU and memory figures derived from engine usage reports.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::engine::{CpuSample, EngineStats};

/// CPU usage between two cumulative samples, in percent of one core.
///
/// `system_usage_ns` counts host time across all cores, so the ratio of
/// deltas is the share of the whole machine; multiplying by the core
/// count rescales it so 100 means one fully busy core. Returns 0 when
/// either delta is not positive.
pub fn cpu_percent(prev: &CpuSample, cur: &CpuSample) -> f64 {
    let cpu_delta = cur.total_usage_ns as f64 - prev.total_usage_ns as f64;
    let system_delta = cur.system_usage_ns as f64 - prev.system_usage_ns as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    let cpus = if cur.online_cpus > 0 { cur.online_cpus } else { prev.online_cpus.max(1) };
    cpu_delta / system_delta * f64::from(cpus) * 100.0
}

/// Working-set memory: usage minus reclaimable page cache.
pub fn memory_usage(stats: &EngineStats) -> u64 {
    stats.memory_usage_bytes.saturating_sub(stats.memory_cache_bytes)
}

/// Remembers the last CPU sample per container.
///
/// Used when the engine report carries no previous sample, so CPU usage
/// is measured between two consecutive status queries instead.
#[derive(Debug, Default)]
pub struct StatsTracker {
    last: Mutex<HashMap<String, CpuSample>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU percent for `container_id`, recording `stats.cpu` for next time.
    ///
    /// The first sample of a container without `precpu` reports 0.
    pub async fn observe(&self, container_id: &str, stats: &EngineStats) -> f64 {
        let mut last = self.last.lock().await;
        let prev = stats
            .precpu
            .or_else(|| last.get(container_id).copied());
        last.insert(container_id.to_string(), stats.cpu);
        prev.map(|p| cpu_percent(&p, &stats.cpu)).unwrap_or(0.0)
    }

    pub async fn forget(&self, container_id: &str) {
        self.last.lock().await.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, system: u64, cpus: u32) -> CpuSample {
        CpuSample {
            total_usage_ns: total,
            system_usage_ns: system,
            online_cpus: cpus,
        }
    }

    #[test]
    fn one_busy_core_is_one_hundred() {
        // 1s of container time over 1s wall on 4 cores (4s host time).
        let pct = cpu_percent(&sample(0, 0, 4), &sample(1_000_000_000, 4_000_000_000, 4));
        assert!((pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_deltas_are_zero() {
        assert_eq!(cpu_percent(&sample(10, 10, 2), &sample(10, 20, 2)), 0.0);
        assert_eq!(cpu_percent(&sample(10, 20, 2), &sample(20, 20, 2)), 0.0);
    }

    #[test]
    fn memory_excludes_cache() {
        let stats = EngineStats {
            memory_usage_bytes: 1000,
            memory_cache_bytes: 300,
            ..Default::default()
        };
        assert_eq!(memory_usage(&stats), 700);
        let stats = EngineStats {
            memory_usage_bytes: 100,
            memory_cache_bytes: 300,
            ..Default::default()
        };
        assert_eq!(memory_usage(&stats), 0);
    }

    #[tokio::test]
    async fn tracker_uses_precpu_then_history() {
        let tracker = StatsTracker::new();
        let first = EngineStats {
            cpu: sample(500_000_000, 4_000_000_000, 4),
            ..Default::default()
        };
        assert_eq!(tracker.observe("c", &first).await, 0.0);

        let second = EngineStats {
            cpu: sample(1_000_000_000, 8_000_000_000, 4),
            ..Default::default()
        };
        assert!((tracker.observe("c", &second).await - 50.0).abs() < 1e-9);

        let with_pre = EngineStats {
            cpu: sample(3_000_000_000, 12_000_000_000, 4),
            precpu: Some(sample(1_000_000_000, 8_000_000_000, 4)),
            ..Default::default()
        };
        assert!((tracker.observe("c", &with_pre).await - 200.0).abs() < 1e-9);

        tracker.forget("c").await;
        assert_eq!(tracker.observe("c", &second).await, 0.0);
    }
}
