//! Two-point CPU/memory sampling of a single VM.

use crate::command::{CommandError, CommandExecutor};
use crate::types::StatsSample;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, instrument};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// CPU usage over `interval_secs` from two cumulative CPU-time readings.
///
/// A counter that went backwards (domain restarted in between) yields 0.
pub fn cpu_usage_percent(before_ns: u64, after_ns: u64, interval_secs: u64) -> f64 {
    if interval_secs == 0 {
        return 0.0;
    }
    let delta = after_ns.saturating_sub(before_ns) as f64;
    delta / (interval_secs as f64 * NANOS_PER_SEC) * 100.0
}

/// Resident memory in KiB to MB.
pub fn memory_used_mb(rss_kib: u64) -> f64 {
    rss_kib as f64 / 1024.0
}

/// Measures VM utilization through the command executor.
///
/// Each reading opens and closes its own connection; none is held across
/// the wait.
#[derive(Clone)]
pub struct UtilizationSampler {
    executor: CommandExecutor,
}

impl UtilizationSampler {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Sample `vm` over `interval_secs` seconds.
    #[instrument(skip(self), fields(vm = %vm))]
    pub async fn sample(&self, vm: &str, interval_secs: u64) -> Result<StatsSample, CommandError> {
        let max = self.executor.max_sample_interval_secs();
        if interval_secs == 0 || interval_secs > max {
            return Err(CommandError::BadRequest(format!(
                "interval must be between 1 and {} seconds, got {}",
                max, interval_secs
            )));
        }

        let before = self.executor.read_cpu(vm).await?;
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        let after = self.executor.read_usage(vm).await?;

        let cpu = cpu_usage_percent(before.cpu_time_ns, after.cpu_time_ns, interval_secs);
        let sample = StatsSample {
            vm_name: vm.to_string(),
            cpu_usage_percent: cpu,
            memory_used_mb: memory_used_mb(after.rss_kib),
            sampled_at_interval_seconds: interval_secs,
            sampled_at: Utc::now(),
        };
        debug!(cpu = sample.cpu_usage_percent, memory_mb = sample.memory_used_mb, "Sampled VM");
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_usage_percent() {
        assert_eq!(cpu_usage_percent(1_000_000_000, 1_500_000_000, 1), 50.0);
        assert_eq!(cpu_usage_percent(0, 2_000_000_000, 1), 200.0);
        assert_eq!(cpu_usage_percent(0, 6_000_000_000, 60), 10.0);
        assert_eq!(cpu_usage_percent(5, 5, 1), 0.0);
    }

    #[test]
    fn test_counter_reset_clamps_to_zero() {
        assert_eq!(cpu_usage_percent(9_000_000_000, 1_000, 1), 0.0);
    }

    #[test]
    fn test_memory_conversion() {
        assert_eq!(memory_used_mb(2048), 2.0);
        assert_eq!(memory_used_mb(512), 0.5);
    }
}
