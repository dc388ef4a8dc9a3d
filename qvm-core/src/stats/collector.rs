//! Background utilization sweep with a cache of the latest samples.

use super::UtilizationSampler;
use crate::command::{CommandExecutor, CommandOutput, CommandRequest};
use crate::observability::health::{HealthChecker, HealthStatus};
use crate::observability::{metrics, SUBSYSTEM_STATS};
use crate::types::{StatsSample, VmState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Periodically samples every running VM and caches the results.
///
/// Request handlers read the cache and never wait for a sample.
#[derive(Clone)]
pub struct StatsCollector {
    executor: CommandExecutor,
    sampler: UtilizationSampler,
    interval_secs: u64,
    period: Duration,
    cache: Arc<RwLock<HashMap<String, StatsSample>>>,
    health: Option<HealthChecker>,
}

impl StatsCollector {
    /// `interval_secs` is the wait inside each sample; `period` the time between sweeps.
    pub fn new(executor: CommandExecutor, interval_secs: u64, period: Duration) -> Self {
        Self {
            sampler: UtilizationSampler::new(executor.clone()),
            executor,
            interval_secs,
            period,
            cache: Arc::new(RwLock::new(HashMap::new())),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    /// Latest published sample of `vm`.
    pub async fn latest(&self, vm: &str) -> Option<StatsSample> {
        self.cache.read().await.get(vm).cloned()
    }

    /// Latest published samples of all VMs, ordered by name.
    pub async fn all(&self) -> Vec<StatsSample> {
        let mut samples: Vec<_> = self.cache.read().await.values().cloned().collect();
        samples.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        samples
    }

    /// Sample every running VM once, concurrently, and publish the results.
    ///
    /// Returns the number of samples published.
    pub async fn sweep(&self) -> usize {
        let vms = match self.executor.execute(CommandRequest::ListVms).await {
            Ok(CommandOutput::Vms { vms }) => vms,
            Ok(_) => return 0,
            Err(e) => {
                warn!(error = %e, "Stats sweep could not list VMs");
                self.report(HealthStatus::Degraded, Some(e.to_string())).await;
                return 0;
            }
        };

        let mut tasks = JoinSet::new();
        for vm in vms.iter().filter(|vm| vm.state == VmState::Running) {
            let sampler = self.sampler.clone();
            let name = vm.name.clone();
            let interval = self.interval_secs;
            tasks.spawn(async move { (name.clone(), sampler.sample(&name, interval).await) });
        }

        let mut fresh = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(sample))) => {
                    metrics::set_vm_utilization(
                        &sample.vm_name,
                        sample.cpu_usage_percent,
                        sample.memory_used_mb,
                    );
                    fresh.insert(sample.vm_name.clone(), sample);
                }
                Ok((name, Err(e))) => debug!(vm = %name, error = %e, "Skipping VM in stats sweep"),
                Err(e) => warn!(error = %e, "Stats sample task failed"),
            }
        }

        let published = fresh.len();
        {
            let mut cache = self.cache.write().await;
            // Drop VMs that no longer exist; keep stale samples of stopped ones.
            cache.retain(|name, _| vms.iter().any(|vm| &vm.name == name));
            cache.extend(fresh);
        }
        self.report(HealthStatus::Healthy, None).await;
        debug!(published, "Stats sweep finished");
        published
    }

    /// Run sweeps every period until `shutdown` fires.
    pub fn spawn(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            info!(
                period_secs = collector.period.as_secs(),
                interval_secs = collector.interval_secs,
                "Stats collector started"
            );
            let mut ticker = tokio::time::interval(collector.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => break,
                }
                tokio::select! {
                    _ = collector.sweep() => {}
                    _ = shutdown.recv() => break,
                }
            }
            info!("Stats collector stopped");
        })
    }

    async fn report(&self, status: HealthStatus, message: Option<String>) {
        if let Some(health) = &self.health {
            health.update_subsystem(SUBSYSTEM_STATS, status, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MemoryHypervisor;
    use crate::xml::DomainTemplate;

    fn seeded() -> MemoryHypervisor {
        let hv = MemoryHypervisor::new();
        for (name, running) in [("alpha", true), ("beta", true), ("gamma", false)] {
            let xml =
                format!("<domain><name>{}</name><memory unit='MiB'>256</memory></domain>", name);
            hv.seed_domain(&xml, running).unwrap();
        }
        hv
    }

    #[tokio::test]
    async fn test_sweep_samples_running_vms_only() {
        let hv = seeded();
        hv.push_cpu_readings("alpha", [0, 500_000_000]);
        hv.push_cpu_readings("beta", [0, 100_000_000]);
        hv.set_memory_rss_kib("alpha", 4096);

        let executor = CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"));
        let collector = StatsCollector::new(executor, 1, Duration::from_secs(300));

        assert_eq!(collector.sweep().await, 2);

        let alpha = collector.latest("alpha").await.unwrap();
        assert_eq!(alpha.cpu_usage_percent, 50.0);
        assert_eq!(alpha.memory_used_mb, 4.0);
        assert_eq!(alpha.sampled_at_interval_seconds, 1);
        assert_eq!(collector.latest("beta").await.unwrap().cpu_usage_percent, 10.0);
        assert!(collector.latest("gamma").await.is_none());

        let names: Vec<_> = collector.all().await.into_iter().map(|s| s.vm_name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_sweep_survives_outage() {
        let hv = seeded();
        hv.set_reachable(false);
        let health = HealthChecker::with_subsystems(&[SUBSYSTEM_STATS]).await;
        let executor = CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"));
        let collector =
            StatsCollector::new(executor, 1, Duration::from_secs(300)).with_health(health.clone());

        assert_eq!(collector.sweep().await, 0);
        assert_eq!(health.report().await.status, HealthStatus::Degraded);
    }
}
