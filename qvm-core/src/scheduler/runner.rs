//! Per-job timer tasks that fire snapshot commands.

use super::{
    CronSchedule, FireOutcome, JobStore, ScheduledSnapshotJob, DEFAULT_DAY, DEFAULT_INTERVAL,
};
use crate::command::{CommandExecutor, CommandRequest};
use crate::error::{QvmError, Result};
use crate::observability::health::{HealthChecker, HealthStatus};
use crate::observability::{metrics, SUBSYSTEM_SCHEDULER};
use crate::xml;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Registers recurring snapshot jobs and runs one timer task per job.
///
/// Firing is fire-and-forget: each outcome is logged and counted, and a
/// failed snapshot is not retried.
#[derive(Clone)]
pub struct SnapshotScheduler {
    executor: CommandExecutor,
    store: Arc<dyn JobStore>,
    jobs: Arc<RwLock<Vec<ScheduledSnapshotJob>>>,
    timers: Arc<Mutex<JoinSet<()>>>,
    shutdown: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
    health: Option<HealthChecker>,
}

impl SnapshotScheduler {
    pub fn new(executor: CommandExecutor, store: Arc<dyn JobStore>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            executor,
            store,
            jobs: Arc::new(RwLock::new(Vec::new())),
            timers: Arc::new(Mutex::new(JoinSet::new())),
            shutdown,
            stopped: Arc::new(AtomicBool::new(false)),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    /// Load persisted jobs and start their timers. Returns how many started.
    ///
    /// Jobs whose schedule no longer parses are skipped with a warning.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize> {
        let stored = self.store.load().await?;
        let mut started = 0;
        for job in stored {
            match job.schedule() {
                Ok(schedule) => {
                    self.jobs.write().await.push(job.clone());
                    self.spawn_timer(job, schedule).await;
                    started += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Skipping stored job with invalid schedule")
                }
            }
        }
        info!(jobs = started, "Restored snapshot schedules");
        Ok(started)
    }

    /// Register a recurring snapshot of `vm_name`.
    ///
    /// The cron fields and names are validated; the VM's existence is not.
    #[instrument(skip(self), fields(vm = %vm_name, snapshot = %snapshot_name))]
    pub async fn register(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        day: Option<&str>,
        interval: Option<&str>,
    ) -> Result<ScheduledSnapshotJob> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QvmError::InvalidJob { reason: "scheduler is shut down".to_string() });
        }
        if vm_name.trim().is_empty() {
            return Err(QvmError::InvalidJob { reason: "vm_name is required".to_string() });
        }
        xml::validate_name("Snapshot", snapshot_name)
            .map_err(|reason| QvmError::InvalidJob { reason })?;

        let day = day.unwrap_or(DEFAULT_DAY);
        let interval = interval.unwrap_or(DEFAULT_INTERVAL);
        let schedule = CronSchedule::from_fields(day, interval)?;

        let job = ScheduledSnapshotJob {
            id: uuid::Uuid::new_v4().to_string(),
            vm_name: vm_name.to_string(),
            snapshot_name: snapshot_name.to_string(),
            day: day.to_string(),
            interval: interval.to_string(),
            created_at: Utc::now(),
        };

        {
            let mut jobs = self.jobs.write().await;
            jobs.push(job.clone());
            if let Err(e) = self.store.save(&jobs).await {
                jobs.pop();
                let message = format!("failed to persist schedules: {}", e);
                self.report(HealthStatus::Degraded, Some(message)).await;
                return Err(e);
            }
        }
        self.report(HealthStatus::Healthy, None).await;

        info!(job_id = %job.id, cron = %schedule.expression(), "Snapshot schedule registered");
        self.spawn_timer(job.clone(), schedule).await;
        Ok(job)
    }

    /// All registered jobs, in registration order.
    pub async fn jobs(&self) -> Vec<ScheduledSnapshotJob> {
        self.jobs.read().await.clone()
    }

    /// Number of running timer tasks.
    pub async fn active_timers(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Fire `job` once, as its timer would.
    pub async fn fire(&self, job: &ScheduledSnapshotJob) -> FireOutcome {
        fire(&self.executor, job).await
    }

    /// Stop every timer task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        let mut timers = self.timers.lock().await;
        while timers.join_next().await.is_some() {}
        info!("Snapshot scheduler stopped");
    }

    async fn spawn_timer(&self, job: ScheduledSnapshotJob, schedule: CronSchedule) {
        let executor = self.executor.clone();
        let mut shutdown = self.shutdown.subscribe();

        self.timers.lock().await.spawn(async move {
            let clock = TimerClock::start();
            let mut last_fire = None;
            loop {
                let now = clock.now();
                let from = match last_fire {
                    Some(last) if last > now => last,
                    _ => now,
                };
                let Some(next) = schedule.next_after(from) else {
                    debug!(job_id = %job.id, "Schedule has no further triggers");
                    break;
                };

                tokio::select! {
                    _ = tokio::time::sleep_until(clock.instant_at(next)) => {
                        last_fire = Some(next);
                        fire(&executor, &job).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn report(&self, status: HealthStatus, message: Option<String>) {
        if let Some(health) = &self.health {
            health.update_subsystem(SUBSYSTEM_SCHEDULER, status, message).await;
        }
    }
}

/// Wall-clock time as seen through the tokio clock.
///
/// Anchored once per timer so triggers are computed in UTC while sleeps run
/// on tokio's monotonic clock.
struct TimerClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl TimerClock {
    fn start() -> Self {
        Self { wall: Utc::now(), mono: Instant::now() }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        self.mono + (at - self.wall).to_std().unwrap_or_default()
    }
}

async fn fire(executor: &CommandExecutor, job: &ScheduledSnapshotJob) -> FireOutcome {
    let request = CommandRequest::CreateSnapshot {
        name: job.vm_name.clone(),
        snapshot: job.snapshot_name.clone(),
    };
    let outcome = match executor.execute(request).await {
        Ok(_) => {
            info!(
                job_id = %job.id,
                vm = %job.vm_name,
                snapshot = %job.snapshot_name,
                "Scheduled snapshot taken"
            );
            FireOutcome::Succeeded
        }
        Err(e) => {
            warn!(
                job_id = %job.id,
                vm = %job.vm_name,
                snapshot = %job.snapshot_name,
                kind = e.kind(),
                error = %e,
                "Scheduled snapshot failed"
            );
            FireOutcome::Failed
        }
    };
    metrics::record_job_fired(outcome.as_str());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MemoryHypervisor;
    use crate::scheduler::MemoryJobStore;
    use crate::xml::DomainTemplate;

    fn scheduler(hv: &MemoryHypervisor, store: Arc<MemoryJobStore>) -> SnapshotScheduler {
        let executor = CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"));
        SnapshotScheduler::new(executor, store)
    }

    #[tokio::test]
    async fn test_register_persists_and_starts_timer() {
        let hv = MemoryHypervisor::new();
        let store = Arc::new(MemoryJobStore::new());
        let sched = scheduler(&hv, store.clone());

        let job = sched.register("web", "nightly", None, None).await.unwrap();
        assert_eq!(job.day, "*");
        assert_eq!(job.interval, "*/1");
        assert_eq!(job.cron_expression(), "*/1 * * * *");
        assert_eq!(store.load().await.unwrap(), vec![job.clone()]);
        assert_eq!(sched.jobs().await, vec![job]);
        assert_eq!(sched.active_timers().await, 1);

        sched.shutdown().await;
        assert_eq!(sched.active_timers().await, 0);
        assert!(sched.register("web", "again", None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_register_validates_without_touching_hypervisor() {
        let hv = MemoryHypervisor::new();
        let sched = scheduler(&hv, Arc::new(MemoryJobStore::new()));

        let result = sched.register("", "s", None, None).await;
        assert!(matches!(result, Err(QvmError::InvalidJob { .. })));
        let result = sched.register("web", "", None, None).await;
        assert!(matches!(result, Err(QvmError::InvalidJob { .. })));
        assert!(matches!(
            sched.register("web", "s", Some("1 2"), None).await,
            Err(QvmError::InvalidSchedule { .. })
        ));
        // A VM that does not exist yet is accepted.
        assert!(sched.register("not-yet", "s", Some("1"), Some("30")).await.is_ok());
        assert_eq!(hv.calls().open_attempts, 0);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_starts_stored_jobs() {
        let hv = MemoryHypervisor::new();
        let mut bad = ScheduledSnapshotJob {
            id: "1".into(),
            vm_name: "web".into(),
            snapshot_name: "s".into(),
            day: "*".into(),
            interval: "*/5".into(),
            created_at: Utc::now(),
        };
        let good = bad.clone();
        bad.id = "2".into();
        bad.interval = "nope".into();

        let sched = scheduler(&hv, Arc::new(MemoryJobStore::with_jobs(vec![good.clone(), bad])));
        assert_eq!(sched.restore().await.unwrap(), 1);
        assert_eq!(sched.jobs().await, vec![good]);
        assert_eq!(sched.active_timers().await, 1);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_fire_goes_through_executor() {
        let hv = MemoryHypervisor::new();
        hv.seed_domain("<domain><name>web</name><memory>1024</memory></domain>", true).unwrap();
        let sched = scheduler(&hv, Arc::new(MemoryJobStore::new()));
        let job = sched.register("web", "hourly", None, Some("0")).await.unwrap();

        assert_eq!(sched.fire(&job).await, FireOutcome::Succeeded);
        assert_eq!(hv.snapshot_names("web"), vec!["hourly"]);
        // Same name again: the hypervisor rejects it and the job is not retried.
        assert_eq!(sched.fire(&job).await, FireOutcome::Failed);
        assert_eq!(hv.snapshot_names("web"), vec!["hourly"]);
        sched.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_on_each_trigger() {
        let hv = MemoryHypervisor::new();
        hv.seed_domain("<domain><name>web</name><memory>1024</memory></domain>", true).unwrap();
        let sched = scheduler(&hv, Arc::new(MemoryJobStore::new()));
        sched.register("web", "minutely", None, None).await.unwrap();
        assert_eq!(hv.calls().opens, 0);

        // Two minute boundaries always fall inside 125 seconds, three at most.
        tokio::time::sleep(std::time::Duration::from_secs(125)).await;
        sched.shutdown().await;

        let opens = hv.calls().opens;
        assert!((2..=3).contains(&opens), "fired {} times", opens);
        // The first trigger took the snapshot; later ones hit the duplicate name.
        assert_eq!(hv.snapshot_names("web"), vec!["minutely"]);
    }

    #[test]
    fn test_timer_clock_maps_wall_time_to_instants() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let clock = TimerClock::start();
            let target = clock.wall + chrono::Duration::seconds(90);
            assert_eq!(clock.instant_at(target) - clock.mono, std::time::Duration::from_secs(90));
            // Past triggers map to now.
            assert_eq!(clock.instant_at(clock.wall - chrono::Duration::seconds(5)), clock.mono);

            tokio::time::advance(std::time::Duration::from_secs(30)).await;
            assert_eq!(clock.now() - clock.wall, chrono::Duration::seconds(30));
        });
    }
}
