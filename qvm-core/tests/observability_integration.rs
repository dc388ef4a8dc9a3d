//! Integration tests for observability infrastructure.
//!
//! These tests validate that health tracking and metrics recording work
//! end-to-end through the executor, scheduler and collector. They do NOT
//! require external services: with no recorder installed, metric macros are
//! no-ops, so these tests only prove the recording paths never fail.

use qvm_core::command::{CommandExecutor, CommandRequest};
use qvm_core::hypervisor::MemoryHypervisor;
use qvm_core::observability::health::{HealthChecker, HealthReport, HealthStatus};
use qvm_core::observability::metrics::*;
use qvm_core::observability::{
    SUBSYSTEM_HYPERVISOR, SUBSYSTEM_SCHEDULER, SUBSYSTEM_STATS, SUBSYSTEM_TRANSPORT,
};
use qvm_core::scheduler::{JobStore, MemoryJobStore, ScheduledSnapshotJob, SnapshotScheduler};
use qvm_core::stats::StatsCollector;
use qvm_core::xml::DomainTemplate;
use qvm_core::QvmError;
use std::sync::Arc;
use std::time::Duration;

const ALL: [&str; 4] =
    [SUBSYSTEM_HYPERVISOR, SUBSYSTEM_TRANSPORT, SUBSYSTEM_SCHEDULER, SUBSYSTEM_STATS];

/// Test that the health checker correctly tracks subsystem status.
///
/// Validates:
/// - Registration of subsystems
/// - Status updates propagate correctly
/// - Overall health status is computed correctly (healthy/degraded/unhealthy)
#[tokio::test]
async fn test_health_checker_lifecycle() {
    let checker = HealthChecker::new();

    // Initially no subsystems, should be healthy
    let report = checker.report().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.subsystems.is_empty());

    for name in ALL {
        checker.register_subsystem(name).await;
    }
    // Re-registering does not duplicate
    checker.register_subsystem(SUBSYSTEM_STATS).await;
    assert_eq!(checker.report().await.subsystems.len(), 4);

    checker
        .update_subsystem(SUBSYSTEM_STATS, HealthStatus::Degraded, Some("slow sweep".into()))
        .await;
    assert_eq!(checker.report().await.status, HealthStatus::Degraded);

    checker.mark_unhealthy(SUBSYSTEM_HYPERVISOR, "unreachable").await;
    assert_eq!(checker.report().await.status, HealthStatus::Unhealthy);

    checker.mark_healthy(SUBSYSTEM_HYPERVISOR).await;
    checker.mark_healthy(SUBSYSTEM_STATS).await;
    let report = checker.report().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.subsystems.iter().all(|s| s.message.is_none()));
}

/// Test that the health report serializes for the `health` command.
#[tokio::test]
async fn test_health_report_serialization() {
    let checker = HealthChecker::with_subsystems(&[SUBSYSTEM_TRANSPORT]).await;
    checker.mark_unhealthy(SUBSYSTEM_TRANSPORT, "accept failed").await;

    let json = serde_json::to_value(checker.report().await).unwrap();
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["subsystems"][0]["name"], "transport");
    assert_eq!(json["subsystems"][0]["message"], "accept failed");

    let back: HealthReport = serde_json::from_value(json).unwrap();
    assert_eq!(back.status, HealthStatus::Unhealthy);
}

/// The executor reports hypervisor reachability as it opens connections.
#[tokio::test]
async fn test_executor_tracks_hypervisor_health() {
    let hv = MemoryHypervisor::new();
    let health = HealthChecker::with_subsystems(&ALL).await;
    let executor = CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"))
        .with_health(health.clone());

    hv.set_reachable(false);
    let _ = executor.execute(CommandRequest::ListVms).await;
    let subsystem = health.subsystem(SUBSYSTEM_HYPERVISOR).await.unwrap();
    assert_eq!(subsystem.status, HealthStatus::Unhealthy);
    assert!(subsystem.message.is_some());

    hv.set_reachable(true);
    let _ = executor.execute(CommandRequest::ListVms).await;
    assert_eq!(health.subsystem(SUBSYSTEM_HYPERVISOR).await.unwrap().status, HealthStatus::Healthy);
}

/// A store that cannot persist degrades the scheduler subsystem.
struct ReadOnlyStore;

#[async_trait::async_trait]
impl JobStore for ReadOnlyStore {
    async fn load(&self) -> qvm_core::Result<Vec<ScheduledSnapshotJob>> {
        Ok(Vec::new())
    }

    async fn save(&self, _jobs: &[ScheduledSnapshotJob]) -> qvm_core::Result<()> {
        Err(QvmError::Internal("read-only store".to_string()))
    }
}

#[tokio::test]
async fn test_scheduler_persistence_failure_degrades_health() {
    let health = HealthChecker::with_subsystems(&ALL).await;
    let executor =
        CommandExecutor::new(Arc::new(MemoryHypervisor::new()), DomainTemplate::new("/images"));

    let failing = SnapshotScheduler::new(executor.clone(), Arc::new(ReadOnlyStore))
        .with_health(health.clone());
    assert!(failing.register("web", "s", None, None).await.is_err());
    assert!(failing.jobs().await.is_empty());
    assert_eq!(health.subsystem(SUBSYSTEM_SCHEDULER).await.unwrap().status, HealthStatus::Degraded);

    let working = SnapshotScheduler::new(executor, Arc::new(MemoryJobStore::new()))
        .with_health(health.clone());
    working.register("web", "s", None, None).await.unwrap();
    assert_eq!(health.subsystem(SUBSYSTEM_SCHEDULER).await.unwrap().status, HealthStatus::Healthy);

    failing.shutdown().await;
    working.shutdown().await;
}

/// A failed sweep degrades the stats subsystem; a good one restores it.
#[tokio::test]
async fn test_collector_tracks_stats_health() {
    let hv = MemoryHypervisor::new();
    let health = HealthChecker::with_subsystems(&ALL).await;
    let executor = CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"));
    let collector =
        StatsCollector::new(executor, 1, Duration::from_secs(60)).with_health(health.clone());

    hv.set_reachable(false);
    assert_eq!(collector.sweep().await, 0);
    assert_eq!(health.subsystem(SUBSYSTEM_STATS).await.unwrap().status, HealthStatus::Degraded);

    hv.set_reachable(true);
    assert_eq!(collector.sweep().await, 0);
    assert_eq!(health.subsystem(SUBSYSTEM_STATS).await.unwrap().status, HealthStatus::Healthy);
}

/// Metric helpers must be callable before and after registration, from
/// many tasks at once.
#[tokio::test]
async fn test_metrics_concurrent_recording() {
    register_core_metrics();

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            record_connection();
            record_command("list_vms", "ok", 0.01 * i as f64);
            record_job_fired(if i % 2 == 0 { "succeeded" } else { "failed" });
            set_vm_utilization(&format!("vm-{}", i), 12.5, 256.0);
            if i % 3 == 0 {
                record_bad_request();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}
