//! Subsystem health tracking, reported by the `health` command.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub subsystems: Vec<SubsystemHealth>,
}

/// Subsystem health status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Health checker that tracks subsystem status.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker with the given subsystems registered as healthy.
    pub async fn with_subsystems(names: &[&str]) -> Self {
        let checker = Self::new();
        for name in names {
            checker.register_subsystem(name).await;
        }
        checker
    }

    /// Register a subsystem for health tracking. Re-registering is a no-op.
    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if !subsystems.iter().any(|s| s.name == name) {
            subsystems.push(SubsystemHealth {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                message: None,
            });
        }
    }

    /// Update subsystem health status. Unknown subsystems are ignored.
    pub async fn update_subsystem(
        &self,
        name: &str,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    pub async fn mark_healthy(&self, name: &str) {
        self.update_subsystem(name, HealthStatus::Healthy, None).await;
    }

    pub async fn mark_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update_subsystem(name, HealthStatus::Unhealthy, Some(message.into())).await;
    }

    pub async fn subsystem(&self, name: &str) -> Option<SubsystemHealth> {
        self.subsystems.read().await.iter().find(|s| s.name == name).cloned()
    }

    /// Get overall health status.
    ///
    /// Returns:
    /// - Healthy: All subsystems healthy
    /// - Degraded: At least one subsystem degraded, none unhealthy
    /// - Unhealthy: At least one subsystem unhealthy
    pub async fn report(&self) -> HealthReport {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, version: env!("CARGO_PKG_VERSION").to_string(), subsystems }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_checker() {
        let checker = HealthChecker::with_subsystems(&["hypervisor", "transport"]).await;
        checker.register_subsystem("hypervisor").await;

        let health = checker.report().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.subsystems.len(), 2);

        checker
            .update_subsystem("transport", HealthStatus::Degraded, Some("slow".to_string()))
            .await;
        assert_eq!(checker.report().await.status, HealthStatus::Degraded);

        checker.mark_unhealthy("hypervisor", "connection refused").await;
        let health = checker.report().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(
            checker.subsystem("hypervisor").await.and_then(|s| s.message),
            Some("connection refused".to_string())
        );

        checker.mark_healthy("hypervisor").await;
        checker.mark_healthy("transport").await;
        assert_eq!(checker.report().await.status, HealthStatus::Healthy);
    }
}
