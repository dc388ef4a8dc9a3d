//! `qvm health`

use crate::client::QvmClient;
use anyhow::Result;
use colored::Colorize;
use qvm_core::observability::health::HealthStatus;

fn paint(status: HealthStatus) -> String {
    match status {
        HealthStatus::Healthy => "healthy".green().to_string(),
        HealthStatus::Degraded => "degraded".yellow().to_string(),
        HealthStatus::Unhealthy => "unhealthy".red().bold().to_string(),
    }
}

/// Check daemon health
pub async fn health(client: &QvmClient) -> Result<()> {
    let report = client.health().await?;
    println!("Status:  {}", paint(report.status));
    println!("Version: {}", report.version);

    for subsystem in report.subsystems {
        match subsystem.message {
            Some(message) => {
                println!("  {:<12} {} ({})", subsystem.name, paint(subsystem.status), message)
            }
            None => println!("  {:<12} {}", subsystem.name, paint(subsystem.status)),
        }
    }
    Ok(())
}
