//! `qvm stats` and `qvm top`

use crate::client::QvmClient;
use anyhow::Result;
use qvm_core::StatsSample;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct StatsRow {
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "CPU %")]
    cpu: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "INTERVAL")]
    interval: String,
    #[tabled(rename = "SAMPLED")]
    sampled_at: String,
}

fn print_samples(samples: Vec<StatsSample>) {
    let rows: Vec<StatsRow> = samples
        .into_iter()
        .map(|s| StatsRow {
            vm: s.vm_name,
            cpu: format!("{:.1}", s.cpu_usage_percent),
            memory: format!("{:.1} MB", s.memory_used_mb),
            interval: format!("{}s", s.sampled_at_interval_seconds),
            sampled_at: s.sampled_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);
}

/// Measure a VM live over `interval` seconds
pub async fn sample(client: &QvmClient, vm: &str, interval: u64) -> Result<()> {
    println!("Sampling {} for {}s...", vm, interval);
    let stats = client.sample_stats(vm, interval).await?;
    print_samples(vec![stats]);
    Ok(())
}

/// Show the latest background samples
pub async fn top(client: &QvmClient, vm: Option<&str>) -> Result<()> {
    let samples = client.latest_stats(vm).await?;

    if samples.is_empty() {
        println!("No samples collected yet");
        return Ok(());
    }

    print_samples(samples);
    Ok(())
}
