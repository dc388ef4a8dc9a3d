//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Command metrics
    describe_counter!(
        "qvm_commands_total",
        "Total number of executed commands (by command, outcome)"
    );
    describe_histogram!("qvm_command_duration_seconds", "Command execution duration (by command)");

    // Transport metrics
    describe_counter!("qvm_transport_connections_total", "Total number of accepted connections");
    describe_counter!(
        "qvm_transport_bad_requests_total",
        "Total number of malformed or oversized requests"
    );

    // Scheduler metrics
    describe_counter!(
        "qvm_snapshot_jobs_fired_total",
        "Total number of scheduled snapshot firings (by outcome)"
    );

    // Utilization gauges
    describe_gauge!("qvm_vm_cpu_percent", "Latest sampled CPU usage (by vm)");
    describe_gauge!("qvm_vm_memory_used_mb", "Latest sampled resident memory in MB (by vm)");
}

pub fn record_command(command: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!("qvm_commands_total", "command" => command, "outcome" => outcome).increment(1);
    histogram!("qvm_command_duration_seconds", "command" => command).record(duration_secs);
}

pub fn record_connection() {
    counter!("qvm_transport_connections_total").increment(1);
}

pub fn record_bad_request() {
    counter!("qvm_transport_bad_requests_total").increment(1);
}

pub fn record_job_fired(outcome: &'static str) {
    counter!("qvm_snapshot_jobs_fired_total", "outcome" => outcome).increment(1);
}

pub fn set_vm_utilization(vm: &str, cpu_percent: f64, memory_used_mb: f64) {
    gauge!("qvm_vm_cpu_percent", "vm" => vm.to_string()).set(cpu_percent);
    gauge!("qvm_vm_memory_used_mb", "vm" => vm.to_string()).set(memory_used_mb);
}
