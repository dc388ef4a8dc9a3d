//! Snapshot and utilization sample types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named point-in-time state of a domain.
///
/// The hypervisor is authoritative; this is only a view of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    /// Unique within the owning VM only.
    pub name: String,

    pub parent_vm_name: String,

    pub description: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
}

/// CPU and memory utilization of one VM over one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub vm_name: String,

    pub cpu_usage_percent: f64,

    pub memory_used_mb: f64,

    pub sampled_at_interval_seconds: u64,

    /// When the second measurement was taken.
    pub sampled_at: DateTime<Utc>,
}
