//! VM utilization sampling.

mod collector;
mod sampler;

pub use collector::StatsCollector;
pub use sampler::{cpu_usage_percent, memory_used_mb, UtilizationSampler};
