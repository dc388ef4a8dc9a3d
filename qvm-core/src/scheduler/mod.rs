//! Recurring snapshot scheduling.
//!
//! A job pairs a five-field cron schedule (`<interval> * <day> * *`) with a
//! VM and snapshot name. Each trigger issues a `CreateSnapshot` command
//! through the same executor as live requests.

use crate::error::{QvmError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

mod runner;
mod store;

pub use runner::SnapshotScheduler;
pub use store::{JobStore, JsonJobStore, MemoryJobStore};

/// Default day-of-month field.
pub const DEFAULT_DAY: &str = "*";

/// Default minute field: every minute.
pub const DEFAULT_INTERVAL: &str = "*/1";

/// Result of one scheduled firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireOutcome {
    Succeeded,
    Failed,
}

impl FireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireOutcome::Succeeded => "succeeded",
            FireOutcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FireOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered recurring snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSnapshotJob {
    /// Unique job ID.
    pub id: String,
    pub vm_name: String,
    pub snapshot_name: String,
    /// Day-of-month cron field.
    pub day: String,
    /// Minute cron field.
    pub interval: String,
    pub created_at: DateTime<Utc>,
}

impl ScheduledSnapshotJob {
    /// The job's five-field cron expression.
    pub fn cron_expression(&self) -> String {
        cron_expression(&self.day, &self.interval)
    }

    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::from_fields(&self.day, &self.interval)
    }
}

/// Build `"<interval> * <day> * *"` (minute, hour, day-of-month, month, weekday).
pub fn cron_expression(day: &str, interval: &str) -> String {
    format!("{} * {} * *", interval, day)
}

/// A parsed five-field cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Schedule from a day-of-month field and a minute field.
    pub fn from_fields(day: &str, interval: &str) -> Result<Self> {
        for (name, value) in [("day", day), ("interval", interval)] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(QvmError::InvalidSchedule {
                    expression: cron_expression(day, interval),
                    reason: format!("{} must be a single non-empty cron field", name),
                });
            }
        }
        Self::parse(&cron_expression(day, interval))
    }

    /// Parse a standard five-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(QvmError::InvalidSchedule {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {}", fields),
            });
        }
        // The cron crate counts seconds as the first field.
        let schedule = cron::Schedule::from_str(&format!("0 {}", expression)).map_err(|e| {
            QvmError::InvalidSchedule { expression: expression.to_string(), reason: e.to_string() }
        })?;
        Ok(Self { expression: expression.to_string(), schedule })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First trigger strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}
