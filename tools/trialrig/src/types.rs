use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded polling used while waiting for a device to apply a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TrialOutcome {
    Completed,
    Failed { trial: u32, reason: String },
    Cancelled { trial: u32 },
}

impl TrialOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}
