//! Long-run reliability figures derived from the ledger.

use crate::ledger::LedgerEntry;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub runs: usize,
    pub attempted: u64,
    pub succeeded: u64,
    pub failures: usize,
    /// Successful trials accumulated between consecutive failures, one value
    /// per failure, counting the failing run's partial successes.
    pub streaks: Vec<u64>,
    /// Successful trials since the most recent failure.
    pub open_streak: u64,
    pub mean_between_failures: Option<f64>,
}

pub fn summarize(entries: &[LedgerEntry]) -> LedgerSummary {
    let mut streaks = Vec::new();
    let mut current = 0u64;
    for entry in entries {
        current += u64::from(entry.succeeded);
        if entry.failed {
            streaks.push(current);
            current = 0;
        }
    }

    let mean_between_failures = if streaks.is_empty() {
        None
    } else {
        Some(streaks.iter().sum::<u64>() as f64 / streaks.len() as f64)
    };

    LedgerSummary {
        runs: entries.len(),
        attempted: entries.iter().map(|e| u64::from(e.attempted)).sum(),
        succeeded: entries.iter().map(|e| u64::from(e.succeeded)).sum(),
        failures: streaks.len(),
        streaks,
        open_streak: current,
        mean_between_failures,
    }
}

pub fn render_summary(summary: &LedgerSummary) -> Vec<String> {
    let mut lines = vec![
        format!("runs: {}", summary.runs),
        format!(
            "trials: attempted={} succeeded={}",
            summary.attempted, summary.succeeded
        ),
        format!("failures: {}", summary.failures),
    ];
    match summary.mean_between_failures {
        Some(mean) => lines.push(format!(
            "mean successful trials between failures: {mean:.1}"
        )),
        None => lines.push("mean successful trials between failures: n/a".to_string()),
    }
    lines.push(format!(
        "successful trials since last failure: {}",
        summary.open_streak
    ));
    lines
}

#[cfg(test)]
mod tests {
    use super::{render_summary, summarize};
    use crate::ledger::LedgerEntry;

    fn entry(attempted: u32, succeeded: u32, failed: bool) -> LedgerEntry {
        LedgerEntry {
            attempted,
            succeeded,
            failed,
        }
    }

    #[test]
    fn groups_clean_runs_between_failures() {
        let entries = [
            entry(10, 10, false),
            entry(10, 10, false),
            entry(20, 7, true),
            entry(10, 3, true),
            entry(16, 16, false),
        ];
        let summary = summarize(&entries);
        assert_eq!(summary.streaks, vec![27, 3]);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.open_streak, 16);
        assert_eq!(summary.mean_between_failures, Some(15.0));
        assert_eq!(summary.attempted, 66);
        assert_eq!(summary.succeeded, 46);
    }

    #[test]
    fn no_failures_leaves_mean_undefined() {
        let summary = summarize(&[entry(4, 4, false)]);
        assert_eq!(summary.mean_between_failures, None);
        let lines = render_summary(&summary);
        assert!(lines.iter().any(|l| l.ends_with("n/a")));
    }
}
