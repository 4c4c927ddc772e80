use crate::devices::Recorder;
use crate::errors::{MotionError, RigError};
use crate::ledger::{Ledger, LedgerEntry};
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem, ProductionRuntime, Terminal};
use crate::session::{apply_output, slot_dir_name, slot_for, with_session, SessionSettings};
use crate::signal::CancelToken;
use crate::types::{RetryPolicy, TrialOutcome};
use serde_json::json;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

/// Upper bound on how many slots a failure report points at.
pub const DIAGNOSTIC_SLOT_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRequest {
    pub count: u32,
    pub ledger_path: PathBuf,
    pub name: String,
    pub buffer_length: NonZeroU32,
    pub cleanup: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    pub run_number: u32,
    pub run_dir: PathBuf,
    pub attempted: u32,
    pub succeeded: u32,
    pub outcome: TrialOutcome,
    /// Slot directories that may hold evidence of the failure, newest first.
    pub diagnostic_slots: Vec<PathBuf>,
    pub cleaned_up: bool,
}

impl TrialReport {
    pub fn failed(&self) -> bool {
        self.outcome.is_failure()
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match &self.outcome {
            TrialOutcome::Completed => {
                lines.push(format!(
                    "run {:05} completed: attempted={} succeeded={}",
                    self.run_number, self.attempted, self.succeeded
                ));
                if self.cleaned_up {
                    lines.push(format!("removed {}", self.run_dir.display()));
                } else {
                    lines.push(format!("movies kept in {}", self.run_dir.display()));
                }
                return lines;
            }
            TrialOutcome::Failed { trial, reason } => lines.push(format!(
                "run {:05} failed at trial {trial}: {reason}",
                self.run_number
            )),
            TrialOutcome::Cancelled { trial } => lines.push(format!(
                "run {:05} cancelled at trial {trial}",
                self.run_number
            )),
        }
        lines.push(format!(
            "attempted={} succeeded={}",
            self.attempted, self.succeeded
        ));
        lines.push("candidate slots (newest first):".to_string());
        for dir in &self.diagnostic_slots {
            lines.push(format!("  {}", dir.display()));
        }
        lines
    }
}

/// Slots recorded by the last `min(succeeded + 1, 10, buffer_length)` trials,
/// newest first. Trial `succeeded` is the one that failed.
///
/// The `buffer_length` cap goes beyond a plain `min(succeeded + 1, 10)`: with
/// a shorter buffer older trials share a slot, so listing them again would
/// only repeat directories.
pub fn diagnostic_slots(
    run_dir: &Path,
    succeeded: u32,
    buffer_length: NonZeroU32,
) -> Vec<PathBuf> {
    let count = succeeded
        .saturating_add(1)
        .min(DIAGNOSTIC_SLOT_LIMIT)
        .min(buffer_length.get());
    (0..count)
        .map(|back| slot_for(succeeded - back, buffer_length))
        .map(|slot| run_dir.join(slot_dir_name(slot)))
        .collect()
}

/// Appends the run's ledger entry exactly once. If the trial loop unwinds
/// before `commit`, the drop appends a failed entry instead.
struct LedgerFinalizer<'a> {
    ledger: &'a Ledger,
    fs: &'a dyn FileSystem,
    attempted: u32,
    succeeded: u32,
    armed: bool,
}

impl<'a> LedgerFinalizer<'a> {
    fn new(ledger: &'a Ledger, fs: &'a dyn FileSystem, attempted: u32) -> Self {
        Self {
            ledger,
            fs,
            attempted,
            succeeded: 0,
            armed: true,
        }
    }

    fn entry(&self, failed: bool) -> LedgerEntry {
        LedgerEntry {
            attempted: self.attempted,
            succeeded: self.succeeded,
            failed,
        }
    }

    fn commit(mut self, failed: bool) -> Result<(), RigError> {
        self.armed = false;
        self.ledger.append(self.fs, &self.entry(failed))
    }
}

impl Drop for LedgerFinalizer<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(err) = self.ledger.append(self.fs, &self.entry(true)) {
            append_run_log(
                "error",
                "ledger.finalizer_failed",
                json!({
                    "path": self.ledger.path().display().to_string(),
                    "error": err.to_string()
                }),
            );
        }
    }
}

pub struct TrialRunner<'a> {
    fs: &'a dyn FileSystem,
    clock: &'a dyn Clock,
    terminal: &'a dyn Terminal,
    cancel: CancelToken,
    settle: RetryPolicy,
}

impl<'a> TrialRunner<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        clock: &'a dyn Clock,
        terminal: &'a dyn Terminal,
        cancel: CancelToken,
    ) -> Self {
        Self {
            fs,
            clock,
            terminal,
            cancel,
            settle: RetryPolicy::default(),
        }
    }

    pub fn from_runtime(runtime: &'a ProductionRuntime) -> Self {
        Self::new(
            runtime.file_system.as_ref(),
            runtime.clock.as_ref(),
            runtime.terminal.as_ref(),
            runtime.cancel.clone(),
        )
    }

    pub fn with_settle(mut self, settle: RetryPolicy) -> Self {
        self.settle = settle;
        self
    }

    /// Runs up to `request.count` trials of `motion`, each inside its own
    /// recording session, then records the outcome in the ledger.
    ///
    /// Only ledger format problems and failures while preparing the run
    /// directory surface as `Err`; trial failures and cancellation are part
    /// of the returned report.
    pub fn run<M>(
        &self,
        recorder: &mut dyn Recorder,
        request: &TrialRequest,
        mut motion: M,
    ) -> Result<TrialReport, RigError>
    where
        M: FnMut() -> Result<(), MotionError>,
    {
        let ledger = Ledger::new(&request.ledger_path);
        let run_number = ledger.next_run_number(self.fs)?;
        let run_dir = ledger.run_directory(run_number);
        self.fs.create_dir_all(&run_dir)?;

        recorder.disable()?;
        apply_output(
            recorder,
            self.clock,
            &run_dir.join(slot_dir_name(0)),
            &request.name,
            &self.settle,
        )?;
        append_run_log(
            "info",
            "runner.started",
            json!({
                "run_number": run_number,
                "run_dir": run_dir.display().to_string(),
                "count": request.count,
                "buffer_length": request.buffer_length.get()
            }),
        );

        let settings = SessionSettings {
            buffer_length: request.buffer_length,
            settle: self.settle,
        };
        let mut finalizer = LedgerFinalizer::new(&ledger, self.fs, request.count);
        let mut outcome = TrialOutcome::Completed;

        for trial in 0..request.count {
            if self.cancel.is_cancelled() {
                outcome = TrialOutcome::Cancelled { trial };
                break;
            }
            self.say(&format!("starting round {trial} of {}", request.count));
            match with_session(recorder, self.fs, self.clock, trial, &settings, |_| motion()) {
                Ok(()) => finalizer.succeeded += 1,
                Err(err) if err.is_interrupt() || self.cancel.is_cancelled() => {
                    outcome = TrialOutcome::Cancelled { trial };
                    break;
                }
                Err(err) => {
                    append_run_log(
                        "error",
                        "runner.trial.failed",
                        json!({
                            "run_number": run_number,
                            "trial": trial,
                            "error": err.to_string()
                        }),
                    );
                    outcome = TrialOutcome::Failed {
                        trial,
                        reason: err.to_string(),
                    };
                    break;
                }
            }
        }

        let failed = outcome.is_failure();
        let succeeded = finalizer.succeeded;
        let mut cleaned_up = false;
        if !failed && request.cleanup {
            match self.fs.remove_dir_all(&run_dir) {
                Ok(()) => cleaned_up = true,
                Err(err) => {
                    append_run_log(
                        "warn",
                        "runner.cleanup_failed",
                        json!({
                            "run_dir": run_dir.display().to_string(),
                            "error": err.to_string()
                        }),
                    );
                    self.say(&format!("could not remove {}: {err}", run_dir.display()));
                }
            }
        }
        let diagnostic_slots = if failed {
            diagnostic_slots(&run_dir, succeeded, request.buffer_length)
        } else {
            Vec::new()
        };

        finalizer.commit(failed)?;

        let report = TrialReport {
            run_number,
            run_dir,
            attempted: request.count,
            succeeded,
            outcome,
            diagnostic_slots,
            cleaned_up,
        };
        append_run_log(
            if failed { "warn" } else { "info" },
            "runner.finished",
            json!({
                "run_number": run_number,
                "outcome": report.outcome,
                "attempted": report.attempted,
                "succeeded": report.succeeded
            }),
        );
        for line in report.render_lines() {
            self.say(&line);
        }
        Ok(report)
    }

    fn say(&self, line: &str) {
        if let Err(err) = self.terminal.write_line(line) {
            append_run_log(
                "warn",
                "runner.terminal_write_failed",
                json!({ "error": err.to_string() }),
            );
        }
    }
}
