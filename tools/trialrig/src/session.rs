//! Rolling-buffer recording sessions.
//!
//! A session owns the recorder for the span of one trial. Opening it picks the
//! buffer slot for the trial index, points the recorder at that slot's
//! directory, purges frames left behind by the previous lap through the
//! buffer and starts capture. Capture is stopped exactly once when the session
//! is closed or dropped, whichever comes first.

use crate::devices::Recorder;
use crate::errors::{DeviceError, MotionError, SessionError, TrialError};
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem};
use crate::types::RetryPolicy;
use serde_json::json;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub buffer_length: NonZeroU32,
    pub settle: RetryPolicy,
}

/// Where the current trial is being recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub run_index: u32,
    pub slot: u32,
    pub dir: PathBuf,
}

pub fn slot_for(run_index: u32, buffer_length: NonZeroU32) -> u32 {
    run_index % buffer_length.get()
}

pub fn slot_dir_name(slot: u32) -> String {
    format!("{slot:02}")
}

/// Points the recorder at `path` and polls until it reports the change.
pub fn apply_output(
    recorder: &mut dyn Recorder,
    clock: &dyn Clock,
    path: &Path,
    name: &str,
    policy: &RetryPolicy,
) -> Result<(), SessionError> {
    recorder.set_output(path, name)?;
    let attempts = policy.attempts.max(1);
    let mut observed = PathBuf::new();
    for attempt in 1..=attempts {
        let reported = recorder.output();
        if reported.path == path && reported.name == name {
            if attempt > 1 {
                append_run_log(
                    "debug",
                    "recorder.output.converged",
                    json!({
                        "path": path.display().to_string(),
                        "attempt": attempt
                    }),
                );
            }
            return Ok(());
        }
        observed = reported.path;
        if attempt < attempts {
            clock
                .sleep(policy.delay)
                .map_err(|e| SessionError::Io(e.to_string()))?;
        }
    }
    append_run_log(
        "error",
        "recorder.output.not_applied",
        json!({
            "expected": path.display().to_string(),
            "observed": observed.display().to_string(),
            "attempts": attempts
        }),
    );
    Err(SessionError::DeviceConfig {
        expected: path.to_path_buf(),
        observed,
        attempts,
    })
}

/// Deletes every file in `slot_dir` whose name starts with `name`.
///
/// Individual failures do not stop the sweep; any survivor fails the purge.
pub fn purge_slot(
    fs: &dyn FileSystem,
    slot_dir: &Path,
    name: &str,
) -> Result<usize, SessionError> {
    let stale = fs
        .matching_files(slot_dir, name)
        .map_err(|e| SessionError::Io(e.to_string()))?;
    let mut removed = 0usize;
    let mut remaining = Vec::new();
    for path in stale {
        match fs.remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => {
                append_run_log(
                    "warn",
                    "session.slot.remove_failed",
                    json!({
                        "path": path.display().to_string(),
                        "error": err.to_string()
                    }),
                );
                remaining.push(path);
            }
        }
    }
    if !remaining.is_empty() {
        return Err(SessionError::SlotCleanup {
            slot_dir: slot_dir.to_path_buf(),
            remaining,
        });
    }
    Ok(removed)
}

pub struct RollingBufferSession<'r> {
    recorder: &'r mut dyn Recorder,
    info: SlotInfo,
    active: bool,
}

impl<'r> RollingBufferSession<'r> {
    pub fn open(
        recorder: &'r mut dyn Recorder,
        fs: &dyn FileSystem,
        clock: &dyn Clock,
        run_index: u32,
        settings: &SessionSettings,
    ) -> Result<Self, SessionError> {
        recorder.disable()?;

        let slot = slot_for(run_index, settings.buffer_length);
        let current = recorder.output();
        let base = current
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| SessionError::MissingBasePath(current.path.clone()))?
            .to_path_buf();
        let dir = base.join(slot_dir_name(slot));

        fs.create_dir_all(&dir)
            .map_err(|e| SessionError::Io(e.to_string()))?;
        apply_output(recorder, clock, &dir, &current.name, &settings.settle)?;
        let purged = purge_slot(fs, &dir, &current.name)?;
        recorder.reset_frame_counter()?;
        if let Err(err) = recorder.enable() {
            if let Err(disable_err) = recorder.disable() {
                append_run_log(
                    "error",
                    "session.disable_failed",
                    json!({
                        "slot_dir": dir.display().to_string(),
                        "error": disable_err.to_string()
                    }),
                );
            }
            return Err(err.into());
        }

        append_run_log(
            "info",
            "session.opened",
            json!({
                "run_index": run_index,
                "slot": slot,
                "slot_dir": dir.display().to_string(),
                "purged": purged
            }),
        );
        Ok(Self {
            recorder,
            info: SlotInfo {
                run_index,
                slot,
                dir,
            },
            active: true,
        })
    }

    pub fn info(&self) -> &SlotInfo {
        &self.info
    }

    /// Stops capture. Consumes the session so capture is stopped once.
    pub fn close(mut self) -> Result<(), DeviceError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let result = self.recorder.disable();
        if let Err(err) = &result {
            append_run_log(
                "error",
                "session.disable_failed",
                json!({
                    "slot_dir": self.info.dir.display().to_string(),
                    "error": err.to_string()
                }),
            );
        }
        result
    }
}

impl Drop for RollingBufferSession<'_> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Runs `body` with recording active in the slot for `run_index`.
///
/// The body's result is returned as is; a failure to stop capture afterwards
/// is logged but never replaces it.
pub fn with_session<T, F>(
    recorder: &mut dyn Recorder,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    run_index: u32,
    settings: &SessionSettings,
    body: F,
) -> Result<T, TrialError>
where
    F: FnOnce(&SlotInfo) -> Result<T, MotionError>,
{
    let session = RollingBufferSession::open(recorder, fs, clock, run_index, settings)?;
    let result = body(session.info());
    let _ = session.close();
    result.map_err(TrialError::from)
}

#[cfg(test)]
mod tests {
    use super::{apply_output, slot_for, RollingBufferSession, SessionSettings};
    use crate::devices::fake::{FakeRecorder, RecorderEvent};
    use crate::errors::SessionError;
    use crate::runtime::{FakeClock, FakeFileSystem};
    use crate::types::RetryPolicy;
    use std::num::NonZeroU32;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn settings(buffer_length: u32) -> SessionSettings {
        SessionSettings {
            buffer_length: NonZeroU32::new(buffer_length).expect("non-zero"),
            settle: RetryPolicy {
                attempts: 5,
                delay: Duration::from_millis(20),
            },
        }
    }

    #[test]
    fn slot_wraps_modulo_buffer_length() {
        let ten = NonZeroU32::new(10).expect("non-zero");
        assert_eq!(slot_for(0, ten), 0);
        assert_eq!(slot_for(9, ten), 9);
        assert_eq!(slot_for(10, ten), 0);
        assert_eq!(slot_for(23, ten), 3);
        assert_eq!(slot_for(7, NonZeroU32::MIN), 0);
    }

    #[test]
    fn convergence_polls_with_fixed_delay() {
        let clock = FakeClock::default();
        let mut recorder = FakeRecorder::new("/runs/00", "cam").with_apply_lag(3);
        apply_output(
            &mut recorder,
            &clock,
            Path::new("/runs/04"),
            "cam",
            &settings(10).settle,
        )
        .expect("converges on fourth poll");
        assert_eq!(clock.sleeps().len(), 3);
    }

    #[test]
    fn convergence_gives_up_after_attempt_budget() {
        let clock = FakeClock::default();
        let mut recorder = FakeRecorder::new("/runs/00", "cam").with_apply_lag(u32::MAX);
        let err = apply_output(
            &mut recorder,
            &clock,
            Path::new("/runs/04"),
            "cam",
            &settings(10).settle,
        )
        .expect_err("never applied");
        assert_eq!(
            err,
            SessionError::DeviceConfig {
                expected: PathBuf::from("/runs/04"),
                observed: PathBuf::from("/runs/00"),
                attempts: 5,
            }
        );
        assert_eq!(clock.sleeps().len(), 4);
    }

    #[test]
    fn open_rejects_output_path_without_parent() {
        let fs = FakeFileSystem::default();
        let mut recorder = FakeRecorder::new("00", "cam");
        let err = RollingBufferSession::open(
            &mut recorder,
            &fs,
            &FakeClock::default(),
            0,
            &settings(10),
        )
        .err()
        .expect("no base path");
        assert!(matches!(err, SessionError::MissingBasePath(_)));
    }

    #[test]
    fn enable_failure_is_followed_by_disable() {
        let fs = FakeFileSystem::default();
        let handle = FakeRecorder::new("/runs/00", "cam");
        handle.fail_next_enable(crate::errors::DeviceError("busy".to_string()));
        let mut recorder = handle.clone();

        let result =
            RollingBufferSession::open(&mut recorder, &fs, &FakeClock::default(), 1, &settings(4));
        assert!(matches!(result, Err(SessionError::Device(_))));
        assert_eq!(handle.events().last(), Some(&RecorderEvent::Disable));
        assert!(!handle.enabled());
    }

    #[test]
    fn enable_error_wins_over_a_failing_cleanup_disable() {
        let fs = FakeFileSystem::default();
        let handle = FakeRecorder::new("/runs/00", "cam");
        handle.fail_next_enable(crate::errors::DeviceError("busy".to_string()));
        handle.fail_disable_after(1, crate::errors::DeviceError("offline".to_string()));
        let mut recorder = handle.clone();

        let result =
            RollingBufferSession::open(&mut recorder, &fs, &FakeClock::default(), 1, &settings(4));
        assert!(matches!(
            result,
            Err(SessionError::Device(crate::errors::DeviceError(ref msg))) if msg == "busy"
        ));
        assert_eq!(handle.events().last(), Some(&RecorderEvent::Disable));
    }

    #[test]
    fn dropping_an_open_session_disables_once() {
        let fs = FakeFileSystem::default();
        let handle = FakeRecorder::new("/runs/00", "cam");
        let mut recorder = handle.clone();
        {
            let session = RollingBufferSession::open(
                &mut recorder,
                &fs,
                &FakeClock::default(),
                2,
                &settings(10),
            )
            .expect("open");
            assert_eq!(session.info().dir, PathBuf::from("/runs/02"));
            assert!(handle.enabled());
        }
        assert!(!handle.enabled());
        let disables = handle
            .events()
            .iter()
            .filter(|event| **event == RecorderEvent::Disable)
            .count();
        assert_eq!(disables, 2);
    }
}
