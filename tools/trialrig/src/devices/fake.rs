use crate::devices::{Positioner, Recorder, RecorderOutput};
use crate::errors::{DeviceError, MotionError};
use crate::runtime::FileSystem;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct PositionerState {
    position: f64,
    moves: Vec<f64>,
    failures: BTreeMap<usize, MotionError>,
}

#[derive(Clone)]
pub struct FakePositioner {
    name: String,
    state: Arc<Mutex<PositionerState>>,
}

impl FakePositioner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(PositionerState::default())),
        }
    }

    /// Makes the `call`-th `set` (zero based) fail with `error`.
    pub fn fail_move(&self, call: usize, error: MotionError) {
        self.state
            .lock()
            .expect("positioner lock")
            .failures
            .insert(call, error);
    }

    /// Every target requested so far, including failed ones.
    pub fn moves(&self) -> Vec<f64> {
        self.state.lock().expect("positioner lock").moves.clone()
    }
}

impl Positioner for FakePositioner {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> f64 {
        self.state.lock().expect("positioner lock").position
    }

    fn set(&self, value: f64, _wait: bool) -> Result<(), MotionError> {
        let mut state = self.state.lock().expect("positioner lock");
        let call = state.moves.len();
        state.moves.push(value);
        if let Some(err) = state.failures.remove(&call) {
            return Err(err);
        }
        state.position = value;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    SetOutput(PathBuf, String),
    Enable,
    Disable,
    ResetFrameCounter,
}

#[derive(Debug)]
struct RecorderState {
    requested: RecorderOutput,
    reported: RecorderOutput,
    lag_polls: u32,
    pending_polls: u32,
    enabled: bool,
    frame_counter: u64,
    events: Vec<RecorderEvent>,
    fail_enable: Option<DeviceError>,
    fail_disable: Option<(u32, DeviceError)>,
}

/// In-memory recorder with an inspection handle shared across clones.
#[derive(Clone)]
pub struct FakeRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl FakeRecorder {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let output = RecorderOutput {
            path: path.into(),
            name: name.into(),
        };
        Self {
            state: Arc::new(Mutex::new(RecorderState {
                requested: output.clone(),
                reported: output,
                lag_polls: 0,
                pending_polls: 0,
                enabled: false,
                frame_counter: 0,
                events: Vec::new(),
                fail_enable: None,
                fail_disable: None,
            })),
        }
    }

    /// Keeps reporting the previous output for `polls` queries after each
    /// `set_output`. `u32::MAX` models a device that never applies it.
    pub fn with_apply_lag(self, polls: u32) -> Self {
        self.state.lock().expect("recorder lock").lag_polls = polls;
        self
    }

    pub fn fail_next_enable(&self, error: DeviceError) {
        self.state.lock().expect("recorder lock").fail_enable = Some(error);
    }

    pub fn fail_next_disable(&self, error: DeviceError) {
        self.fail_disable_after(0, error);
    }

    /// Lets `skip` disables succeed, then fails the next one with `error`.
    pub fn fail_disable_after(&self, skip: u32, error: DeviceError) {
        self.state.lock().expect("recorder lock").fail_disable = Some((skip, error));
    }

    pub fn events(&self) -> Vec<RecorderEvent> {
        self.state.lock().expect("recorder lock").events.clone()
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().expect("recorder lock").enabled
    }

    pub fn frames(&self) -> u64 {
        self.state.lock().expect("recorder lock").frame_counter
    }

    /// Writes one frame file into the reported output directory while enabled.
    pub fn write_frame(&self, fs: &dyn FileSystem) -> Option<PathBuf> {
        let mut state = self.state.lock().expect("recorder lock");
        if !state.enabled {
            return None;
        }
        let path = state.reported.path.join(format!(
            "{}_{:04}.tiff",
            state.reported.name, state.frame_counter
        ));
        fs.write_string(&path, "frame").ok()?;
        state.frame_counter += 1;
        Some(path)
    }
}

impl Recorder for FakeRecorder {
    fn set_output(&mut self, path: &Path, name: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().expect("recorder lock");
        state
            .events
            .push(RecorderEvent::SetOutput(path.to_path_buf(), name.to_string()));
        state.requested = RecorderOutput {
            path: path.to_path_buf(),
            name: name.to_string(),
        };
        state.pending_polls = state.lag_polls;
        if state.pending_polls == 0 {
            state.reported = state.requested.clone();
        }
        Ok(())
    }

    fn output(&self) -> RecorderOutput {
        let mut state = self.state.lock().expect("recorder lock");
        if state.pending_polls > 0 {
            if state.pending_polls != u32::MAX {
                state.pending_polls -= 1;
            }
            return state.reported.clone();
        }
        state.reported = state.requested.clone();
        state.reported.clone()
    }

    fn enable(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().expect("recorder lock");
        state.events.push(RecorderEvent::Enable);
        if let Some(err) = state.fail_enable.take() {
            return Err(err);
        }
        state.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().expect("recorder lock");
        state.events.push(RecorderEvent::Disable);
        match state.fail_disable.take() {
            Some((0, err)) => return Err(err),
            Some((skip, err)) => state.fail_disable = Some((skip - 1, err)),
            None => {}
        }
        state.enabled = false;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().expect("recorder lock").enabled
    }

    fn reset_frame_counter(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().expect("recorder lock");
        state.events.push(RecorderEvent::ResetFrameCounter);
        state.frame_counter = 0;
        Ok(())
    }

    fn frame_counter(&self) -> u64 {
        self.state.lock().expect("recorder lock").frame_counter
    }
}

#[cfg(test)]
mod tests {
    use super::FakeRecorder;
    use crate::devices::Recorder;
    use std::path::{Path, PathBuf};

    #[test]
    fn lagging_recorder_reports_old_path_until_polls_are_spent() {
        let mut recorder = FakeRecorder::new("/runs/00", "cam").with_apply_lag(2);
        recorder
            .set_output(Path::new("/runs/03"), "cam")
            .expect("set");

        assert_eq!(recorder.output().path, PathBuf::from("/runs/00"));
        assert_eq!(recorder.output().path, PathBuf::from("/runs/00"));
        assert_eq!(recorder.output().path, PathBuf::from("/runs/03"));
    }
}
