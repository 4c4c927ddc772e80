//! Simulated hardware used when the harness runs without a motion controller
//! or camera attached.

use crate::devices::{Positioner, Recorder, RecorderOutput};
use crate::errors::{DeviceError, MotionError};
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem};
use crate::signal::CancelToken;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq)]
pub struct StageLimits {
    pub min: f64,
    pub max: f64,
    /// Travel speed in units per second.
    pub speed: f64,
    pub timeout: Duration,
    pub poll: Duration,
}

/// Single axis that travels at a constant speed between soft limits.
pub struct SimulatedStage {
    name: String,
    limits: StageLimits,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    position: Mutex<f64>,
}

impl SimulatedStage {
    pub fn new(
        name: impl Into<String>,
        limits: StageLimits,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        let start = 0.0_f64.clamp(limits.min, limits.max);
        Self {
            name: name.into(),
            limits,
            clock,
            cancel,
            position: Mutex::new(start),
        }
    }

    fn store(&self, value: f64) {
        if let Ok(mut position) = self.position.lock() {
            *position = value;
        }
    }

    fn wait_for_arrival(&self, target: f64, travel: Duration) -> Result<(), MotionError> {
        let started = self.clock.now();
        // `None` means the instant lies beyond what the clock can represent.
        let arrival = started.checked_add(travel);
        let give_up = started.checked_add(self.limits.timeout);
        loop {
            if self.cancel.is_cancelled() {
                return Err(MotionError::Interrupted);
            }
            let now = self.clock.now();
            if arrival.is_some_and(|at| now >= at) {
                self.store(target);
                return Ok(());
            }
            if give_up.is_some_and(|at| now >= at) {
                return Err(MotionError::Timeout {
                    axis: self.name.clone(),
                    target,
                    waited_ms: self.limits.timeout.as_millis() as u64,
                });
            }
            let next = [now.checked_add(self.limits.poll), arrival, give_up]
                .into_iter()
                .flatten()
                .min()
                .ok_or_else(|| {
                    MotionError::DeviceFault(format!("{}: clock overflow while waiting", self.name))
                })?;
            self.clock
                .sleep_until(next)
                .map_err(|e| MotionError::DeviceFault(e.to_string()))?;
        }
    }
}

impl Positioner for SimulatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> f64 {
        self.position.lock().map(|p| *p).unwrap_or(f64::NAN)
    }

    fn set(&self, value: f64, wait: bool) -> Result<(), MotionError> {
        if !value.is_finite() || value < self.limits.min || value > self.limits.max {
            return Err(MotionError::DeviceFault(format!(
                "{}: target {value} outside soft limits [{}, {}]",
                self.name, self.limits.min, self.limits.max
            )));
        }
        let distance = (value - self.position()).abs();
        let travel = Duration::try_from_secs_f64(distance / self.limits.speed).map_err(|e| {
            MotionError::DeviceFault(format!(
                "{}: travel time to {value} is not representable: {e}",
                self.name
            ))
        })?;
        append_run_log(
            "debug",
            "stage.move.started",
            json!({
                "axis": self.name,
                "target": value,
                "travel_ms": travel.as_millis() as u64,
                "wait": wait
            }),
        );
        if !wait {
            self.store(value);
            return Ok(());
        }
        self.wait_for_arrival(value, travel)
    }
}

/// Recorder that writes one small frame file per simulated exposure.
///
/// Frames are materialized when capture stops: the enabled interval times
/// the frame rate, at least one and at most `max_frames` per capture.
pub struct FileRecorder {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    output: RecorderOutput,
    frame_rate_hz: f64,
    max_frames: u64,
    enabled_at: Option<SystemTime>,
    frame_counter: u64,
}

impl FileRecorder {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        frame_rate_hz: f64,
        max_frames: u64,
    ) -> Self {
        Self {
            fs,
            clock,
            output: RecorderOutput {
                path: PathBuf::new(),
                name: String::new(),
            },
            frame_rate_hz,
            max_frames: max_frames.max(1),
            enabled_at: None,
            frame_counter: 0,
        }
    }

    fn write_frames(&mut self, started: SystemTime) -> Result<(), DeviceError> {
        let elapsed = self
            .clock
            .now()
            .duration_since(started)
            .unwrap_or_default()
            .as_secs_f64();
        let frames = ((elapsed * self.frame_rate_hz).ceil() as u64).clamp(1, self.max_frames);
        let started_ms = started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        for _ in 0..frames {
            let path = self.output.path.join(format!(
                "{}_{:05}.frame",
                self.output.name, self.frame_counter
            ));
            let body = json!({
                "frame": self.frame_counter,
                "capture_started_ms": started_ms,
            })
            .to_string();
            self.fs
                .write_string(&path, &body)
                .map_err(|e| DeviceError(e.to_string()))?;
            self.frame_counter += 1;
        }
        Ok(())
    }
}

impl Recorder for FileRecorder {
    fn set_output(&mut self, path: &Path, name: &str) -> Result<(), DeviceError> {
        if self.enabled_at.is_some() {
            return Err(DeviceError(
                "cannot change output while capturing".to_string(),
            ));
        }
        self.output = RecorderOutput {
            path: path.to_path_buf(),
            name: name.to_string(),
        };
        Ok(())
    }

    fn output(&self) -> RecorderOutput {
        self.output.clone()
    }

    fn enable(&mut self) -> Result<(), DeviceError> {
        if self.enabled_at.is_none() {
            self.enabled_at = Some(self.clock.now());
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<(), DeviceError> {
        match self.enabled_at.take() {
            Some(started) => self.write_frames(started),
            None => Ok(()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled_at.is_some()
    }

    fn reset_frame_counter(&mut self) -> Result<(), DeviceError> {
        self.frame_counter = 0;
        Ok(())
    }

    fn frame_counter(&self) -> u64 {
        self.frame_counter
    }
}
