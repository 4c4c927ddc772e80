//! Capability traits for the hardware a trial drives.
//!
//! The harness never talks to a motor controller or camera directly. It is
//! handed a [`Positioner`] and a [`Recorder`] and only uses the operations
//! below, so real drivers, the simulators in [`sim`] and the test doubles in
//! [`fake`] are interchangeable.

pub mod fake;
pub mod sim;

use crate::errors::{DeviceError, MotionError};
use std::path::{Path, PathBuf};

/// Output settings as the recorder itself reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderOutput {
    pub path: PathBuf,
    pub name: String,
}

/// A settable axis such as a rotation stage or linear feed.
pub trait Positioner {
    fn name(&self) -> &str;

    fn position(&self) -> f64;

    /// Commands the axis to `value`. With `wait`, blocks until the axis has
    /// settled or the move fails.
    fn set(&self, value: f64, wait: bool) -> Result<(), MotionError>;
}

/// A frame-writing capture device (camera file plugin).
///
/// Configuration writes may be applied asynchronously on the device side, so
/// [`Recorder::output`] can keep reporting the previous settings for a while
/// after [`Recorder::set_output`] returns.
pub trait Recorder {
    fn set_output(&mut self, path: &Path, name: &str) -> Result<(), DeviceError>;

    fn output(&self) -> RecorderOutput;

    fn enable(&mut self) -> Result<(), DeviceError>;

    fn disable(&mut self) -> Result<(), DeviceError>;

    fn is_enabled(&self) -> bool;

    fn reset_frame_counter(&mut self) -> Result<(), DeviceError>;

    fn frame_counter(&self) -> u64;
}

/// Moves `positioner` through each setpoint in order, waiting for every move.
pub fn move_through(positioner: &dyn Positioner, setpoints: &[f64]) -> Result<(), MotionError> {
    for &target in setpoints {
        positioner.set(target, true)?;
    }
    Ok(())
}
