use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("ledger format error in {path} line {line}: {reason}")]
    Format {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Failure reported by a positioner while moving.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("motion timeout: {axis} did not reach {target} within {waited_ms} ms")]
    Timeout {
        axis: String,
        target: f64,
        waited_ms: u64,
    },
    #[error("motion device fault: {0}")]
    DeviceFault(String),
    #[error("motion interrupted")]
    Interrupted,
}

/// A recorder rejected a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device error: {0}")]
pub struct DeviceError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(
        "recorder did not apply output path {expected} after {attempts} attempts (last reported {observed})"
    )]
    DeviceConfig {
        expected: PathBuf,
        observed: PathBuf,
        attempts: u32,
    },
    #[error("slot {} still holds {} stale file(s)", slot_dir.display(), remaining.len())]
    SlotCleanup {
        slot_dir: PathBuf,
        remaining: Vec<PathBuf>,
    },
    #[error("recorder output path {0} has no parent directory")]
    MissingBasePath(PathBuf),
    #[error("session io error: {0}")]
    Io(String),
}

/// Why a single trial ended without success.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrialError {
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl TrialError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Motion(MotionError::Interrupted))
    }
}
