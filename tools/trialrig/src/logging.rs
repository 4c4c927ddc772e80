use crate::errors::RigError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

static RUN_LOG: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_ms: u128,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), RigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| RigError::Io(e.to_string()))?;
            }
        }
        let line = serde_json::to_string(&LogEvent {
            ts_ms: event.ts_ms,
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| RigError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RigError::Io(e.to_string()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .map_err(|e| RigError::Io(e.to_string()))?;
        drop(file);

        self.rotate_if_oversized()
    }

    /// Path the log is moved to once it grows past `max_file_bytes`.
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".1");
        PathBuf::from(name)
    }

    fn rotate_if_oversized(&self) -> Result<(), RigError> {
        let len = fs::metadata(&self.path)
            .map_err(|e| RigError::Io(e.to_string()))?
            .len();
        if len <= self.max_file_bytes {
            return Ok(());
        }
        fs::rename(&self.path, self.rotated_path()).map_err(|e| RigError::Io(e.to_string()))
    }
}

/// Routes [`append_run_log`] events to `logger` for the rest of the process.
pub fn install_run_log(logger: JsonlLogger) {
    let slot = RUN_LOG.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(logger);
    }
}

/// Best-effort structured event. A no-op until a run log is installed.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Some(slot) = RUN_LOG.get() else {
        return;
    };
    let Ok(guard) = slot.lock() else {
        return;
    };
    let Some(logger) = guard.as_ref() else {
        return;
    };
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let _ = logger.append(&LogEvent {
        ts_ms,
        level,
        event_type,
        payload,
    });
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
