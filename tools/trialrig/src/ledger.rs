//! Append-only run ledger.
//!
//! The ledger is a CSV file whose first line is a header and whose remaining
//! lines are `attempted,succeeded,failed`, one per harness invocation. The
//! number of entries doubles as the next run number, which keeps every
//! invocation's movie directory distinct.

use crate::errors::RigError;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};

pub const LEDGER_HEADER: &str = "attempted,succeeded,failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: bool,
}

impl LedgerEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.attempted,
            self.succeeded,
            u8::from(self.failed)
        )
    }

    pub fn parse_line(line: &str) -> Result<Self, String> {
        let fields = line.trim().split(',').map(str::trim).collect::<Vec<_>>();
        let [attempted, succeeded, failed] = fields.as_slice() else {
            return Err(format!("expected 3 fields, found {}", fields.len()));
        };
        let attempted = attempted
            .parse::<u32>()
            .map_err(|e| format!("attempted {attempted:?}: {e}"))?;
        let succeeded = succeeded
            .parse::<u32>()
            .map_err(|e| format!("succeeded {succeeded:?}: {e}"))?;
        let failed = match *failed {
            "0" => false,
            "1" => true,
            other => return Err(format!("failed flag must be 0 or 1, found {other:?}")),
        };
        if succeeded > attempted {
            return Err(format!(
                "succeeded ({succeeded}) exceeds attempted ({attempted})"
            ));
        }
        Ok(Self {
            attempted,
            succeeded,
            failed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the ledger; run directories are created beside it.
    pub fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn run_directory(&self, run_number: u32) -> PathBuf {
        self.dir().join(format!("movies{run_number:05}"))
    }

    /// Writes the header if the ledger does not exist yet. Returns whether it
    /// created the file.
    pub fn initialize(&self, fs: &dyn FileSystem) -> Result<bool, RigError> {
        if fs.exists(&self.path) {
            return Ok(false);
        }
        fs.create_dir_all(&self.dir())?;
        fs.write_string(&self.path, &format!("{LEDGER_HEADER}\n"))?;
        append_run_log(
            "info",
            "ledger.initialized",
            json!({ "path": self.path.display().to_string() }),
        );
        Ok(true)
    }

    pub fn read(&self, fs: &dyn FileSystem) -> Result<Vec<LedgerEntry>, RigError> {
        if !fs.exists(&self.path) {
            return Err(self.format_error(0, "ledger file not found"));
        }
        let text = fs.read_to_string(&self.path)?;
        let mut lines = text.lines();
        match lines.next() {
            None => return Err(self.format_error(1, "missing header line")),
            Some(header) if header.trim().is_empty() => {
                return Err(self.format_error(1, "blank header line"))
            }
            Some(header) if LedgerEntry::parse_line(header).is_ok() => {
                return Err(self.format_error(1, "first line is an entry, expected a header"))
            }
            Some(_) => {}
        }

        lines
            .enumerate()
            .map(|(idx, line)| {
                LedgerEntry::parse_line(line).map_err(|reason| self.format_error(idx + 2, &reason))
            })
            .collect()
    }

    /// Run number for the next invocation: the count of recorded entries.
    pub fn next_run_number(&self, fs: &dyn FileSystem) -> Result<u32, RigError> {
        let count = self.read(fs)?.len();
        u32::try_from(count).map_err(|_| self.format_error(0, "too many ledger entries"))
    }

    pub fn append(&self, fs: &dyn FileSystem, entry: &LedgerEntry) -> Result<(), RigError> {
        fs.append_line(&self.path, &entry.to_line())?;
        append_run_log(
            "info",
            "ledger.appended",
            json!({
                "path": self.path.display().to_string(),
                "entry": entry
            }),
        );
        Ok(())
    }

    fn format_error(&self, line: usize, reason: &str) -> RigError {
        RigError::Format {
            path: self.path.clone(),
            line,
            reason: reason.to_string(),
        }
    }
}
