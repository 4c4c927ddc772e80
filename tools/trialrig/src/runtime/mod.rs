use crate::errors::RigError;
use crate::signal::CancelToken;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), RigError>;

    fn sleep(&self, duration: Duration) -> Result<(), RigError> {
        self.sleep_until(self.now() + duration)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, RigError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), RigError>;
    /// Appends `line` plus a newline in a single write, creating the file if needed.
    fn append_line(&self, path: &Path, line: &str) -> Result<(), RigError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), RigError>;
    fn remove_file(&self, path: &Path) -> Result<(), RigError>;
    fn remove_dir_all(&self, path: &Path) -> Result<(), RigError>;
    fn exists(&self, path: &Path) -> bool;
    /// Regular files directly inside `dir` whose name starts with `prefix`, sorted.
    fn matching_files(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, RigError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), RigError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), RigError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

fn io_error(path: &Path, err: std::io::Error) -> RigError {
    RigError::Io(format!("{}: {err}", path.display()))
}

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RigError> {
        std::fs::read_to_string(path).map_err(|e| io_error(path, e))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), RigError> {
        std::fs::write(path, contents).map_err(|e| io_error(path, e))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), RigError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        let mut buffer = String::with_capacity(line.len() + 1);
        buffer.push_str(line);
        buffer.push('\n');
        file.write_all(buffer.as_bytes())
            .map_err(|e| io_error(path, e))?;
        file.sync_data().map_err(|e| io_error(path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), RigError> {
        std::fs::create_dir_all(path).map_err(|e| io_error(path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<(), RigError> {
        std::fs::remove_file(path).map_err(|e| io_error(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), RigError> {
        std::fs::remove_dir_all(path).map_err(|e| io_error(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn matching_files(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, RigError> {
        let dir_text = dir
            .to_str()
            .ok_or_else(|| RigError::Io(format!("non-utf8 path {}", dir.display())))?;
        let pattern = Path::new(&glob::Pattern::escape(dir_text))
            .join(format!("{}*", glob::Pattern::escape(prefix)));
        let pattern = pattern
            .to_str()
            .ok_or_else(|| RigError::Io(format!("non-utf8 pattern {}", pattern.display())))?;

        let mut files = Vec::new();
        for entry in glob::glob(pattern).map_err(|e| RigError::Io(e.to_string()))? {
            let path = entry.map_err(|e| RigError::Io(e.to_string()))?;
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), RigError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| RigError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
    pub cancel: CancelToken,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
            cancel: CancelToken::new(),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), RigError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        *self.now.lock().expect("clock lock") = deadline;
        Ok(())
    }
}

/// In-memory filesystem. Paths registered with [`FakeFileSystem::pin_file`]
/// refuse deletion, which is how tests model an undeletable stale frame.
#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, String>>>,
    dirs: Arc<Mutex<BTreeSet<PathBuf>>>,
    pinned: Arc<Mutex<BTreeSet<PathBuf>>>,
    fail_next: Arc<Mutex<Option<RigError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs.insert_dirs(parent);
        }
        fs.files
            .lock()
            .expect("files lock")
            .insert(path, contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: RigError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn pin_file(&self, path: impl Into<PathBuf>) {
        self.pinned.lock().expect("pinned lock").insert(path.into());
    }

    fn maybe_fail(&self) -> Result<(), RigError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }

    fn insert_dirs(&self, path: &Path) {
        let mut dirs = self.dirs.lock().expect("dirs lock");
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            dirs.insert(ancestor.to_path_buf());
        }
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RigError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| RigError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), RigError> {
        self.maybe_fail()?;
        if let Some(parent) = path.parent() {
            self.insert_dirs(parent);
        }
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), RigError> {
        self.maybe_fail()?;
        let mut files = self.files.lock().expect("files lock");
        let entry = files.entry(path.to_path_buf()).or_default();
        entry.push_str(line);
        entry.push('\n');
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), RigError> {
        self.maybe_fail()?;
        self.insert_dirs(path);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), RigError> {
        self.maybe_fail()?;
        if self.pinned.lock().expect("pinned lock").contains(path) {
            return Err(RigError::Io(format!(
                "permission denied removing {}",
                path.display()
            )));
        }
        self.files
            .lock()
            .expect("files lock")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RigError::Io(format!("missing file {}", path.display())))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), RigError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .retain(|file, _| !file.starts_with(path));
        self.dirs
            .lock()
            .expect("dirs lock")
            .retain(|dir| !dir.starts_with(path));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
            || self.dirs.lock().expect("dirs lock").contains(path)
    }

    fn matching_files(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, RigError> {
        self.maybe_fail()?;
        Ok(self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), RigError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}
