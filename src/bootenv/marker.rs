//! Installed-version marker

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Single persisted version string
pub trait VersionStore: Send + Sync {
    /// Last installed version, `None` if never recorded
    fn current(&self) -> io::Result<Option<String>>;

    fn persist(&self, version: &str) -> io::Result<()>;
}

/// One-line text file, replaced atomically
pub struct FileVersionStore {
    path: PathBuf,
}

impl FileVersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionStore for FileVersionStore {
    fn current(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                let line = text.lines().next().unwrap_or("").trim();
                Ok((!line.is_empty()).then(|| line.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn persist(&self, version: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        let written = writeln!(file, "{}", version.trim())
            .and_then(|()| file.sync_all())
            .and_then(|()| fs::rename(&temp_path, &self.path));
        if written.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        written
    }
}

/// In-memory marker for tests
#[derive(Default)]
pub struct MemoryVersionStore {
    version: Mutex<Option<String>>,
}

impl MemoryVersionStore {
    pub fn new(version: Option<&str>) -> Self {
        Self {
            version: Mutex::new(version.map(str::to_string)),
        }
    }
}

impl VersionStore for MemoryVersionStore {
    fn current(&self) -> io::Result<Option<String>> {
        self.version
            .lock()
            .map(|v| v.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "version lock poisoned"))
    }

    fn persist(&self, version: &str) -> io::Result<()> {
        let mut guard = self
            .version
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "version lock poisoned"))?;
        *guard = Some(version.to_string());
        Ok(())
    }
}
