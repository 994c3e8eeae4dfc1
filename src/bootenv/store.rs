//! Boot environment store adapters
//!
//! - [`FwEnvStore`]: U-Boot `fw_printenv` / `fw_setenv` (one atomic script write)
//! - [`FileEnvStore`]: `key=value` lines, replaced with write-then-rename
//! - [`MemoryEnvStore`]: in-process map for tests and dry runs

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::BootEnvError;

/// Key/value repository the bootloader reads at next boot
pub trait EnvStore: Send + Sync {
    /// Value of `key`, `None` if unset
    fn get(&self, key: &str) -> Result<Option<String>, BootEnvError>;

    /// Set several keys in one write where the backend allows it
    fn set_many(&self, pairs: &[(String, String)]) -> Result<(), BootEnvError>;

    fn set(&self, key: &str, value: &str) -> Result<(), BootEnvError> {
        self.set_many(&[(key.to_string(), value.to_string())])
    }

    /// Short backend name for logs
    fn describe(&self) -> String;
}

fn check_pair(key: &str, value: &str) -> Result<(), BootEnvError> {
    if key.is_empty() || key.contains(|c: char| c == '=' || c.is_whitespace()) {
        return Err(BootEnvError::InvalidEntry(format!("bad key {:?}", key)));
    }
    if value.contains('\n') {
        return Err(BootEnvError::InvalidEntry(format!(
            "value for {} contains a newline",
            key
        )));
    }
    Ok(())
}

/// Parse `key=value` lines; blank lines and `#` comments are skipped
fn parse_env(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

/// U-Boot userspace environment tools
pub struct FwEnvStore {
    printenv: PathBuf,
    setenv: PathBuf,
}

impl FwEnvStore {
    pub fn new() -> Self {
        Self::with_programs("fw_printenv", "fw_setenv")
    }

    pub fn with_programs(printenv: impl Into<PathBuf>, setenv: impl Into<PathBuf>) -> Self {
        Self {
            printenv: printenv.into(),
            setenv: setenv.into(),
        }
    }

    fn unavailable(&self, program: &Path, reason: impl Into<String>) -> BootEnvError {
        BootEnvError::Unavailable {
            backend: format!("{}", program.display()),
            reason: reason.into(),
        }
    }
}

impl Default for FwEnvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvStore for FwEnvStore {
    fn get(&self, key: &str) -> Result<Option<String>, BootEnvError> {
        let output = Command::new(&self.printenv)
            .output()
            .map_err(|e| self.unavailable(&self.printenv, format!("spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(
                &self.printenv,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let env = parse_env(&String::from_utf8_lossy(&output.stdout));
        Ok(env.get(key).cloned())
    }

    fn set_many(&self, pairs: &[(String, String)]) -> Result<(), BootEnvError> {
        let mut script = String::new();
        for (key, value) in pairs {
            check_pair(key, value)?;
            script.push_str(&format!("{} {}\n", key, value));
        }

        let mut child = Command::new(&self.setenv)
            .args(["-s", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.unavailable(&self.setenv, format!("spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| self.unavailable(&self.setenv, format!("stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| self.unavailable(&self.setenv, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(
                &self.setenv,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        debug!(keys = pairs.len(), "boot environment script applied");
        Ok(())
    }

    fn describe(&self) -> String {
        "fw-utils".to_string()
    }
}

/// Plain `key=value` file
pub struct FileEnvStore {
    path: PathBuf,
}

impl FileEnvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: io::Error) -> BootEnvError {
        BootEnvError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// All entries; a missing file is an empty environment
    fn load(&self) -> Result<BTreeMap<String, String>, BootEnvError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_env(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn store(&self, env: &BTreeMap<String, String>) -> Result<(), BootEnvError> {
        let mut body = String::new();
        for (key, value) in env {
            body.push_str(&format!("{}={}\n", key, value));
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(|e| self.io_err(e))?;
        let written = file
            .write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
            .and_then(|()| fs::rename(&temp_path, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(self.io_err(e));
        }
        Ok(())
    }
}

impl EnvStore for FileEnvStore {
    fn get(&self, key: &str) -> Result<Option<String>, BootEnvError> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set_many(&self, pairs: &[(String, String)]) -> Result<(), BootEnvError> {
        let mut env = self.load()?;
        for (key, value) in pairs {
            check_pair(key, value)?;
            env.insert(key.clone(), value.clone());
        }
        self.store(&env)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// In-memory store; can be switched unavailable to simulate a dead backend
#[derive(Default)]
pub struct MemoryEnvStore {
    entries: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryEnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn check_available(&self) -> Result<(), BootEnvError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BootEnvError::Unavailable {
                backend: "memory".to_string(),
                reason: "store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl EnvStore for MemoryEnvStore {
    fn get(&self, key: &str) -> Result<Option<String>, BootEnvError> {
        self.check_available()?;
        Ok(self.snapshot().get(key).cloned())
    }

    fn set_many(&self, pairs: &[(String, String)]) -> Result<(), BootEnvError> {
        self.check_available()?;
        for (key, value) in pairs {
            check_pair(key, value)?;
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BootEnvError::Unavailable {
                backend: "memory".to_string(),
                reason: "lock poisoned".to_string(),
            })?;
        for (key, value) in pairs {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_env_lines() {
        let env = parse_env("# comment\nactive_slot=A\n\nbootargs=console=ttyS0 root=/dev/x\n");
        assert_eq!(env.get("active_slot").map(String::as_str), Some("A"));
        assert_eq!(
            env.get("bootargs").map(String::as_str),
            Some("console=ttyS0 root=/dev/x")
        );
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_file_store_round_trip_preserves_other_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bootenv");
        fs::write(&path, "bootdelay=3\nactive_slot=A\n").unwrap();

        let store = FileEnvStore::new(&path);
        store
            .set_many(&pairs(&[("active_slot", "B"), ("boot_count", "0")]))
            .unwrap();

        assert_eq!(store.get("active_slot").unwrap().as_deref(), Some("B"));
        assert_eq!(store.get("boot_count").unwrap().as_deref(), Some("0"));
        assert_eq!(store.get("bootdelay").unwrap().as_deref(), Some("3"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_failed_write_removes_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bootenv");
        // A directory in place of the env file makes the final rename fail
        fs::create_dir_all(path.join("occupied")).unwrap();

        let store = FileEnvStore::new(&path);
        let mut env = BTreeMap::new();
        env.insert("active_slot".to_string(), "B".to_string());

        assert!(matches!(store.store(&env), Err(BootEnvError::Io { .. })));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = FileEnvStore::new(temp.path().join("bootenv"));
        assert_eq!(store.get("active_slot").unwrap(), None);
    }

    #[test]
    fn test_file_store_missing_dir_is_error() {
        let temp = TempDir::new().unwrap();
        let store = FileEnvStore::new(temp.path().join("nope").join("bootenv"));
        assert!(store.set("active_slot", "B").is_err());
    }

    #[test]
    fn test_rejects_bad_entries() {
        let store = MemoryEnvStore::new();
        assert!(store.set("bad key", "1").is_err());
        assert!(store.set("k=v", "1").is_err());
        assert!(store.set("key", "line\nbreak").is_err());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_memory_store_unavailable() {
        let store = MemoryEnvStore::with_entries([("active_slot", "A")]);
        store.set_unavailable(true);
        assert!(store.get("active_slot").is_err());
        assert!(store.set("active_slot", "B").is_err());

        store.set_unavailable(false);
        assert_eq!(store.get("active_slot").unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_fw_store_missing_tool_is_unavailable() {
        let store = FwEnvStore::with_programs(
            "/nonexistent/fw_printenv",
            "/nonexistent/fw_setenv",
        );
        assert!(matches!(
            store.get("active_slot").unwrap_err(),
            BootEnvError::Unavailable { .. }
        ));
        assert!(store.set("active_slot", "B").is_err());
    }
}
