// Append-only file logging shared by the host and its child processes.
//
// The host writes backend.log; the inference worker writes runtime.log
// (stderr of children is inherited, so worker log lines also reach the
// parent console during development).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

pub struct Logger {
    files: Mutex<HashMap<String, File>>,
    logs_dir: OnceLock<PathBuf>,
}

impl Logger {
    pub fn new() -> Self {
        Logger {
            files: Mutex::new(HashMap::new()),
            logs_dir: OnceLock::new(),
        }
    }

    /// Set the directory log files live in. First call wins; later calls
    /// are ignored so child-process re-init is harmless.
    pub fn set_logs_dir(&self, dir: PathBuf) {
        let _ = self.logs_dir.set(dir);
    }

    fn get_or_create_file(&self, target: &str) -> std::io::Result<()> {
        let mut files = self.files.lock().unwrap();

        if !files.contains_key(target) {
            let dir = self
                .logs_dir
                .get()
                .cloned()
                .unwrap_or_else(|| PathBuf::from("logs"));
            std::fs::create_dir_all(&dir)?;

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{target}.log")))?;

            files.insert(target.to_string(), file);
        }

        Ok(())
    }

    pub fn log(&self, target: &str, level: &str, message: &str) {
        if let Err(e) = self.get_or_create_file(target) {
            // Can't use the logging macros here as this IS the logger
            eprintln!("LOGGER ERROR: failed to open {target}.log: {e}");
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let pid = std::process::id();
        let line = format!("[{timestamp}][pid {pid}][{level}] {message}\n");

        if let Ok(mut files) = self.files.lock() {
            if let Some(file) = files.get_mut(target) {
                let _ = file.write_all(line.as_bytes());
                let _ = file.flush();
            }
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

// Global logger instance
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

/// Point the global logger at the resolved logs dir. Call once at startup.
pub fn init(logs_dir: PathBuf) {
    LOGGER.set_logs_dir(logs_dir);
}

// Host-side logging macros (backend.log)
#[macro_export]
macro_rules! sys_info {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.log("backend", "INFO", &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! sys_warn {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.log("backend", "WARN", &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! sys_error {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.log("backend", "ERROR", &format!($($arg)*))
    };
}

// Worker-process logging macros (runtime.log)
#[macro_export]
macro_rules! runtime_info {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.log("runtime", "INFO", &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! runtime_warn {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.log("runtime", "WARN", &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! runtime_error {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.log("runtime", "ERROR", &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_creates_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new();
        logger.set_logs_dir(dir.path().to_path_buf());

        logger.log("backend", "INFO", "server listening");
        logger.log("backend", "WARN", "slow disk");

        let content = std::fs::read_to_string(dir.path().join("backend.log")).unwrap();
        assert!(content.contains("[INFO] server listening"));
        assert!(content.contains("[WARN] slow disk"));
    }

    #[test]
    fn test_targets_write_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new();
        logger.set_logs_dir(dir.path().to_path_buf());

        logger.log("backend", "INFO", "host line");
        logger.log("runtime", "INFO", "worker line");

        assert!(dir.path().join("backend.log").exists());
        assert!(dir.path().join("runtime.log").exists());
    }
}
