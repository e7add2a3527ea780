//! Worker child-process lifecycle.
//!
//! The worker runs as a fresh process of this same binary (`--worker`);
//! the native runtime is not reliably re-initializable in-process after a
//! failure, so isolation is per-process, not per-thread.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::{sys_error, sys_info};

pub struct WorkerProcess {
    child: Mutex<Option<Child>>,
    is_alive: AtomicBool,
}

impl WorkerProcess {
    /// Spawn a new worker process.
    pub fn spawn(data_dir: &Path) -> Result<Self, String> {
        let child = spawn_worker(data_dir)?;
        Ok(Self {
            child: Mutex::new(Some(child)),
            is_alive: AtomicBool::new(true),
        })
    }

    pub fn take_stdin(&self) -> Option<std::process::ChildStdin> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdin.take()))
    }

    pub fn take_stdout(&self) -> Option<std::process::ChildStdout> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdout.take()))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(std::process::Child::id))
    }

    /// Kill the worker immediately; the OS reclaims all device memory.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                sys_info!("Killing worker process");
                let _ = child.kill();
                let _ = child.wait(); // Reap
            }
            *guard = None;
        }
        self.is_alive.store(false, Ordering::SeqCst);
    }

    /// Non-blocking liveness check; reaps an exited child.
    pub fn check_alive(&self) -> bool {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                match child.try_wait() {
                    Ok(None) => return true,
                    Ok(Some(status)) => {
                        sys_error!("Worker exited with status: {}", status);
                        *guard = None;
                        self.is_alive.store(false, Ordering::SeqCst);
                        return false;
                    }
                    Err(e) => {
                        sys_error!("Failed to check worker status: {}", e);
                        return false;
                    }
                }
            }
        }
        false
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_worker(data_dir: &Path) -> Result<Child, String> {
    let exe = std::env::current_exe().map_err(|e| format!("Cannot find own executable: {e}"))?;

    sys_info!(
        "Spawning worker: {} --worker --data-dir {}",
        exe.display(),
        data_dir.display()
    );

    Command::new(exe)
        .arg("--worker")
        .arg("--data-dir")
        .arg(data_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // Worker logs go to the parent's stderr
        .spawn()
        .map_err(|e| format!("Failed to spawn worker: {e}"))
}
