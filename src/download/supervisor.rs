//! Host-side download supervisor: one child process per download, at
//! most one concurrent, with a per-download SSE event channel and a
//! status snapshot for `/api/status`.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::events::{event_channel, ChannelEvent, EventSender};
use crate::{sys_error, sys_info};

use super::clean_log_line;

#[derive(Debug, Clone, Serialize, Default)]
pub struct DownloadStatus {
    pub running: bool,
    pub repo_id: String,
    pub percent: u8,
    pub file: String,
    pub message: String,
    pub error: String,
    pub path: String,
    pub started_at: f64,
    pub updated_at: f64,
}

struct State {
    child: Option<Child>,
    cancelled: Arc<AtomicBool>,
    status: DownloadStatus,
}

pub struct DownloadSupervisor {
    cache_dir: PathBuf,
    models_dir: PathBuf,
    state: Arc<Mutex<State>>,
}

pub type SharedDownloadSupervisor = Arc<DownloadSupervisor>;

impl DownloadSupervisor {
    pub fn new(cache_dir: PathBuf, models_dir: PathBuf) -> SharedDownloadSupervisor {
        Arc::new(DownloadSupervisor {
            cache_dir,
            models_dir,
            state: Arc::new(Mutex::new(State {
                child: None,
                cancelled: Arc::new(AtomicBool::new(false)),
                status: DownloadStatus::default(),
            })),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().status.running
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().unwrap().status.clone()
    }

    /// Spawn the download child and return its event stream. Rejects a
    /// second concurrent download.
    pub fn start(&self, repo_id: &str) -> Result<mpsc::Receiver<ChannelEvent>, String> {
        let mut state = self.state.lock().unwrap();
        if state.status.running {
            return Err("Download already running".to_string());
        }

        let exe = std::env::current_exe()
            .map_err(|e| format!("Cannot find own executable: {e}"))?;
        sys_info!("Spawning download child for {}", repo_id);
        let mut child = Command::new(exe)
            .arg("--download")
            .arg(repo_id)
            .arg(&self.cache_dir)
            .arg(&self.models_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to spawn download child: {e}"))?;

        let stdout = child.stdout.take().ok_or("Download stdout not available")?;
        let stderr = child.stderr.take().ok_or("Download stderr not available")?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = event_channel();
        let sender = Arc::new(sender);

        let now = epoch_secs();
        state.child = Some(child);
        state.cancelled = cancelled.clone();
        state.status = DownloadStatus {
            running: true,
            repo_id: repo_id.to_string(),
            started_at: now,
            updated_at: now,
            ..Default::default()
        };

        // Hub SDK stderr: strip escapes, drop progress noise, forward the rest
        let log_sender = sender.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if let Some(message) = clean_log_line(&line) {
                    log_sender.send_blocking(ChannelEvent::Log { message });
                }
            }
        });

        let shared = self.state.clone();
        std::thread::spawn(move || read_loop(stdout, sender, shared, cancelled));

        Ok(receiver)
    }

    /// Cancel the active download: kill the child; the reader then closes
    /// the stream with cancelled + done.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.child.is_none() {
            return;
        }
        sys_info!("Cancelling download of {}", state.status.repo_id);
        state.cancelled.store(true, Ordering::SeqCst);
        let _ = state.child.as_mut().unwrap().kill();
        state.status.message = "cancelled".to_string();
        state.status.updated_at = epoch_secs();
    }
}

/// Consume the child's stdout, forwarding typed events and folding them
/// into the status snapshot. Emits the terminal frames after exit.
fn read_loop(
    stdout: std::process::ChildStdout,
    sender: Arc<EventSender>,
    state: Arc<Mutex<State>>,
    cancelled: Arc<AtomicBool>,
) {
    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        let event = match parse_child_line(&line) {
            Some(event) => event,
            None => match clean_log_line(&line) {
                Some(message) => ChannelEvent::Log { message },
                None => continue,
            },
        };
        {
            let mut state = state.lock().unwrap();
            apply_event_to_status(&mut state.status, &event);
        }
        sender.send_blocking(event);
    }

    // Child gone: reap it and close the stream
    let exit_code = {
        let mut state = state.lock().unwrap();
        state
            .child
            .take()
            .and_then(|mut child| child.wait().ok())
            .and_then(|status| status.code())
    };

    if cancelled.load(Ordering::SeqCst) {
        sender.send_blocking(ChannelEvent::Cancelled);
    } else if let Some(code) = exit_code.filter(|&code| code != 0) {
        let message = format!("Download exited with code {code}");
        sys_error!("{}", message);
        {
            let mut state = state.lock().unwrap();
            state.status.error = message.clone();
        }
        sender.send_blocking(ChannelEvent::Error { message });
    }
    sender.send_blocking(ChannelEvent::Done {
        stats: serde_json::Value::Object(Default::default()),
    });

    let mut state = state.lock().unwrap();
    state.status.running = false;
    state.status.updated_at = epoch_secs();
}

/// Child stdout lines are the same wire frames the SSE layer speaks.
fn parse_child_line(line: &str) -> Option<ChannelEvent> {
    serde_json::from_str::<ChannelEvent>(line).ok()
}

fn apply_event_to_status(status: &mut DownloadStatus, event: &ChannelEvent) {
    status.updated_at = epoch_secs();
    match event {
        ChannelEvent::Progress { file, percent } => {
            status.percent = *percent;
            status.file = file.clone();
            status.message.clear();
        }
        ChannelEvent::Log { message } => status.message = message.clone(),
        ChannelEvent::Error { message } => {
            status.error = message.clone();
            status.message.clear();
        }
        ChannelEvent::Finished { path } => status.path = path.clone(),
        _ => {}
    }
}

fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
