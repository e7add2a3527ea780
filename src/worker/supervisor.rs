//! Host-side supervisor for the inference worker process.
//!
//! Serializes load/generate, bridges worker events into per-request SSE
//! channels, publishes status snapshots for `/api/models/status`, and
//! synthesizes error+done when the worker dies mid-job.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::events::{event_channel, ChannelEvent, EventSender};
use crate::session::Message;
use crate::{sys_error, sys_info};

use super::ipc::*;
use super::process::WorkerProcess;

/// A load may take minutes on first NPU compile, but not forever.
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Snapshot of the worker runtime, published on every transition.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RuntimeStatus {
    pub loaded: bool,
    pub path: String,
    pub device: String,
    pub kind: String,
    pub loading: bool,
    pub load_stage: String,
    pub load_message: String,
    pub load_started_at: f64,
}

struct ActiveJob {
    request_id: u64,
    sender: Arc<EventSender>,
}

type LoadResult = Result<(String, String), String>;

struct Inner {
    status: Mutex<RuntimeStatus>,
    pending_load: Mutex<Option<oneshot::Sender<LoadResult>>>,
    active_job: Mutex<Option<ActiveJob>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    process: Mutex<Option<Arc<WorkerProcess>>>,
    next_id: AtomicU64,
}

pub struct WorkerSupervisor {
    inner: Arc<Inner>,
    op_lock: tokio::sync::Mutex<()>,
    data_dir: PathBuf,
}

pub type SharedWorkerSupervisor = Arc<WorkerSupervisor>;

impl WorkerSupervisor {
    pub fn new(data_dir: PathBuf) -> SharedWorkerSupervisor {
        Arc::new(WorkerSupervisor {
            inner: Arc::new(Inner {
                status: Mutex::new(RuntimeStatus::default()),
                pending_load: Mutex::new(None),
                active_job: Mutex::new(None),
                cmd_tx: Mutex::new(None),
                process: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
            op_lock: tokio::sync::Mutex::new(()),
            data_dir,
        })
    }

    /// Current status snapshot plus the worker pid (when alive).
    pub fn status(&self) -> (RuntimeStatus, Option<u32>) {
        let status = self.inner.status.lock().unwrap().clone();
        let pid = self
            .inner
            .process
            .lock()
            .unwrap()
            .as_ref()
            .filter(|p| p.is_alive())
            .and_then(|p| p.pid());
        (status, pid)
    }

    pub fn is_generating(&self) -> bool {
        self.inner.active_job.lock().unwrap().is_some()
    }

    /// Load a model. Serialized against other loads; rejected while a
    /// generation is running. Blocks until loaded/error/timeout.
    pub async fn load(&self, spec: LoadSpec) -> Result<(String, String), String> {
        let _guard = self.op_lock.lock().await;

        if self.is_generating() {
            return Err("Generation in progress".to_string());
        }
        self.ensure_process()?;

        {
            let mut status = self.inner.status.lock().unwrap();
            status.loading = true;
            status.load_stage = "start".to_string();
            status.load_message = String::new();
            status.load_started_at = epoch_secs();
            status.path = spec.path.clone();
        }

        let (tx, rx) = oneshot::channel();
        *self.inner.pending_load.lock().unwrap() = Some(tx);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        sys_info!("Load request path={} device={}", spec.path, spec.device);
        self.send_command(WorkerRequest {
            id,
            command: WorkerCommand::Load(spec.clone()),
        })?;

        let outcome = match tokio::time::timeout(LOAD_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("Model process exited".to_string()),
            Err(_) => {
                sys_error!("Model load timed out");
                self.inner.pending_load.lock().unwrap().take();
                self.kill_process();
                Err("Model load timed out".to_string())
            }
        };

        let mut status = self.inner.status.lock().unwrap();
        status.loading = false;
        match outcome {
            Ok((device, kind)) => {
                status.loaded = true;
                status.load_stage = "ready".to_string();
                status.load_message = String::new();
                status.device = device.clone();
                status.kind = kind;
                Ok((spec.path, device))
            }
            Err(msg) => {
                status.loaded = false;
                status.load_stage = "error".to_string();
                status.load_message = msg.clone();
                Err(msg)
            }
        }
    }

    /// Start a generation; returns the event stream for the SSE handler.
    /// Concurrent generations are rejected, never queued.
    pub fn generate(
        &self,
        messages: Vec<Message>,
        config: serde_json::Value,
    ) -> Result<mpsc::Receiver<ChannelEvent>, String> {
        if !self.inner.status.lock().unwrap().loaded {
            return Err("Model not loaded".to_string());
        }
        {
            let job = self.inner.active_job.lock().unwrap();
            if job.is_some() {
                return Err("Generation already running".to_string());
            }
        }
        self.ensure_process()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = event_channel();
        *self.inner.active_job.lock().unwrap() = Some(ActiveJob {
            request_id: id,
            sender: Arc::new(sender),
        });

        if let Err(e) = self.send_command(WorkerRequest {
            id,
            command: WorkerCommand::Generate { messages, config },
        }) {
            self.inner.active_job.lock().unwrap().take();
            return Err(e);
        }

        Ok(receiver)
    }

    /// Cooperative cancellation: the worker observes the flag at the next
    /// token callback.
    pub fn stop_generation(&self) {
        let _ = self.send_command(WorkerRequest {
            id: 0,
            command: WorkerCommand::Stop,
        });
    }

    /// Tear the worker down (model unload via process exit).
    pub async fn unload(&self) -> Result<(), String> {
        let _guard = self.op_lock.lock().await;
        if self.is_generating() {
            return Err("Generation in progress".to_string());
        }

        let _ = self.send_command(WorkerRequest {
            id: 0,
            command: WorkerCommand::Shutdown,
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.kill_process();

        *self.inner.status.lock().unwrap() = RuntimeStatus::default();
        Ok(())
    }

    /// Hard shutdown on app exit; cancels any in-flight generation first.
    pub fn shutdown(&self) {
        self.stop_generation();
        let _ = self.send_command(WorkerRequest {
            id: 0,
            command: WorkerCommand::Shutdown,
        });
        std::thread::sleep(Duration::from_millis(200));
        self.kill_process();
    }

    fn send_command(&self, request: WorkerRequest) -> Result<(), String> {
        let json = serde_json::to_string(&request).map_err(|e| format!("Serialize error: {e}"))?;
        let guard = self.inner.cmd_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(json).map_err(|_| "Worker stdin closed".to_string()),
            None => Err("Worker not running".to_string()),
        }
    }

    /// Spawn the worker lazily and wire the IO bridges.
    fn ensure_process(&self) -> Result<(), String> {
        let mut guard = self.inner.process.lock().unwrap();
        let alive = guard.as_ref().map(|p| p.check_alive()).unwrap_or(false);
        if alive {
            return Ok(());
        }

        let process = Arc::new(WorkerProcess::spawn(&self.data_dir)?);
        let stdin = process
            .take_stdin()
            .ok_or("Worker stdin not available")?;
        let stdout = process
            .take_stdout()
            .ok_or("Worker stdout not available")?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
        *self.inner.cmd_tx.lock().unwrap() = Some(cmd_tx);
        tokio::spawn(stdin_writer_task(cmd_rx, stdin));

        let inner = self.inner.clone();
        std::thread::spawn(move || stdout_reader_loop(stdout, inner));

        *guard = Some(process);
        Ok(())
    }

    fn kill_process(&self) {
        *self.inner.cmd_tx.lock().unwrap() = None;
        if let Some(process) = self.inner.process.lock().unwrap().take() {
            process.kill();
        }
    }
}

fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Writes commands to the worker's stdin.
async fn stdin_writer_task(
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
    mut stdin: std::process::ChildStdin,
) {
    while let Some(json_line) = cmd_rx.recv().await {
        if writeln!(stdin, "{json_line}").is_err() {
            sys_error!("Failed to write to worker stdin");
            break;
        }
        if stdin.flush().is_err() {
            break;
        }
    }
}

/// Reads worker events off the stdout pipe and dispatches them. Runs on
/// a dedicated thread; pipe reads block.
fn stdout_reader_loop(stdout: std::process::ChildStdout, inner: Arc<Inner>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,
            Err(e) => {
                sys_error!("Worker stdout read error: {}", e);
                break;
            }
        };

        match serde_json::from_str::<WorkerEventMsg>(&line) {
            Ok(msg) => dispatch_event(&inner, msg),
            Err(e) => sys_error!("Failed to parse worker event: {}", e),
        }
    }

    handle_worker_exit(&inner);
}

/// Route one worker event: load lifecycle into the status/pending-load
/// slots, generation traffic into the active job's SSE channel.
fn dispatch_event(inner: &Inner, msg: WorkerEventMsg) {
    match msg.event {
        WorkerEvent::LoadStage { stage, message } => {
            let mut status = inner.status.lock().unwrap();
            status.loading = true;
            status.load_stage = stage;
            status.load_message = message;
        }

        WorkerEvent::Loaded { device, kind, .. } => {
            if let Some(tx) = inner.pending_load.lock().unwrap().take() {
                let _ = tx.send(Ok((device, kind)));
            }
        }

        WorkerEvent::Token { token } => {
            let job = inner.active_job.lock().unwrap();
            if let Some(job) = job.as_ref().filter(|j| j.request_id == msg.id) {
                job.sender.send_blocking(ChannelEvent::Token { token });
            }
        }

        WorkerEvent::Image { attachments } => {
            let job = inner.active_job.lock().unwrap();
            if let Some(job) = job.as_ref().filter(|j| j.request_id == msg.id) {
                job.sender
                    .send_blocking(ChannelEvent::Image { attachments });
            }
        }

        WorkerEvent::Error { msg: message } => {
            let job = inner.active_job.lock().unwrap();
            match job.as_ref() {
                Some(job) => {
                    job.sender
                        .send_blocking(ChannelEvent::Error { message });
                }
                None => {
                    if let Some(tx) = inner.pending_load.lock().unwrap().take() {
                        let _ = tx.send(Err(message));
                    } else {
                        sys_error!("Worker error outside any operation: {}", message);
                    }
                }
            }
        }

        WorkerEvent::Finished { stats } => {
            let job = inner.active_job.lock().unwrap().take();
            if let Some(job) = job {
                job.sender.send_blocking(ChannelEvent::Done {
                    stats: serde_json::to_value(&stats).unwrap_or_else(|_| json!({})),
                });
            }
        }
    }
}

/// The worker died: fail whatever was in flight and mark the model
/// unloaded.
fn handle_worker_exit(inner: &Inner) {
    sys_error!("Worker process exited");

    if let Some(job) = inner.active_job.lock().unwrap().take() {
        job.sender.send_blocking(ChannelEvent::Error {
            message: "Process Crash: worker exited mid-generation".to_string(),
        });
        job.sender.send_blocking(ChannelEvent::Done {
            stats: serde_json::to_value(GenerationStats::default()).unwrap_or_else(|_| json!({})),
        });
    }

    if let Some(tx) = inner.pending_load.lock().unwrap().take() {
        let _ = tx.send(Err("Model process exited".to_string()));
    }

    let mut status = inner.status.lock().unwrap();
    status.loaded = false;
    if status.loading {
        status.loading = false;
        status.load_stage = "error".to_string();
        status.load_message = "Model process exited".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner() -> Arc<Inner> {
        Arc::new(Inner {
            status: Mutex::new(RuntimeStatus::default()),
            pending_load: Mutex::new(None),
            active_job: Mutex::new(None),
            cmd_tx: Mutex::new(None),
            process: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn register_job(inner: &Inner, request_id: u64) -> mpsc::Receiver<ChannelEvent> {
        let (sender, receiver) = event_channel();
        *inner.active_job.lock().unwrap() = Some(ActiveJob {
            request_id,
            sender: Arc::new(sender),
        });
        receiver
    }

    #[test]
    fn test_tokens_route_to_matching_job() {
        let inner = test_inner();
        let mut rx = register_job(&inner, 5);

        dispatch_event(
            &inner,
            WorkerEventMsg::new(5, WorkerEvent::Token { token: "a".to_string() }),
        );
        // Mismatched id is ignored
        dispatch_event(
            &inner,
            WorkerEventMsg::new(9, WorkerEvent::Token { token: "b".to_string() }),
        );
        dispatch_event(
            &inner,
            WorkerEventMsg::new(
                5,
                WorkerEvent::Finished { stats: GenerationStats { tokens: 1, ..Default::default() } },
            ),
        );

        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Token { token: "a".to_string() })
        );
        match rx.blocking_recv() {
            Some(ChannelEvent::Done { stats }) => assert_eq!(stats["tokens"], 1),
            other => panic!("expected done, got {other:?}"),
        }
        assert!(inner.active_job.lock().unwrap().is_none());
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_error_without_job_fails_pending_load() {
        let inner = test_inner();
        let (tx, rx) = oneshot::channel();
        *inner.pending_load.lock().unwrap() = Some(tx);

        dispatch_event(
            &inner,
            WorkerEventMsg::error(2, "Load Error: tokenizer missing"),
        );

        let result = rx.blocking_recv().unwrap();
        assert_eq!(result, Err("Load Error: tokenizer missing".to_string()));
    }

    #[test]
    fn test_load_stage_updates_status() {
        let inner = test_inner();
        dispatch_event(
            &inner,
            WorkerEventMsg::new(
                1,
                WorkerEvent::LoadStage {
                    stage: "fallback".to_string(),
                    message: "GPU failed, retrying on CPU".to_string(),
                },
            ),
        );
        let status = inner.status.lock().unwrap();
        assert!(status.loading);
        assert_eq!(status.load_stage, "fallback");
        assert!(status.load_message.contains("CPU"));
    }

    #[test]
    fn test_worker_exit_synthesizes_error_then_done() {
        let inner = test_inner();
        let mut rx = register_job(&inner, 3);
        {
            let mut status = inner.status.lock().unwrap();
            status.loaded = true;
        }

        handle_worker_exit(&inner);

        match rx.blocking_recv() {
            Some(ChannelEvent::Error { message }) => {
                assert!(message.starts_with("Process Crash:"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(rx.blocking_recv(), Some(ChannelEvent::Done { .. })));
        assert!(!inner.status.lock().unwrap().loaded);
    }

    #[test]
    fn test_worker_exit_during_load_marks_error_stage() {
        let inner = test_inner();
        {
            let mut status = inner.status.lock().unwrap();
            status.loading = true;
            status.load_stage = "pipeline".to_string();
        }
        let (tx, rx) = oneshot::channel();
        *inner.pending_load.lock().unwrap() = Some(tx);

        handle_worker_exit(&inner);

        assert!(rx.blocking_recv().unwrap().is_err());
        let status = inner.status.lock().unwrap();
        assert_eq!(status.load_stage, "error");
        assert!(!status.loading);
    }
}
