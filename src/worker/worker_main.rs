//! Inference-worker process entry point.
//!
//! Spawned by the host as a child process (same binary, `--worker`).
//! Reads JSON commands from stdin, owns the model pipeline, and writes
//! JSON events to stdout. Log output goes to runtime.log plus stderr
//! (inherited by the parent).
//!
//! Thread design:
//! - Thread 0 (stdin reader): lines → stdin_rx channel
//! - Thread 1 (main loop): drains event_rx to stdout, dispatches commands
//! - Thread 2 (generation, temporary): runs the pipeline, sends events

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::Value;

use crate::app_config::{default_config, APP_ONLY_KEYS};
use crate::paths::AppPaths;
use crate::scanner::ModelKind;
use crate::session::Message;
use crate::settings::resolve_supported_keys;
use crate::{runtime_error, runtime_info};

use super::ipc::*;
use super::pipeline::sampler::GenerationSettings;
use super::pipeline::{decode_data_url, image::ImageGenerationConfig, LoadedPipeline, RuntimeState};

/// Run the worker process. Never returns normally.
pub fn run_worker(data_dir: &Path) {
    let paths = AppPaths::resolve_from(data_dir);
    crate::logger::init(paths.logs_dir.clone());
    runtime_info!("Model worker started (pid={})", std::process::id());

    let runtime = Arc::new(Mutex::new(RuntimeState::new(paths.clone())));
    let current_spec: Arc<Mutex<Option<LoadSpec>>> = Arc::new(Mutex::new(None));
    let stop_flag = Arc::new(AtomicBool::new(false));

    let (stdin_tx, stdin_rx): (Sender<String>, Receiver<String>) =
        crossbeam_channel::unbounded();
    let (event_tx, event_rx): (Sender<WorkerEventMsg>, Receiver<WorkerEventMsg>) =
        crossbeam_channel::unbounded();

    // Thread 0: stdin reader
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if stdin_tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break, // stdin closed: parent died
            }
        }
    });

    let mut generation_thread: Option<thread::JoinHandle<()>> = None;
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    runtime_info!("Worker ready, waiting for commands");

    loop {
        // Drain pipeline events to stdout
        loop {
            match event_rx.try_recv() {
                Ok(event) => write_event(&mut stdout, &event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if let Some(ref handle) = generation_thread {
            if handle.is_finished() {
                generation_thread = None;
            }
        }

        let line = match stdin_rx.recv_timeout(std::time::Duration::from_millis(5)) {
            Ok(l) => l,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                runtime_info!("Stdin channel disconnected, shutting down");
                break;
            }
        };

        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                runtime_error!("Failed to parse command: {}", e);
                write_event(&mut stdout, &WorkerEventMsg::error(0, format!("Parse error: {e}")));
                continue;
            }
        };
        let req_id = request.id;

        match request.command {
            WorkerCommand::Stop => {
                stop_flag.store(true, Ordering::SeqCst);
                runtime_info!("Stop flag set");
            }

            WorkerCommand::Shutdown => {
                runtime_info!("Shutdown requested");
                stop_flag.store(true, Ordering::SeqCst);
                if let Some(handle) = generation_thread.take() {
                    let _ = handle.join();
                }
                break;
            }

            WorkerCommand::Load(spec) => {
                if generation_thread.is_some() {
                    write_event(
                        &mut stdout,
                        &WorkerEventMsg::error(req_id, "Cannot load model while generation is in progress"),
                    );
                    continue;
                }

                write_event(
                    &mut stdout,
                    &WorkerEventMsg::new(
                        req_id,
                        WorkerEvent::LoadStage {
                            stage: "start".to_string(),
                            message: "Starting".to_string(),
                        },
                    ),
                );

                let result = {
                    let tx = event_tx.clone();
                    let mut progress = |stage: &str, message: &str| {
                        let _ = tx.send(WorkerEventMsg::new(
                            req_id,
                            WorkerEvent::LoadStage {
                                stage: stage.to_string(),
                                message: message.to_string(),
                            },
                        ));
                    };
                    runtime.lock().unwrap().ensure_loaded(&spec, &mut progress)
                };

                // Flush staged events before the terminal one
                while let Ok(event) = event_rx.try_recv() {
                    write_event(&mut stdout, &event);
                }

                match result {
                    Ok((_path, device, kind)) => {
                        *current_spec.lock().unwrap() = Some(spec.clone());
                        runtime_info!("Model loaded on {} ({})", device, kind.as_str());
                        write_event(
                            &mut stdout,
                            &WorkerEventMsg::new(
                                req_id,
                                WorkerEvent::Loaded {
                                    model_id: spec.model_id.clone(),
                                    device,
                                    kind: kind.as_str().to_string(),
                                },
                            ),
                        );
                    }
                    Err(e) => {
                        runtime_error!("Model load failed: {}", e);
                        write_event(
                            &mut stdout,
                            &WorkerEventMsg::error(req_id, format!("Load Error: {e}")),
                        );
                    }
                }
            }

            WorkerCommand::Generate { messages, config } => {
                if generation_thread.is_some() {
                    write_event(
                        &mut stdout,
                        &WorkerEventMsg::error(req_id, "Generation already in progress"),
                    );
                    continue;
                }

                stop_flag.store(false, Ordering::SeqCst);

                let params = GenerationParams {
                    req_id,
                    messages,
                    config,
                    runtime: runtime.clone(),
                    current_spec: current_spec.clone(),
                    paths: paths.clone(),
                    stop: stop_flag.clone(),
                    tx: event_tx.clone(),
                };

                generation_thread = Some(thread::spawn(move || {
                    let tx_panic = params.tx.clone();
                    let id = params.req_id;
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        run_generation(params);
                    }));
                    if let Err(panic_info) = result {
                        let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "Unknown panic in generation thread".to_string()
                        };
                        runtime_error!("Generation thread panicked: {}", msg);
                        let _ = tx_panic
                            .send(WorkerEventMsg::error(id, format!("Gen Error: {msg}")));
                        let _ = tx_panic.send(WorkerEventMsg::new(
                            id,
                            WorkerEvent::Finished { stats: GenerationStats::default() },
                        ));
                    }
                }));
            }
        }
    }

    runtime_info!("Worker exiting");
    std::process::exit(0);
}

struct GenerationParams {
    req_id: u64,
    messages: Vec<Message>,
    config: Value,
    runtime: Arc<Mutex<RuntimeState>>,
    current_spec: Arc<Mutex<Option<LoadSpec>>>,
    paths: AppPaths,
    stop: Arc<AtomicBool>,
    tx: Sender<WorkerEventMsg>,
}

/// Run one generation on its own thread; emits token/image events and
/// always closes with finished.
fn run_generation(params: GenerationParams) {
    let GenerationParams {
        req_id,
        messages,
        config,
        runtime,
        current_spec,
        paths,
        stop,
        tx,
    } = params;

    let started = std::time::Instant::now();
    let mut token_count = 0u64;
    let mut image_count = 0u64;

    let mut runtime = runtime.lock().unwrap();
    let is_image = runtime.kind == ModelKind::Image;

    let result = if runtime.pipeline.is_none() {
        Err("Model not loaded in process".to_string())
    } else {
        generate_inner(
            req_id,
            &messages,
            &config,
            &mut runtime,
            &current_spec,
            &paths,
            &stop,
            &tx,
            &mut token_count,
            &mut image_count,
        )
    };

    if let Err(e) = result {
        runtime_error!("Generation error: {}", e);
        let _ = tx.send(WorkerEventMsg::error(req_id, e));
    }

    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        token_count as f64 / elapsed
    } else {
        0.0
    };
    let stats = GenerationStats {
        tokens: token_count,
        time: round2(elapsed),
        speed: round2(speed),
        images: is_image.then_some(image_count),
    };
    let _ = tx.send(WorkerEventMsg::new(req_id, WorkerEvent::Finished { stats }));
}

#[allow(clippy::too_many_arguments)]
fn generate_inner(
    req_id: u64,
    messages: &[Message],
    config: &Value,
    runtime: &mut RuntimeState,
    current_spec: &Mutex<Option<LoadSpec>>,
    paths: &AppPaths,
    stop: &AtomicBool,
    tx: &Sender<WorkerEventMsg>,
    token_count: &mut u64,
    image_count: &mut u64,
) -> Result<(), String> {
    // Merge defaults under the client config
    let mut gen_params = default_config();
    if let (Some(base), Some(overrides)) = (gen_params.as_object_mut(), config.as_object()) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }

    let add_generation_prompt = gen_params
        .get("add_generation_prompt")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let enable_thinking = gen_params
        .get("enable_thinking")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let skip_special_tokens = gen_params
        .get("skip_special_tokens")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    // App-only keys never reach the pipeline
    if let Some(map) = gen_params.as_object_mut() {
        for key in APP_ONLY_KEYS {
            map.remove(*key);
        }
    }

    // Keep only keys the settings resolver accepts for this model
    let model_dir = runtime.model_dir.clone();
    let model_name = model_dir
        .as_ref()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(str::to_string);
    // Key universe spans the chat panel plus the image surface
    let mut all_keys = crate::app_config::all_setting_keys();
    all_keys.extend(super::pipeline::image::image_parameter_surface());
    let supported = resolve_supported_keys(
        &paths.settings_schema(),
        model_name.as_deref(),
        model_dir.as_deref(),
        &all_keys,
    );
    if let Some(map) = gen_params.as_object_mut() {
        map.retain(|key, _| supported.contains(key));
    }

    match runtime.kind {
        ModelKind::Llm | ModelKind::Vlm => {
            let images = if runtime.kind == ModelKind::Vlm {
                extract_vlm_images(messages)
            } else {
                Vec::new()
            };

            let settings = GenerationSettings::from_config(&gen_params);
            let LoadedPipeline::Text(pipeline) = runtime.pipeline.as_mut().unwrap() else {
                return Err("Pipeline kind mismatch".to_string());
            };

            let prompt = super::pipeline::template::render_prompt(
                &pipeline.template,
                messages,
                add_generation_prompt,
                enable_thinking,
            );

            let mut streamer = |sub_text: &str| -> bool {
                if stop.load(Ordering::SeqCst) {
                    return true;
                }
                *token_count += 1;
                let _ = tx.send(WorkerEventMsg::new(
                    req_id,
                    WorkerEvent::Token { token: sub_text.to_string() },
                ));
                false
            };

            pipeline
                .generate(&prompt, &images, &settings, skip_special_tokens, &mut streamer)
                .map_err(classify_text_error)?;
            Ok(())
        }

        ModelKind::Image => {
            let prompt = messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let image_cfg = ImageGenerationConfig::from_config(&gen_params);

            // A changed sequence length needs a rebuilt pipeline first
            maybe_reload_for_sequence_length(req_id, runtime, current_spec, &image_cfg, tx)?;

            let outcome = run_image_generation(req_id, runtime, &prompt, &image_cfg, tx, image_count);
            match outcome {
                Err(e) if e.contains("reshape mismatch") => {
                    // One retry with a forced rebuild
                    runtime_error!("{}: rebuilding pipeline once", e);
                    rebuild_with_cache_bust(req_id, runtime, current_spec, &image_cfg, tx)?;
                    run_image_generation(req_id, runtime, &prompt, &image_cfg, tx, image_count)
                }
                other => other,
            }
        }

        ModelKind::Asr => Err("ASR pipelines do not support chat generation".to_string()),
    }
}

fn run_image_generation(
    req_id: u64,
    runtime: &mut RuntimeState,
    prompt: &str,
    cfg: &ImageGenerationConfig,
    tx: &Sender<WorkerEventMsg>,
    image_count: &mut u64,
) -> Result<(), String> {
    let LoadedPipeline::Image(pipeline) = runtime.pipeline.as_mut().ok_or("Model not loaded")? else {
        return Err("Pipeline kind mismatch".to_string());
    };

    let mut emit = |attachment| {
        let _ = tx.send(WorkerEventMsg::new(
            req_id,
            WorkerEvent::Image { attachments: vec![attachment] },
        ));
    };
    *image_count += pipeline.generate(prompt, cfg, &mut emit)?;
    Ok(())
}

fn maybe_reload_for_sequence_length(
    req_id: u64,
    runtime: &mut RuntimeState,
    current_spec: &Mutex<Option<LoadSpec>>,
    cfg: &ImageGenerationConfig,
    tx: &Sender<WorkerEventMsg>,
) -> Result<(), String> {
    let Some(requested) = cfg.max_sequence_length else {
        return Ok(());
    };
    let loaded = match runtime.pipeline.as_ref() {
        Some(LoadedPipeline::Image(p)) => p.max_sequence_length,
        _ => None,
    };
    if loaded == Some(requested) {
        return Ok(());
    }

    let mut spec = current_spec
        .lock()
        .unwrap()
        .clone()
        .ok_or("No load spec recorded for reload")?;
    spec.image_max_sequence_length = Some(requested);
    reload(req_id, runtime, &spec, tx)?;
    *current_spec.lock().unwrap() = Some(spec);
    Ok(())
}

fn rebuild_with_cache_bust(
    req_id: u64,
    runtime: &mut RuntimeState,
    current_spec: &Mutex<Option<LoadSpec>>,
    cfg: &ImageGenerationConfig,
    tx: &Sender<WorkerEventMsg>,
) -> Result<(), String> {
    let mut spec = current_spec
        .lock()
        .unwrap()
        .clone()
        .ok_or("No load spec recorded for rebuild")?;
    if let Some(requested) = cfg.max_sequence_length {
        spec.image_max_sequence_length = Some(requested);
    }
    spec.cache_bust = true;
    reload(req_id, runtime, &spec, tx)?;
    spec.cache_bust = false;
    *current_spec.lock().unwrap() = Some(spec);
    Ok(())
}

fn reload(
    req_id: u64,
    runtime: &mut RuntimeState,
    spec: &LoadSpec,
    tx: &Sender<WorkerEventMsg>,
) -> Result<(), String> {
    let tx = tx.clone();
    let mut progress = |stage: &str, message: &str| {
        let _ = tx.send(WorkerEventMsg::new(
            req_id,
            WorkerEvent::LoadStage {
                stage: stage.to_string(),
                message: message.to_string(),
            },
        ));
    };
    runtime.ensure_loaded(spec, &mut progress).map(|_| ())
}

/// Image attachments from the last user message, decoded to raw bytes.
fn extract_vlm_images(messages: &[Message]) -> Vec<Vec<u8>> {
    let Some(last_user) = messages.iter().rev().find(|m| m.role == "user") else {
        return Vec::new();
    };
    last_user
        .attachments
        .iter()
        .filter(|att| att.kind.eq_ignore_ascii_case("image"))
        .filter_map(|att| decode_data_url(&att.content))
        .collect()
}

fn classify_text_error(e: String) -> String {
    if e.contains("Prompt too long") {
        format!("{e}. Reduce the conversation length or raise max_prompt_len before loading.")
    } else {
        format!("Gen Error: {e}")
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn write_event(stdout: &mut io::StdoutLock, event: &WorkerEventMsg) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = writeln!(stdout, "{json}");
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_vlm_images_last_user_only() {
        use base64::Engine;
        let payload = base64::engine::general_purpose::STANDARD.encode(b"img");
        let att = |kind: &str| crate::session::Attachment {
            name: "a.png".to_string(),
            kind: kind.to_string(),
            mime: None,
            content: format!("data:image/png;base64,{payload}"),
            truncated: false,
            size: 3,
        };
        let msg = |role: &str, atts: Vec<crate::session::Attachment>| Message {
            role: role.to_string(),
            content: "x".to_string(),
            meta: json!({}),
            attachments: atts,
        };

        let messages = vec![
            msg("user", vec![att("image")]),
            msg("assistant", vec![]),
            msg("user", vec![att("image"), att("text"), att("image")]),
        ];
        let images = extract_vlm_images(&messages);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], b"img");
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(0.005), 0.01);
    }

    #[test]
    fn test_classify_prompt_too_long_adds_hint() {
        let msg = classify_text_error("Prompt too long for VLM pipeline: 20000 tokens (MAX_PROMPT_LEN=16384)".to_string());
        assert!(msg.contains("max_prompt_len"));
        let generic = classify_text_error("device lost".to_string());
        assert!(generic.starts_with("Gen Error:"));
    }
}
