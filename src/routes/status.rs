// Status snapshot, NPU monitor, and app-exit route handlers

use std::convert::Infallible;

use hyper::{Body, Response, StatusCode};
use serde_json::json;

use crate::response_helpers::json_response;
use crate::sys_info;
use crate::telemetry::{get_memory_status, get_process_memory};

use super::SharedAppState;

/// GET /api/status: one poll for everything the shell's status bar needs.
pub async fn handle_status(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let (model, pid) = state.llm.status();
    let model_memory = if model.loaded {
        get_process_memory(pid)
    } else {
        Default::default()
    };

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "memory": get_memory_status(),
            "app": get_process_memory(Some(std::process::id())),
            "download": state.downloads.status(),
            "model": {
                "loaded": model.loaded,
                "path": model.path,
                "device": model.device,
                "kind": model.kind,
                "pid": pid.unwrap_or(0),
                "memory": model_memory,
                "loading": model.loading,
                "load_stage": model.load_stage,
                "load_message": model.load_message,
                "load_started_at": model.load_started_at,
            },
        }),
    ))
}

/// POST /api/npu/start
pub async fn handle_npu_start(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let available = state.npu.start();
    Ok(json_response(
        StatusCode::OK,
        &json!({"available": available, "searching": state.npu.is_searching()}),
    ))
}

/// GET /api/npu/status
pub async fn handle_npu_status(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    Ok(json_response(StatusCode::OK, &state.npu.status()))
}

/// POST /api/npu/stop
pub async fn handle_npu_stop(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    state.npu.stop();
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}

/// POST /api/app/exit: graceful shutdown off the request path so the
/// response still reaches the shell.
pub async fn handle_app_exit(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    sys_info!("Shutdown requested via /api/app/exit");
    std::thread::spawn(move || {
        state.llm.shutdown();
        state.downloads.stop();
        state.npu.stop();
        std::thread::sleep(std::time::Duration::from_millis(200));
        std::process::exit(0);
    });
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}
