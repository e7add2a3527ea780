// Model management route handlers: local scan, per-model config,
// load/delete, and runtime status.

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use hyper::{Body, Request, Response, StatusCode};
use serde_json::json;

use crate::app_config::all_setting_keys;
use crate::models::{ModelDeleteRequest, ModelLoadRequest};
use crate::request_parsing::{get_query_param, parse_json_body};
use crate::response_helpers::{json_error, json_response};
use crate::scanner::scan_models;
use crate::settings::{load_model_json_configs, resolve_supported_keys};
use crate::telemetry::get_process_memory;
use crate::worker::ipc::LoadSpec;
use crate::worker::pipeline::image::image_parameter_surface;
use crate::{sys_error, sys_info};

use super::SharedAppState;

/// GET /api/models/local
pub async fn handle_local_models(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let models_dir = state.paths.models_dir.clone();
    let models = tokio::task::spawn_blocking(move || scan_models(&models_dir))
        .await
        .unwrap_or_default();
    Ok(json_response(StatusCode::OK, &json!({"models": models})))
}

/// GET /api/models/config?path=
pub async fn handle_model_config(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let Some(path) = get_query_param(req.uri(), "path").filter(|p| !p.is_empty()) else {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Missing path parameter"));
    };

    let model_path = PathBuf::from(&path);
    let model_name = model_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);

    // The key universe spans the chat panel plus the image surface
    let mut all_keys = all_setting_keys();
    all_keys.extend(image_parameter_surface());

    let supported = resolve_supported_keys(
        &state.paths.settings_schema(),
        model_name.as_deref(),
        Some(&model_path),
        &all_keys,
    );

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "config": load_model_json_configs(&model_path),
            "supported_keys": supported,
        }),
    ))
}

/// POST /api/models/load
pub async fn handle_model_load(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: ModelLoadRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };
    if body.path.trim().is_empty() {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Missing model path"));
    }

    let spec = LoadSpec {
        source: body.source,
        model_id: body.model_id,
        path: body.path,
        device: body.device,
        max_prompt_len: body.max_prompt_len,
        image_max_sequence_length: body.image_max_sequence_length,
        cache_bust: false,
    };

    match state.llm.load(spec).await {
        Ok((path, device)) => Ok(json_response(
            StatusCode::OK,
            &json!({"path": path, "device": device}),
        )),
        Err(e) => {
            sys_error!("Model load failed: {}", e);
            Ok(json_error(StatusCode::BAD_REQUEST, &e))
        }
    }
}

/// GET /api/models/status
pub async fn handle_model_status(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let (status, pid) = state.llm.status();
    let memory = if status.loaded {
        get_process_memory(pid)
    } else {
        Default::default()
    };

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "loaded": status.loaded,
            "path": status.path,
            "device": status.device,
            "kind": status.kind,
            "pid": pid.unwrap_or(0),
            "memory": memory,
            "loading": status.loading,
            "load_stage": status.load_stage,
            "load_message": status.load_message,
            "load_started_at": status.load_started_at,
        }),
    ))
}

/// POST /api/models/delete: refuses paths outside the models root and
/// unloads first when the target is the loaded model.
pub async fn handle_model_delete(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: ModelDeleteRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    let models_root = match state.paths.models_dir.canonicalize() {
        Ok(root) => root,
        Err(_) => return Ok(json_response(StatusCode::OK, &json!({"ok": true, "removed": false}))),
    };
    let target = Path::new(&body.path);
    let target = match target.canonicalize() {
        Ok(target) => target,
        Err(_) => {
            return Ok(json_response(
                StatusCode::OK,
                &json!({"ok": true, "removed": false}),
            ))
        }
    };

    if !target.starts_with(&models_root) || target == models_root {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Invalid model path"));
    }
    if !target.is_dir() {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Invalid model path"));
    }

    let (status, _) = state.llm.status();
    if status.loaded && !status.path.is_empty() {
        let loaded = Path::new(&status.path)
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(&status.path));
        if loaded == target {
            if let Err(e) = state.llm.unload().await {
                return Ok(json_error(StatusCode::CONFLICT, &e));
            }
        }
    }

    if let Err(e) = std::fs::remove_dir_all(&target) {
        return Ok(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Delete failed: {e}"),
        ));
    }

    sys_info!("Deleted model {}", target.display());
    Ok(json_response(StatusCode::OK, &json!({"ok": true, "removed": true})))
}
