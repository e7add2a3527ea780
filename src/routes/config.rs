// App configuration, i18n, and language-preference route handlers

use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};
use serde_json::json;

use crate::app_config::{
    config_groups, default_config, model_specific_configs, MAX_FILE_BYTES, NPU_COLLECTION_MODELS,
    NPU_COLLECTION_URL, PRESET_MODELS,
};
use crate::i18n;
use crate::models::LangPreferenceRequest;
use crate::request_parsing::parse_json_body;
use crate::response_helpers::{json_error, json_raw, json_response};
use crate::worker::pipeline::native;

use super::SharedAppState;

/// GET /api/config: static app configuration for the frontend.
pub async fn handle_get_config(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let body = json!({
        "app_version": env!("CARGO_PKG_VERSION"),
        "default_config": default_config(),
        "config_groups": config_groups(),
        "preset_models": PRESET_MODELS,
        "download_models": NPU_COLLECTION_MODELS,
        "download_collection_url": NPU_COLLECTION_URL,
        "model_specific_configs": model_specific_configs(),
        "available_devices": native::available_devices(),
        "models_dir": state.paths.models_dir.to_string_lossy(),
        "max_file_bytes": MAX_FILE_BYTES,
    });
    Ok(json_response(StatusCode::OK, &body))
}

/// GET /api/i18n: available languages.
pub async fn handle_i18n_list() -> Result<Response<Body>, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &json!({"languages": i18n::AVAILABLE_LANGS, "default": i18n::DEFAULT_LANG}),
    ))
}

/// GET /api/i18n/{lang}: one translation dictionary.
pub async fn handle_i18n_dictionary(lang: &str) -> Result<Response<Body>, Infallible> {
    match i18n::dictionary(lang) {
        Some(raw) => Ok(json_raw(StatusCode::OK, raw.to_string())),
        None => Ok(json_error(StatusCode::NOT_FOUND, "Language not found")),
    }
}

/// GET /api/lang: current language preference.
pub async fn handle_get_lang(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let lang = state.lang.lock().unwrap().clone();
    Ok(json_response(StatusCode::OK, &json!({"lang": lang})))
}

/// POST /api/lang: persist a language preference.
pub async fn handle_set_lang(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: LangPreferenceRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    if !i18n::is_supported(&body.lang) {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Unsupported language"));
    }

    *state.lang.lock().unwrap() = body.lang.clone();
    i18n::save_lang(&state.paths.lang_file(), &body.lang);
    Ok(json_response(StatusCode::OK, &json!({"lang": body.lang})))
}
