// Session CRUD and message edit/retry route handlers

use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};
use serde_json::json;

use crate::models::{MessageEditRequest, MessageRetryRequest, SessionCreateRequest, SessionRenameRequest};
use crate::request_parsing::parse_json_body;
use crate::response_helpers::{json_error, json_response};

use super::{store_error, SharedAppState};

const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// GET /api/sessions
pub async fn handle_list(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let sessions = match state.store.list_sessions() {
        Ok(sessions) => sessions,
        Err(e) => return Ok(store_error(e)),
    };
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "sessions": sessions,
            "current_session_id": state.store.current_session_id(),
        }),
    ))
}

/// POST /api/sessions
pub async fn handle_create(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: SessionCreateRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    let title = body
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string());
    match state.store.create_session(&title, body.is_temporary) {
        Ok(id) => Ok(json_response(
            StatusCode::OK,
            &json!({"id": id, "title": title, "is_temporary": body.is_temporary}),
        )),
        Err(e) => Ok(store_error(e)),
    }
}

/// POST /api/sessions/{id}/select
pub async fn handle_select(id: &str, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    match state.store.set_current(id) {
        Ok(()) => Ok(json_response(StatusCode::OK, &json!({"ok": true}))),
        Err(e) => Ok(store_error(e)),
    }
}

/// PUT /api/sessions/{id}
pub async fn handle_rename(
    req: Request<Body>,
    id: &str,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: SessionRenameRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };
    if body.title.trim().is_empty() {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Title must not be empty"));
    }
    match state.store.rename_session(id, &body.title) {
        Ok(()) => Ok(json_response(StatusCode::OK, &json!({"ok": true}))),
        Err(e) => Ok(store_error(e)),
    }
}

/// DELETE /api/sessions/{id}
pub async fn handle_delete(id: &str, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    match state.store.delete_session(id) {
        Ok(current) => Ok(json_response(
            StatusCode::OK,
            &json!({"ok": true, "current_session_id": current}),
        )),
        Err(e) => Ok(store_error(e)),
    }
}

/// GET /api/sessions/{id}/messages
pub async fn handle_messages(id: &str, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    match state.store.get_history(id) {
        Ok(messages) => Ok(json_response(StatusCode::OK, &json!({"messages": messages}))),
        Err(e) => Ok(store_error(e)),
    }
}

/// GET /api/sessions/{id}/size
pub async fn handle_size(id: &str, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    match state.store.session_size(id) {
        Ok(size) => Ok(json_response(StatusCode::OK, &json!({"size": size}))),
        Err(e) => Ok(store_error(e)),
    }
}

/// POST /api/sessions/{id}/clear
pub async fn handle_clear(id: &str, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    match state.store.clear_session(id) {
        Ok(()) => Ok(json_response(StatusCode::OK, &json!({"ok": true}))),
        Err(e) => Ok(store_error(e)),
    }
}

/// POST /api/sessions/{id}/messages/edit: only user messages; the edit
/// drops everything after the edited message.
pub async fn handle_edit(
    req: Request<Body>,
    id: &str,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: MessageEditRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    let history = match state.store.get_history(id) {
        Ok(history) => history,
        Err(e) => return Ok(store_error(e)),
    };
    let Some(message) = history.get(body.index) else {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Message index out of range"));
    };
    if message.role != "user" {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "Only user messages can be edited",
        ));
    }

    if let Err(e) = state.store.edit_message(id, body.index, &body.content) {
        return Ok(store_error(e));
    }
    if body.index == 0 {
        let _ = state.store.update_title(id, &body.content);
    }
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}

/// POST /api/sessions/{id}/messages/retry: drops the assistant message
/// at `index` and everything after it.
pub async fn handle_retry(
    req: Request<Body>,
    id: &str,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: MessageRetryRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    let history = match state.store.get_history(id) {
        Ok(history) => history,
        Err(e) => return Ok(store_error(e)),
    };
    let Some(message) = history.get(body.index) else {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Message index out of range"));
    };
    if message.role != "assistant" {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "Only assistant messages can be retried",
        ));
    }

    match state.store.truncate_history(id, body.index) {
        Ok(()) => Ok(json_response(StatusCode::OK, &json!({"ok": true}))),
        Err(e) => Ok(store_error(e)),
    }
}
