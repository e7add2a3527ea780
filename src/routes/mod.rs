// Route handler modules

pub mod chat;
pub mod config;
pub mod download;
pub mod health;
pub mod models;
pub mod sessions;
pub mod static_files;
pub mod status;

use std::sync::{Arc, Mutex};

use hyper::{Body, Response, StatusCode};

use crate::download::supervisor::SharedDownloadSupervisor;
use crate::paths::AppPaths;
use crate::response_helpers::json_error;
use crate::session::{SharedSessionStore, StoreError};
use crate::telemetry::NpuMonitor;
use crate::worker::supervisor::SharedWorkerSupervisor;

/// Everything the handlers need, shared across requests.
pub struct AppState {
    pub paths: AppPaths,
    pub store: SharedSessionStore,
    pub llm: SharedWorkerSupervisor,
    pub downloads: SharedDownloadSupervisor,
    pub npu: Arc<NpuMonitor>,
    pub lang: Mutex<String>,
}

pub type SharedAppState = Arc<AppState>;

/// Map a store error onto the HTTP error taxonomy. Shared by every
/// handler that touches the session store.
pub fn store_error(e: StoreError) -> Response<Body> {
    match e {
        StoreError::NotFound => json_error(StatusCode::NOT_FOUND, "Session not found"),
        StoreError::IndexOutOfRange => {
            json_error(StatusCode::BAD_REQUEST, "Message index out of range")
        }
        StoreError::Db(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &msg),
    }
}
