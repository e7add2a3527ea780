// Host entry point. One binary, three roles:
//   idle-npu-host                       → HTTP/SSE control plane
//   idle-npu-host --worker --data-dir D → inference worker child
//   idle-npu-host --download R C M      → download child

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};

use idle_npu_host::download::supervisor::DownloadSupervisor;
use idle_npu_host::paths::{server_addr, AppPaths, MonitorConfig};
use idle_npu_host::routes::{self, AppState, SharedAppState};
use idle_npu_host::session::SessionStore;
use idle_npu_host::sys_info;
use idle_npu_host::telemetry::NpuMonitor;
use idle_npu_host::worker::supervisor::WorkerSupervisor;
use idle_npu_host::{i18n, logger};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--worker") {
        let data_dir = flag_value(&args, "--data-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| AppPaths::resolve().data_dir);
        idle_npu_host::worker::worker_main::run_worker(&data_dir);
        return;
    }

    if let Some(pos) = args.iter().position(|a| a == "--download") {
        if args.len() < pos + 4 {
            eprintln!("usage: idle-npu-host --download <repo_id> <cache_dir> <models_root>");
            std::process::exit(2);
        }
        idle_npu_host::download::child::run_download(
            &args[pos + 1],
            Path::new(&args[pos + 2]),
            Path::new(&args[pos + 3]),
        );
        return;
    }

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    if let Err(e) = runtime.block_on(serve()) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|pos| args.get(pos + 1))
        .cloned()
}

async fn serve() -> Result<(), String> {
    let paths = AppPaths::resolve();
    paths
        .ensure_dirs()
        .map_err(|e| format!("Cannot create data directories: {e}"))?;
    logger::init(paths.logs_dir.clone());

    let store = Arc::new(SessionStore::open(
        &paths.sessions_db,
        Some(&paths.legacy_sessions_file()),
    )?);
    let llm = WorkerSupervisor::new(paths.data_dir.clone());
    let downloads = DownloadSupervisor::new(
        paths.download_cache_dir.clone(),
        paths.models_dir.clone(),
    );
    let npu = NpuMonitor::new(MonitorConfig::from_env());
    let lang = Mutex::new(i18n::load_saved_lang(&paths.lang_file()));

    let state: SharedAppState = Arc::new(AppState {
        paths,
        store,
        llm,
        downloads,
        npu,
        lang,
    });

    let (host, port) = server_addr();
    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|_| format!("Invalid IDLE_NPU_HOST: {host}"))?;
    let addr = SocketAddr::new(ip, port);

    let make_svc = make_service_fn({
        let state = state.clone();
        move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
            }
        }
    });

    sys_info!("API server listening on http://{}", addr);
    println!("Idle NPU host listening on http://{addr}");

    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| e.to_string())
}

async fn handle_request(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/health") => routes::health::handle().await?,

        // Configuration + i18n
        (&Method::GET, "/api/config") => routes::config::handle_get_config(state).await?,
        (&Method::GET, "/api/i18n") => routes::config::handle_i18n_list().await?,
        (&Method::GET, path) if path.starts_with("/api/i18n/") => {
            let lang = path.trim_start_matches("/api/i18n/");
            routes::config::handle_i18n_dictionary(lang).await?
        }
        (&Method::GET, "/api/lang") => routes::config::handle_get_lang(state).await?,
        (&Method::POST, "/api/lang") => routes::config::handle_set_lang(req, state).await?,

        // Models
        (&Method::GET, "/api/models/local") => {
            routes::models::handle_local_models(state).await?
        }
        (&Method::GET, "/api/models/config") => {
            routes::models::handle_model_config(req, state).await?
        }
        (&Method::POST, "/api/models/load") => {
            routes::models::handle_model_load(req, state).await?
        }
        (&Method::POST, "/api/models/delete") => {
            routes::models::handle_model_delete(req, state).await?
        }
        (&Method::GET, "/api/models/status") => {
            routes::models::handle_model_status(state).await?
        }

        // Sessions
        (&Method::GET, "/api/sessions") => routes::sessions::handle_list(state).await?,
        (&Method::POST, "/api/sessions") => routes::sessions::handle_create(req, state).await?,
        (&Method::PUT, path) if path.starts_with("/api/sessions/") => {
            let id = session_id(path, None);
            routes::sessions::handle_rename(req, &id, state).await?
        }
        (&Method::DELETE, path) if path.starts_with("/api/sessions/") => {
            let id = session_id(path, None);
            routes::sessions::handle_delete(&id, state).await?
        }
        (&Method::GET, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/messages") =>
        {
            let id = session_id(path, Some("/messages"));
            routes::sessions::handle_messages(&id, state).await?
        }
        (&Method::GET, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/size") =>
        {
            let id = session_id(path, Some("/size"));
            routes::sessions::handle_size(&id, state).await?
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/select") =>
        {
            let id = session_id(path, Some("/select"));
            routes::sessions::handle_select(&id, state).await?
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/clear") =>
        {
            let id = session_id(path, Some("/clear"));
            routes::sessions::handle_clear(&id, state).await?
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/messages/edit") =>
        {
            let id = session_id(path, Some("/messages/edit"));
            routes::sessions::handle_edit(req, &id, state).await?
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/messages/retry") =>
        {
            let id = session_id(path, Some("/messages/retry"));
            routes::sessions::handle_retry(req, &id, state).await?
        }

        // Chat
        (&Method::POST, "/api/chat/stream") => {
            routes::chat::handle_chat_stream(req, state).await?
        }
        (&Method::POST, "/api/chat/regenerate") => {
            routes::chat::handle_chat_regenerate(req, state).await?
        }
        (&Method::POST, "/api/chat/stop") => routes::chat::handle_chat_stop(state).await?,

        // Downloads
        (&Method::POST, "/api/download/stream") => {
            routes::download::handle_download_stream(req, state).await?
        }
        (&Method::POST, "/api/download/stop") => {
            routes::download::handle_download_stop(state).await?
        }

        // Status + monitor + shutdown
        (&Method::GET, "/api/status") => routes::status::handle_status(state).await?,
        (&Method::POST, "/api/npu/start") => routes::status::handle_npu_start(state).await?,
        (&Method::GET, "/api/npu/status") => routes::status::handle_npu_status(state).await?,
        (&Method::POST, "/api/npu/stop") => routes::status::handle_npu_stop(state).await?,
        (&Method::POST, "/api/app/exit") => routes::status::handle_app_exit(state).await?,

        // CORS preflight
        (&Method::OPTIONS, _) => routes::static_files::handle_options().await?,

        // Static frontend
        (&Method::GET, "/") => routes::static_files::handle_index(state).await?,
        (&Method::GET, path) if path.starts_with("/tray") => {
            routes::static_files::handle_tray(path, state).await?
        }
        (&Method::GET, path) if path.starts_with("/static/") => {
            routes::static_files::handle_static_asset(path, state).await?
        }

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap(),
    };

    Ok(response)
}

/// Pull the `{id}` segment out of `/api/sessions/{id}[suffix]`.
fn session_id(path: &str, suffix: Option<&str>) -> String {
    let rest = path.trim_start_matches("/api/sessions/");
    let rest = match suffix {
        Some(suffix) => rest.strip_suffix(suffix).unwrap_or(rest),
        None => rest,
    };
    urlencoding::decode(rest)
        .map(|s| s.to_string())
        .unwrap_or_else(|_| rest.to_string())
}
