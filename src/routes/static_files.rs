// Static frontend serving route handlers

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use hyper::{Body, Response, StatusCode};
use tokio::fs;

use crate::response_helpers::cors_preflight;

use super::SharedAppState;

fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".js") {
        "application/javascript"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else if path.ends_with(".json") {
        "application/json"
    } else if path.ends_with(".ico") {
        "image/x-icon"
    } else if path.ends_with(".html") || path.ends_with(".htm") {
        "text/html"
    } else {
        "application/octet-stream"
    }
}

async fn serve_file(file: PathBuf, name: &str) -> Response<Body> {
    match fs::read(&file).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type_for(name))
            // The shell reloads the bundle on every update
            .header("cache-control", "no-store")
            .body(Body::from(content))
            .unwrap(),
        Err(_) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap(),
    }
}

/// GET /
pub async fn handle_index(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    Ok(serve_file(state.paths.frontend_dir.join("index.html"), "index.html").await)
}

/// GET /tray, /tray.html, /tray.css, /tray.js
pub async fn handle_tray(path: &str, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let name = match path {
        "/tray" | "/tray.html" => "tray.html",
        "/tray.css" => "tray.css",
        "/tray.js" => "tray.js",
        _ => return Ok(not_found()),
    };
    Ok(serve_file(state.paths.frontend_dir.join(name), name).await)
}

/// GET /static/*
pub async fn handle_static_asset(
    path: &str,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let rel = path.trim_start_matches("/static/");
    // Reject anything that could escape the frontend dir
    if rel.split('/').any(|part| part == "..") || Path::new(rel).is_absolute() {
        return Ok(not_found());
    }
    Ok(serve_file(state.paths.frontend_dir.join(rel), rel).await)
}

pub async fn handle_options() -> Result<Response<Body>, Infallible> {
    Ok(cors_preflight())
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not Found"))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("style.css"), "text/css");
        assert_eq!(content_type_for("index.html"), "text/html");
        assert_eq!(content_type_for("model.bin"), "application/octet-stream");
    }
}
