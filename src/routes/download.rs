// Download streaming route handlers

use std::convert::Infallible;

use hyper::body::Bytes;
use hyper::{Body, Request, Response, StatusCode};
use serde_json::json;

use crate::events::sse_frame;
use crate::models::DownloadRequest;
use crate::request_parsing::parse_json_body;
use crate::response_helpers::{json_error, json_response, sse_response};

use super::SharedAppState;

/// POST /api/download/stream: SSE of progress/log/error/finished/done.
pub async fn handle_download_stream(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: DownloadRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };
    if body.repo_id.trim().is_empty() {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Missing repo_id"));
    }

    let mut rx = match state.downloads.start(body.repo_id.trim()) {
        Ok(rx) => rx,
        Err(e) => return Ok(json_error(StatusCode::CONFLICT, &e)),
    };

    let (mut sender, stream_body) = Body::channel();

    tokio::spawn(async move {
        let mut client_gone = false;
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            if !client_gone {
                let frame = sse_frame(&event);
                if sender.send_data(Bytes::from(frame)).await.is_err() {
                    // The download keeps running; drain so the reader
                    // thread never blocks. Progress stays queryable via
                    // /api/status.
                    client_gone = true;
                }
            }
            if terminal {
                break;
            }
        }
    });

    Ok(sse_response(stream_body))
}

/// POST /api/download/stop
pub async fn handle_download_stop(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    state.downloads.stop();
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}
