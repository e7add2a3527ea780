// Reusable HTTP response builders for the route handlers

use hyper::{Body, Response, StatusCode};
use serde::Serialize;

const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"detail":"Serialization failed"}"#.to_string());
    with_cors(Response::builder().status(status))
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

/// Build a JSON error response with a `detail` string
pub fn json_error(status: StatusCode, detail: &str) -> Response<Body> {
    let json = format!(r#"{{"detail":"{}"}}"#, detail.replace('"', "\\\""));
    with_cors(Response::builder().status(status))
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

/// Build a raw JSON string response
pub fn json_raw(status: StatusCode, json: String) -> Response<Body> {
    with_cors(Response::builder().status(status))
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    with_cors(Response::builder().status(StatusCode::OK))
        .body(Body::empty())
        .unwrap()
}

/// Build a Server-Sent Events response around a streaming body
pub fn sse_response(body: Body) -> Response<Body> {
    with_cors(Response::builder().status(StatusCode::OK))
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no") // Disable proxy buffering
        .body(body)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_shape() {
        let response = json_error(StatusCode::NOT_FOUND, "Session not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_json_error_escapes_quotes() {
        let response = json_error(StatusCode::BAD_REQUEST, r#"bad "path""#);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_sse_headers() {
        let response = sse_response(Body::empty());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
        assert_eq!(response.headers().get("connection").unwrap(), "keep-alive");
    }
}
