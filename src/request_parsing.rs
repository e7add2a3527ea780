// Request body/query parsing utilities for HTTP handlers

use hyper::{Body, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;

use crate::response_helpers::json_error;
use crate::sys_error;

/// Parse a JSON request body into a typed structure.
///
/// Returns the deserialized value, or a ready-to-send 400 response.
pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
            ));
        }
    };

    match serde_json::from_slice::<T>(&body_bytes) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            sys_error!("JSON parsing error: {}", e);
            Err(json_error(StatusCode::BAD_REQUEST, "Invalid JSON format"))
        }
    }
}

/// Extract a query parameter from the URI, URL-decoded.
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    for param in query.split('&') {
        if let Some((param_key, param_value)) = param.split_once('=') {
            if param_key == key {
                return urlencoding::decode(param_value)
                    .ok()
                    .map(|s| s.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_query_param_url_encoded() {
        let uri: Uri = "/api/models/config?path=%2Fmodels%2Fqwen3"
            .parse()
            .unwrap();
        assert_eq!(
            get_query_param(&uri, "path"),
            Some("/models/qwen3".to_string())
        );
    }

    #[test]
    fn test_get_query_param_missing() {
        let uri: Uri = "/api/models/config?path=x".parse().unwrap();
        assert_eq!(get_query_param(&uri, "device"), None);
        let bare: Uri = "/api/models/config".parse().unwrap();
        assert_eq!(get_query_param(&bare, "path"), None);
    }
}
