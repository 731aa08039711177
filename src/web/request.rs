// Request parsing utilities for HTTP requests

use hyper::{Body, Request};
use log::debug;
use serde::de::DeserializeOwned;

use super::error::{Result, ServeError};

/// Read the whole request body and parse it as JSON.
pub async fn parse_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let body_bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ServeError::InvalidRequest(format!("failed to read request body: {e}")))?;

    serde_json::from_slice(&body_bytes).map_err(|e| {
        debug!("JSON parsing error: {e}");
        ServeError::InvalidRequest(format!("invalid JSON: {e}"))
    })
}

/// Extract path parameter from URI path
/// Example: extract_path_param("/models/running/abc", "/models/running/") => Some("abc")
pub fn extract_path_param<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Selection {
        model_id: String,
    }

    fn request(body: &str) -> Request<Body> {
        Request::post("/models/running")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_parse_json() {
        let parsed: Selection = parse_json(request(r#"{"model_id": "m1"}"#)).await.unwrap();
        assert_eq!(parsed.model_id, "m1");
    }

    #[tokio::test]
    async fn test_parse_json_rejects_garbage() {
        let err = parse_json::<Selection>(request("{")).await.unwrap_err();
        assert!(err.is_invalid_request());
        let err = parse_json::<Selection>(request("{}")).await.unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[test]
    fn test_extract_path_param() {
        assert_eq!(extract_path_param("/models/running/abc", "/models/running/"), Some("abc"));
        assert_eq!(extract_path_param("/models/abc", "/models/running/"), None);
        assert_eq!(extract_path_param("/models/", "/models/"), Some(""));
    }
}
