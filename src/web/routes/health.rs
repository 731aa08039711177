// Health check route handler

use hyper::{Body, Response, StatusCode};

use crate::web::response_helpers::json_raw;

pub fn handle() -> Response<Body> {
    json_raw(
        StatusCode::OK,
        r#"{"status":"ok","service":"mlserve"}"#.to_string(),
    )
}
