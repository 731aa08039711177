// Running-model route handlers: start, stop and list workers

use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::web::error::Result;
use crate::web::model_registry::SharedModelRegistry;
use crate::web::request::parse_json;
use crate::web::response_helpers::json_response;

#[derive(Debug, Deserialize)]
struct StartRequest {
    model_id: String,
}

/// GET /models/running
pub fn list(registry: &SharedModelRegistry) -> Response<Body> {
    json_response(StatusCode::OK, &registry.running())
}

/// POST|PUT /models/running
pub async fn start(req: Request<Body>, registry: &SharedModelRegistry) -> Result<Response<Body>> {
    let StartRequest { model_id } = parse_json(req).await?;
    let model = registry.get(&model_id).await?;
    Ok(json_response(StatusCode::CREATED, &model.record()))
}

/// DELETE /models/running/<id>
pub async fn stop(id: &str, registry: &SharedModelRegistry) -> Result<Response<Body>> {
    registry.stop(id).await?;
    Ok(json_response(StatusCode::ACCEPTED, &json!({ "model_id": id })))
}
