// Model route handlers: listing, fitting, status and prediction

use std::io;

use hyper::{Body, Request, Response, StatusCode};
use serde_json::{json, Value};

use crate::web::error::{Result, ServeError};
use crate::web::model_registry::SharedModelRegistry;
use crate::web::models::{Prediction, PredictRequest, TrainingRequest};
use crate::web::request::parse_json;
use crate::web::response_helpers::json_response;
use crate::web::worker::ipc_types::Payload;

/// GET /models
pub fn list(registry: &SharedModelRegistry) -> Response<Body> {
    json_response(StatusCode::OK, &registry.list())
}

/// POST /models: accept the training data and fit in the background.
pub async fn fit(req: Request<Body>, registry: &SharedModelRegistry) -> Result<Response<Body>> {
    let request: TrainingRequest = parse_json(req).await?;
    request.validate()?;

    // The job reports its own outcome in the log.
    let (record, _job) = registry.submit_fit(request);
    Ok(json_response(StatusCode::ACCEPTED, &json!({ "model_id": record.id })))
}

/// GET /models/<id>
pub async fn status(id: &str, registry: &SharedModelRegistry) -> Result<Response<Body>> {
    let model = registry.load(id).await?;
    Ok(json_response(StatusCode::OK, &model.record()))
}

/// POST|PUT /models/<id>: forward the rows to the model's worker.
pub async fn predict(
    id: &str,
    req: Request<Body>,
    registry: &SharedModelRegistry,
) -> Result<Response<Body>> {
    let mut request: PredictRequest = parse_json(req).await?;
    request.validate()?;
    request.model_id = Some(id.to_string());

    let model = registry.get(id).await?;
    let payload = serde_json::to_vec(&request).map_err(io::Error::from)?;
    let reply = model.call(Payload::from(payload)).await?;

    let labels = decode_reply(id, &reply)?;
    Ok(json_response(
        StatusCode::OK,
        &Prediction {
            model_id: id.to_string(),
            labels,
        },
    ))
}

/// Workers answer with JSON; an `{"error": ...}` object means the worker
/// rejected the rows.
fn decode_reply(id: &str, reply: &Payload) -> Result<Value> {
    let value: Value = serde_json::from_slice(reply.as_bytes()).map_err(|e| ServeError::Ipc {
        model_id: id.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(ServeError::InvalidRequest(message.to_string()));
    }
    Ok(value)
}
