// Route handler modules

pub mod health;
pub mod models;
pub mod running;

use std::convert::Infallible;
use std::time::Instant;

use hyper::{Body, Method, Request, Response, StatusCode};
use log::{error, info};

use super::error::{Result, ServeError};
use super::model_registry::SharedModelRegistry;
use super::request::extract_path_param;
use super::response_helpers::{cors_preflight, json_error};

/// Resources the server knows, independent of the method.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Models,
    Running,
    RunningModel(String),
    Model(String),
}

impl Route {
    fn parse(path: &str) -> Option<Self> {
        let path = match path.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => trimmed,
            _ => path,
        };
        match path {
            "/health" => Some(Route::Health),
            "/models" => Some(Route::Models),
            "/models/running" => Some(Route::Running),
            _ => extract_path_param(path, "/models/running/")
                .map(|id| Route::RunningModel(id.to_string()))
                .or_else(|| extract_path_param(path, "/models/").map(|id| Route::Model(id.to_string()))),
        }
    }
}

/// Entry point for every HTTP request.
pub async fn handle_request(
    req: Request<Body>,
    registry: SharedModelRegistry,
) -> std::result::Result<Response<Body>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match dispatch(req, &registry).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    };

    info!(
        "{method} {path} {} {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    Ok(response)
}

async fn dispatch(req: Request<Body>, registry: &SharedModelRegistry) -> Result<Response<Body>> {
    if req.method() == Method::OPTIONS {
        return Ok(cors_preflight());
    }
    let Some(route) = Route::parse(req.uri().path()) else {
        return Ok(json_error(StatusCode::NOT_FOUND, "not found"));
    };

    match (req.method().clone(), route) {
        (Method::GET, Route::Health) => Ok(health::handle()),
        (Method::GET, Route::Models) => Ok(models::list(registry)),
        (Method::POST, Route::Models) => models::fit(req, registry).await,
        (Method::GET, Route::Running) => Ok(running::list(registry)),
        (Method::POST | Method::PUT, Route::Running) => running::start(req, registry).await,
        (Method::DELETE, Route::RunningModel(id)) => running::stop(&id, registry).await,
        (Method::GET, Route::Model(id)) => models::status(&id, registry).await,
        (Method::POST | Method::PUT, Route::Model(id)) => models::predict(&id, req, registry).await,
        _ => Ok(json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
    }
}

fn error_response(e: &ServeError) -> Response<Body> {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_invalid_request() {
        StatusCode::BAD_REQUEST
    } else {
        error!("request failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    json_error(status, &e.to_string())
}
