//! Route — `/Plugin.*` and `/LogDriver.*` handlers.
//!
//! Docker posts JSON with a plugin-specific content type, so bodies are
//! taken as raw bytes and parsed here. Failures are reported in the `Err`
//! field with status 200, which is what the daemon reads.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_stream::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::pipeline::{ContainerInfo, PipelineManager};
use crate::store::ReadConfig;
use super::map::{
    stored_to_frame, ActivateResponse, CapabilitiesResponse, Capability, PluginResponse,
    ReadLogsRequest, StartLoggingRequest, StopLoggingRequest,
};

const LOG_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

pub fn router(manager: Arc<PipelineManager>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/LogDriver.Capabilities", post(capabilities))
        .route("/LogDriver.StartLogging", post(start_logging))
        .route("/LogDriver.StopLogging", post(stop_logging))
        .route("/LogDriver.ReadLogs", post(read_logs))
        .with_state(manager)
}

fn parse<T: DeserializeOwned>(route: &str, body: &[u8]) -> Result<T, PluginResponse> {
    serde_json::from_slice(body).map_err(|e| {
        error!(route, error = %e, "Malformed plugin request");
        PluginResponse::error(format!("invalid request body: {}", e))
    })
}

async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["LoggingDriver"],
    })
}

async fn capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        cap: Capability { read_logs: true },
    })
}

async fn start_logging(
    State(manager): State<Arc<PipelineManager>>,
    body: Bytes,
) -> Json<PluginResponse> {
    let req: StartLoggingRequest = match parse("StartLogging", &body) {
        Ok(req) => req,
        Err(resp) => return Json(resp),
    };
    let info = ContainerInfo::from(req.info);
    info!(container_id = %info.id, file = %req.file, "StartLogging");

    let result = manager.start_logging(&req.file, info).await;
    if let Err(e) = &result {
        error!(file = %req.file, error = %e, "StartLogging failed");
    }
    Json(result.into())
}

async fn stop_logging(
    State(manager): State<Arc<PipelineManager>>,
    body: Bytes,
) -> Json<PluginResponse> {
    let req: StopLoggingRequest = match parse("StopLogging", &body) {
        Ok(req) => req,
        Err(resp) => return Json(resp),
    };
    info!(file = %req.file, "StopLogging");
    Json(manager.stop_logging(&req.file).into())
}

async fn read_logs(State(manager): State<Arc<PipelineManager>>, body: Bytes) -> Response {
    let req: ReadLogsRequest = match parse("ReadLogs", &body) {
        Ok(req) => req,
        Err(resp) => return Json(resp).into_response(),
    };
    let container_id = req.info.container_id.clone();
    let config = ReadConfig::from(req.config);
    debug!(container_id = %container_id, ?config, "ReadLogs");

    let entries = match manager.read_logs(&container_id, config) {
        Ok(entries) => entries,
        Err(e) => {
            error!(container_id = %container_id, error = %e, "ReadLogs failed");
            return Json(PluginResponse::error(e)).into_response();
        }
    };

    let frames = entries.map(|entry| {
        entry
            .map_err(axum::Error::new)
            .and_then(|entry| stored_to_frame(entry).map_err(axum::Error::new))
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, LOG_STREAM_CONTENT_TYPE)],
        Body::from_stream(frames),
    )
        .into_response()
}
