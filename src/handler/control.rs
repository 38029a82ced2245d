use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use relay_bus::{
    Pipeline, PipelineError, PipelineStatus,
    pipeline::{StartOutcome, StopOutcome, SwitchOutcome},
};
use serde::{Deserialize, Serialize};

use crate::handler::ApiJsonResult;

pub fn control_router() -> Router<Arc<Pipeline>> {
    Router::new()
        .route("/sources", get(list_sources))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/switch", post(switch_source))
        .route("/status", get(status))
        .route("/offer", post(offer))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StartRequest {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SwitchRequest {
    source: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OfferRequest {
    sdp: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnswerResponse {
    sdp: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusResponse<T> {
    status: T,
}

async fn list_sources(State(pipeline): State<Arc<Pipeline>>) -> Response {
    match pipeline.list_sources().await {
        Ok(sources) => Json(serde_json::json!({ "sources": sources })).into_response(),
        Err(e) => {
            log::error!("source discovery failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "source discovery failed",
                    "details": format!("{:#}", e),
                    "sources": [],
                })),
            )
                .into_response()
        }
    }
}

/// The body is optional; an empty body restarts the last source.
async fn start(
    State(pipeline): State<Arc<Pipeline>>,
    body: Option<Json<StartRequest>>,
) -> ApiJsonResult<StatusResponse<StartOutcome>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let status = pipeline.start(request.source).await?;
    Ok(Json(StatusResponse { status }))
}

async fn stop(State(pipeline): State<Arc<Pipeline>>) -> ApiJsonResult<StatusResponse<StopOutcome>> {
    let status = pipeline.stop().await?;
    Ok(Json(StatusResponse { status }))
}

async fn switch_source(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<SwitchRequest>,
) -> ApiJsonResult<StatusResponse<SwitchOutcome>> {
    let status = pipeline.switch_source(&request.source).await?;
    Ok(Json(StatusResponse { status }))
}

async fn status(State(pipeline): State<Arc<Pipeline>>) -> ApiJsonResult<PipelineStatus> {
    Ok(Json(pipeline.status().await?))
}

async fn offer(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<OfferRequest>,
) -> ApiJsonResult<AnswerResponse> {
    if let Some(kind) = request.kind.as_deref() {
        if kind != "offer" {
            return Err(PipelineError::Handshake(format!("expected an offer, got {}", kind)).into());
        }
    }
    let sdp = pipeline.offer(request.sdp).await?;
    Ok(Json(AnswerResponse {
        sdp,
        kind: "answer",
    }))
}

#[cfg(test)]
#[path = "control_test.rs"]
mod control_test;
