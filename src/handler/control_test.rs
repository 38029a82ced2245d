use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_bus::{Pipeline, PipelineConfig, pipeline::StartOutcome};

use super::{OfferRequest, StartRequest, StatusResponse};

fn pipeline() -> anyhow::Result<Arc<Pipeline>> {
    let config = PipelineConfig {
        capture_bin: PathBuf::from("/nonexistent/lite-relay/capture"),
        list_bin: PathBuf::from("/nonexistent/lite-relay/list"),
        encoder: None,
        discovery_timeout: Duration::from_millis(500),
        ..PipelineConfig::default()
    };
    Ok(Arc::new(Pipeline::new(config)?))
}

async fn json_body(response: Response) -> anyhow::Result<(StatusCode, serde_json::Value)> {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

#[test]
fn test_outcomes_serialize_as_status_strings() -> anyhow::Result<()> {
    let body = serde_json::to_value(StatusResponse {
        status: StartOutcome::AlreadyRunning,
    })?;
    assert_eq!(body, serde_json::json!({ "status": "already_running" }));
    Ok(())
}

#[test]
fn test_offer_request_accepts_browser_shape() -> anyhow::Result<()> {
    let request: OfferRequest = serde_json::from_str(r#"{"sdp":"v=0\r\n","type":"offer"}"#)?;
    assert_eq!(request.sdp, "v=0\r\n");
    assert_eq!(request.kind.as_deref(), Some("offer"));

    let request: OfferRequest = serde_json::from_str(r#"{"sdp":"v=0"}"#)?;
    assert!(request.kind.is_none());
    Ok(())
}

#[tokio::test]
async fn test_status_and_stop_while_idle() -> anyhow::Result<()> {
    let pipeline = pipeline()?;

    let response = super::status(State(Arc::clone(&pipeline)))
        .await
        .into_response();
    let (code, body) = json_body(response).await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["state"], "idle");
    assert_eq!(body["jpegEnabled"], false);

    let response = super::stop(State(Arc::clone(&pipeline))).await.into_response();
    let (code, body) = json_body(response).await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "status": "already_stopped" }));

    pipeline.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_start_without_any_source_is_bad_request() -> anyhow::Result<()> {
    let pipeline = pipeline()?;

    let response = super::start(State(Arc::clone(&pipeline)), None)
        .await
        .into_response();
    let (code, body) = json_body(response).await?;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_source");

    let response = super::start(
        State(Arc::clone(&pipeline)),
        Some(Json(StartRequest {
            source: Some("   ".into()),
        })),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    pipeline.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_offer_while_idle_conflicts() -> anyhow::Result<()> {
    let pipeline = pipeline()?;

    let response = super::offer(
        State(Arc::clone(&pipeline)),
        Json(OfferRequest {
            sdp: "v=0".into(),
            kind: Some("offer".into()),
        }),
    )
    .await
    .into_response();
    let (code, body) = json_body(response).await?;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "not_running");

    let response = super::offer(
        State(Arc::clone(&pipeline)),
        Json(OfferRequest {
            sdp: "v=0".into(),
            kind: Some("answer".into()),
        }),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    pipeline.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_discovery_failure_returns_empty_list() -> anyhow::Result<()> {
    let pipeline = pipeline()?;

    let response = super::list_sources(State(Arc::clone(&pipeline))).await;
    let (code, body) = json_body(response).await?;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["sources"], serde_json::json!([]));
    assert!(body["details"].is_string());

    pipeline.shutdown().await;
    Ok(())
}
