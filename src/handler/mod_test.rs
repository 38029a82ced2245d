use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse};
use relay_bus::PipelineError;

use super::ApiError;

fn status_of(err: impl Into<anyhow::Error>) -> StatusCode {
    ApiError::from(err).into_response().status()
}

#[test]
fn test_pipeline_errors_map_to_status_codes() {
    assert_eq!(
        status_of(PipelineError::InvalidSource("empty".into())),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        status_of(PipelineError::Handshake("bad sdp".into())),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(status_of(PipelineError::NotRunning), StatusCode::CONFLICT);
    assert_eq!(
        status_of(PipelineError::Closed),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        status_of(PipelineError::DiscoveryTimeout(Duration::from_secs(5))),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        status_of(PipelineError::Subprocess("exit 1".into())),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_context_does_not_hide_the_kind() {
    let err = anyhow::Error::new(PipelineError::NotRunning).context("offer");
    let (status, kind) = ApiError::from(err).status_and_kind();
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(kind, "not_running");
}

#[test]
fn test_other_errors_are_internal() {
    let (status, kind) = ApiError::from(anyhow::anyhow!("boom")).status_and_kind();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(kind, "internal");
}
