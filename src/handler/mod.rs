use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_bus::PipelineError;

pub mod control;
pub mod ws;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self.0.downcast_ref::<PipelineError>() {
            Some(e @ PipelineError::InvalidSource(_)) => (StatusCode::BAD_REQUEST, e.kind()),
            Some(e @ PipelineError::Handshake(_)) => (StatusCode::BAD_REQUEST, e.kind()),
            Some(e @ PipelineError::NotRunning) => (StatusCode::CONFLICT, e.kind()),
            Some(e @ PipelineError::Closed) => (StatusCode::SERVICE_UNAVAILABLE, e.kind()),
            Some(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.kind()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            log::error!("ApiError: {:?}", self.0);
        } else {
            log::debug!("ApiError: {:#}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "error": format!("{:#}", self.0),
                "kind": kind,
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
