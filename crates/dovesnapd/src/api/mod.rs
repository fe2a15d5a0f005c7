//! HTTP surfaces of the daemon.

pub mod plugin;
pub mod status;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use dovesnap_common::DovesnapError;

/// A failed request, rendered the way Docker expects plugin errors.
#[derive(Debug)]
pub struct ApiError(DovesnapError);

impl From<DovesnapError> for ApiError {
    fn from(err: DovesnapError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "Err": self.0.to_string() })),
        )
            .into_response()
    }
}
