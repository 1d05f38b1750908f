use aerosol::axum::Dep;
use axum::{http::StatusCode, response::IntoResponse};
use color_eyre::eyre::Report;
use tracing::error;

use crate::integration::Integrations;

/// Health check endpoint.
///
/// ## Validation
///
/// Validates that storage is reachable before responding.
#[tracing::instrument(skip(integrations))]
pub async fn handle(Dep(integrations): Dep<Integrations>) -> PingResponse {
    match integrations.ping().await {
        Ok(()) => PingResponse::Success,
        Err(err) => {
            error!(?err, "ping storage");
            PingResponse::Error(err)
        }
    }
}

#[derive(Debug)]
pub enum PingResponse {
    Success,
    Error(Report),
}

impl IntoResponse for PingResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            PingResponse::Success => StatusCode::OK.into_response(),
            PingResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}
