use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info};

use crate::{
    api::State,
    auth::{Caller, CallerCredentials, CallerPolicy},
    device::DeviceFlow,
};

pub mod connectors;
pub mod device;
pub mod health;
pub mod integrations;

pub fn router() -> Router<State> {
    Router::new()
        .nest("/connectors", connectors::router())
        .nest("/integrations", integrations::router())
        .nest("/device", device::router())
}

/// Why a request could not be tied to a caller.
#[derive(Debug)]
pub enum Unauthenticated {
    Missing,
    Error(color_eyre::Report),
}

impl IntoResponse for Unauthenticated {
    fn into_response(self) -> Response {
        match self {
            Unauthenticated::Missing => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "caller identity required" })),
            )
                .into_response(),
            Unauthenticated::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

/// Resolve request credentials into a caller or reject the request.
pub async fn authenticate(
    credentials: &CallerCredentials,
    policy: &CallerPolicy,
    device: &DeviceFlow,
) -> Result<Caller, Unauthenticated> {
    match credentials.resolve(policy, device).await {
        Ok(Some(caller)) => Ok(caller),
        Ok(None) => {
            info!("api.auth.rejected");
            Err(Unauthenticated::Missing)
        }
        Err(error) => {
            error!(?error, "api.auth.error");
            Err(Unauthenticated::Error(error))
        }
    }
}
