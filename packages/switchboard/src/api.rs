//! API endpoint handlers for the service.
//!
//! ## Dependency injection
//!
//! Handlers receive their dependencies through [`aerosol`]'s
//! [`Dep`](aerosol::axum::Dep) extractor. [`State`] lists what is available;
//! build it with `Aero::new().with(..)` in reverse order of the list.
//!
//! ## Response types
//!
//! Each handler returns its own response enum implementing
//! [`IntoResponse`](axum::response::IntoResponse), so the set of possible
//! answers of an endpoint is visible in its signature.

use std::time::Duration;

use aerosol::Aero;
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::error;

use crate::error::BrokerError;

pub mod v1;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_SIZE: usize = 1024 * 1024;

pub type State = Aero![
    crate::integration::Integrations,
    crate::device::DeviceFlow,
    crate::auth::CallerPolicy,
];

pub fn router(state: State) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .route("/health", get(v1::health::handle))
        .nest("/api/v1", v1::router())
        .layer(middleware)
        .with_state(state)
}

/// Render a domain error with the status code it maps to.
pub(crate) fn failure(error: BrokerError) -> Response {
    let status = error.status();
    if status.is_server_error() {
        error!(%error, "api.request.error");
    }
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

fn panic_response(_: Box<dyn std::any::Any + Send + 'static>) -> Response<String> {
    error!("api.request.panic");
    let mut response = Response::new(String::from("internal server error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
