//! Endpoints for integrations that already exist.

use aerosol::axum::Dep;
use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clients::switchboard::v1::{IntegrationList, IntegrationView};
use uuid::Uuid;

use crate::{
    api::{
        State, failure,
        v1::{Unauthenticated, authenticate},
    },
    auth::{CallerCredentials, CallerPolicy, IntegrationId},
    device::DeviceFlow,
    error::BrokerError,
    integration::Integrations,
};

pub fn router() -> Router<State> {
    Router::new()
        .route("/", get(list))
        .route("/{id}", get(status).delete(revoke))
        .route("/{id}/validate", post(validate))
        .route("/{id}/refresh", post(refresh))
}

/// List the integrations of the caller's organization.
///
/// ## Endpoint
/// ```text
/// GET /api/v1/integrations
/// ```
#[tracing::instrument(skip_all)]
pub async fn list(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
) -> ListResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return ListResponse::Unauthenticated(rejection),
    };
    match integrations.list(&caller).await {
        Ok(list) => ListResponse::Success(
            IntegrationList::builder()
                .integrations(list.iter().map(|integration| integration.view()))
                .build(),
        ),
        Err(error) => ListResponse::Failed(error),
    }
}

#[derive(Debug)]
pub enum ListResponse {
    Success(IntegrationList),
    Unauthenticated(Unauthenticated),
    Failed(BrokerError),
}

impl IntoResponse for ListResponse {
    fn into_response(self) -> Response {
        match self {
            ListResponse::Success(list) => (StatusCode::OK, Json(list)).into_response(),
            ListResponse::Unauthenticated(rejection) => rejection.into_response(),
            ListResponse::Failed(error) => failure(error),
        }
    }
}

/// Answer shared by the endpoints that return a single integration.
#[derive(Debug)]
pub enum IntegrationResponse {
    Success(IntegrationView),
    Unauthenticated(Unauthenticated),
    Failed(BrokerError),
}

impl IntoResponse for IntegrationResponse {
    fn into_response(self) -> Response {
        match self {
            IntegrationResponse::Success(view) => (StatusCode::OK, Json(view)).into_response(),
            IntegrationResponse::Unauthenticated(rejection) => rejection.into_response(),
            IntegrationResponse::Failed(error) => failure(error),
        }
    }
}

/// Current status of one integration.
///
/// ## Endpoint
/// ```text
/// GET /api/v1/integrations/{id}
/// ```
#[tracing::instrument(skip(integrations, device, policy, credentials))]
pub async fn status(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Path(id): Path<Uuid>,
) -> IntegrationResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return IntegrationResponse::Unauthenticated(rejection),
    };
    match integrations.get(IntegrationId::from(id), &caller).await {
        Ok(integration) => IntegrationResponse::Success(integration.view()),
        Err(error) => IntegrationResponse::Failed(error),
    }
}

/// Validate an integration's credentials with the provider now.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/integrations/{id}/validate
/// ```
///
/// ## Responses
/// - 200: the credentials work; the integration is returned
/// - 422: the provider rejected the credentials; the integration is now `error`
/// - 502: the provider could not be reached
#[tracing::instrument(skip(integrations, device, policy, credentials))]
pub async fn validate(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Path(id): Path<Uuid>,
) -> IntegrationResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return IntegrationResponse::Unauthenticated(rejection),
    };
    match integrations.validate(IntegrationId::from(id), &caller).await {
        Ok(integration) => IntegrationResponse::Success(integration.view()),
        Err(error) => IntegrationResponse::Failed(error),
    }
}

/// Refresh an integration's credentials now.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/integrations/{id}/refresh
/// ```
///
/// ## Responses
/// - 200: refreshed
/// - 409: the connector cannot refresh; re-authorize instead
#[tracing::instrument(skip(integrations, device, policy, credentials))]
pub async fn refresh(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Path(id): Path<Uuid>,
) -> IntegrationResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return IntegrationResponse::Unauthenticated(rejection),
    };
    match integrations.refresh(IntegrationId::from(id), &caller).await {
        Ok(integration) => IntegrationResponse::Success(integration.view()),
        Err(error) => IntegrationResponse::Failed(error),
    }
}

/// Revoke and delete an integration.
///
/// ## Endpoint
/// ```text
/// DELETE /api/v1/integrations/{id}
/// ```
///
/// ## Responses
/// - 204: deleted (provider-side revocation is best effort)
/// - 404: no such integration in the caller's organization
#[tracing::instrument(skip(integrations, device, policy, credentials))]
pub async fn revoke(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Path(id): Path<Uuid>,
) -> RevokeResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return RevokeResponse::Unauthenticated(rejection),
    };
    match integrations.revoke(IntegrationId::from(id), &caller).await {
        Ok(()) => RevokeResponse::Success,
        Err(error) => RevokeResponse::Failed(error),
    }
}

#[derive(Debug)]
pub enum RevokeResponse {
    Success,
    Unauthenticated(Unauthenticated),
    Failed(BrokerError),
}

impl IntoResponse for RevokeResponse {
    fn into_response(self) -> Response {
        match self {
            RevokeResponse::Success => StatusCode::NO_CONTENT.into_response(),
            RevokeResponse::Unauthenticated(rejection) => rejection.into_response(),
            RevokeResponse::Failed(error) => failure(error),
        }
    }
}
