//! Authorization endpoints, addressed by connector type.

use std::str::FromStr;

use aerosol::axum::Dep;
use axum::{
    Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clients::switchboard::v1::{
    AuthorizationIntent, ClaimInstallationRequest, ConnectorType, IntegrationView,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    api::{
        State, failure,
        v1::{Unauthenticated, authenticate},
    },
    auth::{CallerCredentials, CallerPolicy},
    device::DeviceFlow,
    error::BrokerError,
    integration::{AuthorizationData, Integrations},
};

pub fn router() -> Router<State> {
    Router::new()
        .route("/{connector}/initiate", post(initiate))
        .route("/{connector}/callback", get(callback))
        .route("/{connector}/claim", post(claim))
}

fn parse_connector(raw: &str) -> Result<ConnectorType, Response> {
    ConnectorType::from_str(raw).map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown connector: {raw}") })),
        )
            .into_response()
    })
}

/// Start authorizing a connector for the caller's organization.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/connectors/{connector}/initiate
/// ```
///
/// ## Responses
/// - 200: where to send the user
/// - 401: no caller identity
/// - 404: unknown or unconfigured connector
#[tracing::instrument(skip(integrations, device, policy, credentials))]
pub async fn initiate(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Path(connector): Path<String>,
) -> InitiateResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return InitiateResponse::Unauthenticated(rejection),
    };
    let connector = match parse_connector(&connector) {
        Ok(connector) => connector,
        Err(response) => return InitiateResponse::UnknownConnector(response),
    };

    match integrations.initiate(connector, &caller).await {
        Ok(intent) => InitiateResponse::Success(intent),
        Err(error) => InitiateResponse::Failed(error),
    }
}

#[derive(Debug)]
pub enum InitiateResponse {
    Success(AuthorizationIntent),
    Unauthenticated(Unauthenticated),
    UnknownConnector(Response),
    Failed(BrokerError),
}

impl IntoResponse for InitiateResponse {
    fn into_response(self) -> Response {
        match self {
            InitiateResponse::Success(intent) => (StatusCode::OK, Json(intent)).into_response(),
            InitiateResponse::Unauthenticated(rejection) => rejection.into_response(),
            InitiateResponse::UnknownConnector(response) => response,
            InitiateResponse::Failed(error) => failure(error),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    installation_id: Option<i64>,

    /// GitHub sends `install`, `update` or `request`.
    setup_action: Option<String>,
}

/// Provider redirect after the user approved access.
///
/// The caller is recovered from the signed `state`; no identity headers are
/// needed.
///
/// ## Endpoint
/// ```text
/// GET /api/v1/connectors/{connector}/callback?code=..&state=..
/// GET /api/v1/connectors/github/callback?installation_id=..&setup_action=install&state=..
/// ```
///
/// ## Responses
/// - 200: the new integration
/// - 202: the installation awaits approval by an organization owner
/// - 400: invalid state or rejected grant
/// - 409: the installation was already claimed
#[tracing::instrument(skip(integrations, params), fields(setup_action = ?params.setup_action))]
pub async fn callback(
    Dep(integrations): Dep<Integrations>,
    Path(connector): Path<String>,
    Query(params): Query<CallbackParams>,
) -> CallbackResponse {
    let connector = match parse_connector(&connector) {
        Ok(connector) => connector,
        Err(response) => return CallbackResponse::UnknownConnector(response),
    };
    if params.setup_action.as_deref() == Some("request") {
        info!("integration.callback.pending_approval");
        return CallbackResponse::PendingApproval;
    }

    let data = AuthorizationData {
        code: params.code,
        state: params.state,
        installation_id: params.installation_id,
    };
    match integrations.complete(connector, data).await {
        Ok(integration) => CallbackResponse::Success(integration.view()),
        Err(error) => {
            warn!(%error, "integration.callback.failed");
            CallbackResponse::Failed(error)
        }
    }
}

#[derive(Debug)]
pub enum CallbackResponse {
    Success(IntegrationView),
    PendingApproval,
    UnknownConnector(Response),
    Failed(BrokerError),
}

impl IntoResponse for CallbackResponse {
    fn into_response(self) -> Response {
        match self {
            CallbackResponse::Success(view) => (StatusCode::OK, Json(view)).into_response(),
            CallbackResponse::PendingApproval => (
                StatusCode::ACCEPTED,
                "installation is waiting for approval by an organization owner",
            )
                .into_response(),
            CallbackResponse::UnknownConnector(response) => response,
            CallbackResponse::Failed(error) => failure(error),
        }
    }
}

/// Claim an app installation that was reported before anyone linked it.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/connectors/{connector}/claim
/// { "installation_id": 42 }
/// ```
///
/// ## Responses
/// - 200: the new integration
/// - 401: no caller identity
/// - 409: already claimed or expired
#[tracing::instrument(skip(integrations, device, policy, credentials))]
pub async fn claim(
    Dep(integrations): Dep<Integrations>,
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Path(connector): Path<String>,
    Json(request): Json<ClaimInstallationRequest>,
) -> ClaimResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return ClaimResponse::Unauthenticated(rejection),
    };
    let connector = match parse_connector(&connector) {
        Ok(connector) => connector,
        Err(response) => return ClaimResponse::UnknownConnector(response),
    };

    match integrations
        .claim_installation(connector, request.installation_id, &caller)
        .await
    {
        Ok(integration) => ClaimResponse::Success(integration.view()),
        Err(error) => ClaimResponse::Failed(error),
    }
}

#[derive(Debug)]
pub enum ClaimResponse {
    Success(IntegrationView),
    Unauthenticated(Unauthenticated),
    UnknownConnector(Response),
    Failed(BrokerError),
}

impl IntoResponse for ClaimResponse {
    fn into_response(self) -> Response {
        match self {
            ClaimResponse::Success(view) => (StatusCode::OK, Json(view)).into_response(),
            ClaimResponse::Unauthenticated(rejection) => rejection.into_response(),
            ClaimResponse::UnknownConnector(response) => response,
            ClaimResponse::Failed(error) => failure(error),
        }
    }
}
