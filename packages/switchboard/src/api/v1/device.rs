//! Device authorization endpoints (RFC 8628 style).

use aerosol::axum::Dep;
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use clients::switchboard::v1::device::{
    DeviceAuthorizeRequest, DeviceCodeResponse, DeviceErrorCode, DeviceErrorResponse,
    DeviceTokenRequest, RefreshTokenRequest, RevokeTokenRequest, TokenResponse,
};
use color_eyre::Report;
use tracing::error;

use crate::{
    api::{
        State,
        v1::{Unauthenticated, authenticate},
    },
    auth::{CallerCredentials, CallerPolicy, RawToken},
    db::AuthorizeOutcome,
    device::{DeviceFlow, PollOutcome},
    rate_limit,
};

pub fn router() -> Router<State> {
    let code = Router::new()
        .route("/code", post(code))
        .layer(rate_limit::device_code());
    let tokens = Router::new()
        .route("/token", post(token))
        .route("/refresh", post(refresh))
        .route("/revoke", post(revoke))
        .layer(rate_limit::device_token());

    Router::new()
        .route("/authorize", post(authorize))
        .merge(code)
        .merge(tokens)
}

fn rejected(code: DeviceErrorCode, description: &str) -> Response {
    let body = DeviceErrorResponse::builder()
        .error(code)
        .error_description(description)
        .build();
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Start a device authorization. No authentication.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/device/code
/// ```
#[tracing::instrument(skip(device))]
pub async fn code(Dep(device): Dep<DeviceFlow>) -> CodeResponse {
    match device.initiate().await {
        Ok(response) => CodeResponse::Success(response),
        Err(error) => {
            error!(?error, "device.code.error");
            CodeResponse::Error(error)
        }
    }
}

#[derive(Debug)]
pub enum CodeResponse {
    Success(DeviceCodeResponse),
    Error(Report),
}

impl IntoResponse for CodeResponse {
    fn into_response(self) -> Response {
        match self {
            CodeResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            CodeResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

/// Poll for the tokens of a device authorization.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/device/token
/// { "device_code": "..." }
/// ```
///
/// ## Responses
/// - 200: the token pair; returned by exactly one poll
/// - 400: `authorization_pending`, `expired_token` or `invalid_device_code`
#[tracing::instrument(skip_all)]
pub async fn token(
    Dep(device): Dep<DeviceFlow>,
    Json(request): Json<DeviceTokenRequest>,
) -> PollResponse {
    match device.poll(&RawToken::new(request.device_code)).await {
        Ok(PollOutcome::Issued(tokens)) => PollResponse::Issued(tokens),
        Ok(PollOutcome::Rejected(code)) => PollResponse::Rejected(code),
        Err(error) => {
            error!(?error, "device.token.error");
            PollResponse::Error(error)
        }
    }
}

#[derive(Debug)]
pub enum PollResponse {
    Issued(TokenResponse),
    Rejected(DeviceErrorCode),
    Error(Report),
}

impl IntoResponse for PollResponse {
    fn into_response(self) -> Response {
        match self {
            PollResponse::Issued(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
            PollResponse::Rejected(code) => {
                let description = match code {
                    DeviceErrorCode::AuthorizationPending => "the user has not approved the device yet",
                    DeviceErrorCode::ExpiredToken => "the device code expired",
                    _ => "the device code is unknown or already used",
                };
                rejected(code, description)
            }
            PollResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

/// Approve a device on behalf of the authenticated caller.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/device/authorize
/// { "user_code": "BCDF-GHJK" }
/// ```
///
/// ## Responses
/// - 204: approved; the device's next poll receives tokens
/// - 400: `invalid_user_code`
/// - 401: no caller identity
#[tracing::instrument(skip_all)]
pub async fn authorize(
    Dep(device): Dep<DeviceFlow>,
    Dep(policy): Dep<CallerPolicy>,
    credentials: CallerCredentials,
    Json(request): Json<DeviceAuthorizeRequest>,
) -> AuthorizeResponse {
    let caller = match authenticate(&credentials, &policy, &device).await {
        Ok(caller) => caller,
        Err(rejection) => return AuthorizeResponse::Unauthenticated(rejection),
    };
    match device.authorize(&request.user_code, &caller).await {
        Ok(AuthorizeOutcome::Authorized) => AuthorizeResponse::Success,
        Ok(AuthorizeOutcome::Expired | AuthorizeOutcome::NotFound) => {
            AuthorizeResponse::InvalidUserCode
        }
        Err(error) => {
            error!(?error, "device.authorize.error");
            AuthorizeResponse::Error(error)
        }
    }
}

#[derive(Debug)]
pub enum AuthorizeResponse {
    Success,
    InvalidUserCode,
    Unauthenticated(Unauthenticated),
    Error(Report),
}

impl IntoResponse for AuthorizeResponse {
    fn into_response(self) -> Response {
        match self {
            AuthorizeResponse::Success => StatusCode::NO_CONTENT.into_response(),
            AuthorizeResponse::InvalidUserCode => rejected(
                DeviceErrorCode::InvalidUserCode,
                "the user code is unknown, expired, or already approved",
            ),
            AuthorizeResponse::Unauthenticated(rejection) => rejection.into_response(),
            AuthorizeResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

/// Rotate a token pair.
///
/// ## Endpoint
/// ```text
/// POST /api/v1/device/refresh
/// { "refresh_token": "..." }
/// ```
#[tracing::instrument(skip_all)]
pub async fn refresh(
    Dep(device): Dep<DeviceFlow>,
    Json(request): Json<RefreshTokenRequest>,
) -> RefreshResponse {
    match device.refresh(&RawToken::new(request.refresh_token)).await {
        Ok(Some(tokens)) => RefreshResponse::Success(tokens),
        Ok(None) => RefreshResponse::InvalidGrant,
        Err(error) => {
            error!(?error, "device.refresh.error");
            RefreshResponse::Error(error)
        }
    }
}

#[derive(Debug)]
pub enum RefreshResponse {
    Success(TokenResponse),
    InvalidGrant,
    Error(Report),
}

impl IntoResponse for RefreshResponse {
    fn into_response(self) -> Response {
        match self {
            RefreshResponse::Success(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
            RefreshResponse::InvalidGrant => rejected(
                DeviceErrorCode::InvalidGrant,
                "the refresh token is unknown, rotated, expired, or revoked",
            ),
            RefreshResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

/// Revoke a token pair by either of its tokens.
///
/// Unknown tokens are not an error (RFC 7009).
///
/// ## Endpoint
/// ```text
/// POST /api/v1/device/revoke
/// { "token": "..." }
/// ```
#[tracing::instrument(skip_all)]
pub async fn revoke(
    Dep(device): Dep<DeviceFlow>,
    Json(request): Json<RevokeTokenRequest>,
) -> RevokeResponse {
    match device.revoke(&RawToken::new(request.token)).await {
        Ok(_) => RevokeResponse::Success,
        Err(error) => {
            error!(?error, "device.revoke.error");
            RevokeResponse::Error(error)
        }
    }
}

#[derive(Debug)]
pub enum RevokeResponse {
    Success,
    Error(Report),
}

impl IntoResponse for RevokeResponse {
    fn into_response(self) -> Response {
        match self {
            RevokeResponse::Success => StatusCode::OK.into_response(),
            RevokeResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}
