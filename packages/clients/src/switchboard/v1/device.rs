//! Device authorization flow API types.
//!
//! These follow the shape of RFC 8628: a headless client requests a device
//! code, shows the user code to the user, and polls until the user approves
//! the request in a browser.

use bon::Builder;
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Response to a device code request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct DeviceCodeResponse {
    /// Secret code the device polls with. Never shown to the user.
    #[builder(into)]
    #[debug(skip)]
    pub device_code: String,

    /// Short code the user types into the verification page.
    #[builder(into)]
    pub user_code: String,

    #[builder(into)]
    pub verification_uri: String,

    /// Verification URI with the user code pre-filled.
    #[builder(into)]
    pub verification_uri_complete: String,

    /// Seconds until the device code expires.
    pub expires_in: u64,

    /// Minimum seconds between polls.
    pub interval: u64,
}

/// Poll request for a device token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct DeviceTokenRequest {
    #[builder(into)]
    #[debug(skip)]
    pub device_code: String,
}

/// Request by an authenticated user to approve a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct DeviceAuthorizeRequest {
    #[builder(into)]
    pub user_code: String,
}

/// Request to rotate a token pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct RefreshTokenRequest {
    #[builder(into)]
    #[debug(skip)]
    pub refresh_token: String,
}

/// Request to revoke a token pair using either of its tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct RevokeTokenRequest {
    #[builder(into)]
    #[debug(skip)]
    pub token: String,
}

/// An issued access/refresh token pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct TokenResponse {
    #[builder(into)]
    #[debug(skip)]
    pub access_token: String,

    #[builder(into)]
    #[debug(skip)]
    pub refresh_token: String,

    #[builder(into, default = "Bearer".to_owned())]
    pub token_type: String,

    /// Seconds until the access token expires.
    pub expires_in: u64,

    /// Seconds until the refresh token expires.
    pub refresh_token_expires_in: u64,
}

/// Error codes returned by the device flow endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceErrorCode {
    /// The user has not approved the device yet; keep polling.
    AuthorizationPending,

    /// The device code expired before it was approved.
    ExpiredToken,

    /// The device code is unknown or its tokens were already issued.
    InvalidDeviceCode,

    /// The refresh token is unknown, rotated, expired, or revoked.
    InvalidGrant,

    /// The user code is unknown, expired, or already approved.
    InvalidUserCode,
}

/// Error body returned by the device flow endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct DeviceErrorResponse {
    pub error: DeviceErrorCode,

    #[builder(into)]
    pub error_description: Option<String>,
}
