//! Identifiers and caller identity.
//!
//! Identity management lives outside this service: callers arrive either with
//! a bearer token minted by the device flow, or (when the operator trusts the
//! upstream console backend) with identity headers set by that backend.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
};
use color_eyre::Result;
use derive_more::{Debug, Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceFlow;

/// Header carrying the caller's organization when identity headers are
/// trusted.
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Header carrying the caller's user when identity headers are trusted.
pub const USER_HEADER: &str = "x-user-id";

/// An ID uniquely identifying an organization in the host product.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An ID uniquely identifying a user in the host product.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An ID uniquely identifying an integration.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    Deserialize,
    Serialize,
    From,
    Into,
)]
#[serde(transparent)]
pub struct IntegrationId(Uuid);

impl IntegrationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// An ID uniquely identifying a stored credential.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, From, Into)]
pub struct CredentialId(Uuid);

impl CredentialId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// An ID uniquely identifying a device authorization session.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, From, Into)]
pub struct DeviceSessionId(Uuid);

impl DeviceSessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// The authenticated organization and user behind a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Caller {
    pub organization_id: OrgId,
    pub user_id: UserId,
}

impl Caller {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: OrgId::new(organization_id),
            user_id: UserId::new(user_id),
        }
    }
}

/// How callers are allowed to identify themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallerPolicy {
    /// Accept [`ORGANIZATION_HEADER`] and [`USER_HEADER`] as the caller
    /// identity. Only safe behind a backend that strips them from user
    /// traffic.
    pub trust_identity_headers: bool,
}

/// A plaintext token supplied by a client.
///
/// Never logged; hash it with [`crate::crypto::TokenHash`] before storing or
/// looking it up.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
#[debug("RawToken(..)")]
pub struct RawToken(String);

impl RawToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// View the plaintext token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Unverified identity material extracted from a request.
///
/// Resolve it into a [`Caller`] with [`CallerCredentials::resolve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallerCredentials {
    Bearer(RawToken),
    Headers(Caller),
    Anonymous,
}

impl CallerCredentials {
    fn from_headers(headers: &HeaderMap) -> Result<Self, (StatusCode, &'static str)> {
        if let Some(header) = headers.get(AUTHORIZATION) {
            let Ok(value) = header.to_str() else {
                return Err((
                    StatusCode::BAD_REQUEST,
                    "Authorization header must be a string",
                ));
            };
            let token = match value.strip_prefix("Bearer") {
                Some(token) => token.trim(),
                None => value.trim(),
            };
            if token.is_empty() {
                return Err((StatusCode::UNAUTHORIZED, "Empty bearer token"));
            }
            return Ok(Self::Bearer(RawToken::new(token)));
        }

        let organization = headers
            .get(ORGANIZATION_HEADER)
            .and_then(|value| value.to_str().ok());
        let user = headers.get(USER_HEADER).and_then(|value| value.to_str().ok());
        match (organization, user) {
            (Some(organization), Some(user)) if !organization.is_empty() && !user.is_empty() => {
                Ok(Self::Headers(Caller::new(organization, user)))
            }
            _ => Ok(Self::Anonymous),
        }
    }

    /// Resolve the credentials into an authenticated caller.
    ///
    /// Returns `None` when the credentials do not identify anyone under the
    /// given policy.
    #[tracing::instrument(skip(self, device), fields(kind = self.kind()))]
    pub async fn resolve(&self, policy: &CallerPolicy, device: &DeviceFlow) -> Result<Option<Caller>> {
        match self {
            Self::Bearer(token) => device.authenticate(token).await,
            Self::Headers(caller) if policy.trust_identity_headers => Ok(Some(caller.clone())),
            Self::Headers(_) | Self::Anonymous => Ok(None),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Bearer(_) => "bearer",
            Self::Headers(_) => "headers",
            Self::Anonymous => "anonymous",
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CallerCredentials {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}
