//! Switchboard v1 API types and client.

use std::collections::BTreeMap;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use time::OffsetDateTime;
use uuid::Uuid;

pub mod device;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{Client, DevicePoll};

/// The kind of external system an integration connects to.
///
/// The string form (`slack`, `github`) is used in URLs, in the database, and
/// on the wire.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
pub enum ConnectorType {
    #[serde(rename = "slack")]
    #[strum(serialize = "slack")]
    Slack,

    #[serde(rename = "github")]
    #[strum(serialize = "github")]
    GitHub,
}

/// Lifecycle status of an integration.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntegrationStatus {
    /// Authorization finished but credentials have not been validated yet.
    Pending,
    /// Credentials validated; events for this integration are routed.
    Active,
    /// The last validation failed.
    Error,
    /// The provider side revoked access (e.g. the app was uninstalled).
    Revoked,
}

/// Shape of the secret material stored for an integration.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CredentialKind {
    Oauth2,
    Token,
    Installation,
}

/// How the caller should continue an authorization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentKind {
    /// Send the user to an OAuth consent page.
    OauthRedirect,

    /// Send the user to an app installation page.
    AppInstall,
}

/// Where to send the user to start an authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct AuthorizationIntent {
    #[serde(rename = "type")]
    pub kind: IntentKind,

    #[builder(into)]
    pub url: String,
}

/// An integration as exposed over the API.
///
/// Never carries credential material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct IntegrationView {
    pub id: Uuid,

    #[builder(into)]
    pub organization_id: String,

    #[builder(into)]
    pub user_id: String,

    pub connector: ConnectorType,
    pub status: IntegrationStatus,

    #[builder(into)]
    pub connector_organization_id: Option<String>,

    #[builder(into)]
    pub connector_bot_id: Option<String>,

    #[builder(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

impl From<&IntegrationView> for IntegrationView {
    fn from(view: &IntegrationView) -> Self {
        view.clone()
    }
}

/// Response listing the integrations of an organization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder, Default)]
#[non_exhaustive]
pub struct IntegrationList {
    #[builder(default, with = |i: impl IntoIterator<Item = impl Into<IntegrationView>>| i.into_iter().map(Into::into).collect())]
    pub integrations: Vec<IntegrationView>,
}

/// Request to claim an app installation that arrived before its owner was
/// known.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ClaimInstallationRequest {
    pub installation_id: i64,
}
