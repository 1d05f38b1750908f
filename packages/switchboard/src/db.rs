//! Storage interface.
//!
//! The broker talks to storage through the traits in this module so that the
//! same services run against [`Postgres`] in production and [`Memory`] in
//! development and tests.
//!
//! # Serialization/Deserialization
//!
//! Types in this module do not implement `Serialize` or `Deserialize` because
//! they are internal implementation details. Public-facing shapes live in
//! [`clients::switchboard::v1`]; convert with methods like
//! [`Integration::view`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use clients::switchboard::v1::{ConnectorType, CredentialKind, IntegrationStatus, IntegrationView};
use color_eyre::Result;
use strum::{AsRefStr, Display, EnumString};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{Caller, CredentialId, DeviceSessionId, IntegrationId, OrgId, UserId},
    crypto::{KeyId, Sealed, TokenHash},
};

pub mod memory;
pub mod postgres;

pub use memory::Memory;
pub use postgres::Postgres;

// =============================================================================
// Records
// =============================================================================

/// A connection between an organization and an external system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Integration {
    pub id: IntegrationId,
    pub organization_id: OrgId,
    pub user_id: UserId,
    pub connector: ConnectorType,
    pub status: IntegrationStatus,

    /// The account on the provider side (Slack team, GitHub account).
    pub connector_organization_id: Option<String>,

    /// The bot or app identity acting on the provider side.
    pub connector_bot_id: Option<String>,

    pub metadata: BTreeMap<String, String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

impl Integration {
    /// The API representation of this integration.
    pub fn view(&self) -> IntegrationView {
        IntegrationView::builder()
            .id(self.id.as_uuid())
            .organization_id(self.organization_id.as_str())
            .user_id(self.user_id.as_str())
            .connector(self.connector)
            .status(self.status)
            .maybe_connector_organization_id(self.connector_organization_id.clone())
            .maybe_connector_bot_id(self.connector_bot_id.clone())
            .metadata(self.metadata.clone())
            .created_at(self.created_at)
            .updated_at(self.updated_at)
            .maybe_last_used_at(self.last_used_at)
            .build()
    }
}

/// Fields of an integration about to be created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewIntegration {
    pub organization_id: OrgId,
    pub user_id: UserId,
    pub connector: ConnectorType,
    pub connector_organization_id: Option<String>,
    pub connector_bot_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// An encrypted credential belonging to exactly one integration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub integration_id: IntegrationId,
    pub kind: CredentialKind,
    pub sealed: Sealed,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Credential material about to be stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCredential {
    pub kind: CredentialKind,
    pub sealed: Sealed,
    pub expires_at: Option<OffsetDateTime>,
}

/// An app installation reported by webhook before anyone claimed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnclaimedInstallation {
    pub id: Uuid,
    pub installation_id: i64,
    pub account_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub repository_selection: Option<String>,
    pub permissions: BTreeMap<String, String>,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub claimed_at: Option<OffsetDateTime>,
    pub claimed_by: Option<Caller>,
}

/// Fields of an installation about to be recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewInstallation {
    pub installation_id: i64,
    pub account_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub repository_selection: Option<String>,
    pub permissions: BTreeMap<String, String>,
    pub payload: serde_json::Value,
    pub expires_at: OffsetDateTime,
}

/// Result of trying to claim an installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the installation.
    Claimed(UnclaimedInstallation),

    /// Someone claimed it first.
    AlreadyClaimed,

    /// The installation expired before it was claimed.
    Expired,

    /// No webhook for this installation has been recorded.
    NotFound,
}

/// Lifecycle state of a device authorization session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    /// Waiting for a user to approve the user code.
    Pending,

    /// Approved; the next poll mints tokens.
    Authorized,

    /// Tokens were minted. The device code is spent.
    Issued,

    /// The token pair was revoked.
    Revoked,
}

/// A device authorization session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSession {
    pub id: DeviceSessionId,
    pub device_code_hash: TokenHash,
    pub user_code: String,
    pub status: DeviceStatus,
    pub expires_at: OffsetDateTime,
    pub interval_secs: u32,
    pub authorized_by: Option<Caller>,
    pub authorized_at: Option<OffsetDateTime>,
    pub access_token_hash: Option<TokenHash>,
    pub refresh_token_hash: Option<TokenHash>,
    pub access_expires_at: Option<OffsetDateTime>,
    pub refresh_expires_at: Option<OffsetDateTime>,
    pub issued_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Fields of a device session about to be created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDeviceSession {
    pub device_code_hash: TokenHash,
    pub user_code: String,
    pub expires_at: OffsetDateTime,
    pub interval_secs: u32,
}

/// Hashes and lifetimes of a freshly minted token pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access_token_hash: TokenHash,
    pub refresh_token_hash: TokenHash,
    pub access_expires_at: OffsetDateTime,
    pub refresh_expires_at: OffsetDateTime,
}

/// Result of approving a user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    Authorized,
    Expired,
    NotFound,
}

// =============================================================================
// Store traits
// =============================================================================

/// Integration rows.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    /// Create a `pending` integration together with its credential.
    async fn create_integration(
        &self,
        integration: NewIntegration,
        credential: NewCredential,
    ) -> Result<Integration>;

    async fn get_integration(&self, id: IntegrationId) -> Result<Option<Integration>>;

    /// All integrations of an organization, newest first.
    async fn list_integrations(&self, organization: &OrgId) -> Result<Vec<Integration>>;

    async fn list_integrations_by_status(
        &self,
        status: IntegrationStatus,
    ) -> Result<Vec<Integration>>;

    /// The non-revoked integration linked to a provider-side account,
    /// preferring an active one.
    async fn find_integration_by_account(
        &self,
        connector: ConnectorType,
        connector_organization_id: &str,
    ) -> Result<Option<Integration>>;

    /// Returns `false` if the integration does not exist.
    async fn set_integration_status(
        &self,
        id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<bool>;

    /// Mark an integration active, deleting any other active integration of
    /// the same organization and connector type.
    ///
    /// Returns the ids of the deleted integrations.
    async fn activate_integration(&self, id: IntegrationId) -> Result<Vec<IntegrationId>>;

    /// Record that the integration's credentials were used.
    async fn touch_integration(&self, id: IntegrationId, now: OffsetDateTime) -> Result<()>;

    /// Delete an integration and, by cascade, its credential.
    async fn delete_integration(&self, id: IntegrationId) -> Result<bool>;
}

/// Encrypted credential rows.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, integration: IntegrationId) -> Result<Option<CredentialRecord>>;

    /// Replace the credential of an integration while holding its row lock.
    async fn replace_credential(
        &self,
        integration: IntegrationId,
        credential: NewCredential,
    ) -> Result<CredentialRecord>;

    async fn delete_credential(&self, integration: IntegrationId) -> Result<bool>;

    /// Credentials sealed under any key other than `key_id`.
    async fn list_credentials_not_under_key(&self, key_id: &KeyId)
    -> Result<Vec<CredentialRecord>>;
}

/// Unclaimed app installations.
#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// Record an installation. A repeated delivery for an installation that is
    /// still unclaimed refreshes it; a claimed installation is left untouched.
    async fn record_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<UnclaimedInstallation>;

    async fn get_installation(&self, installation_id: i64) -> Result<Option<UnclaimedInstallation>>;

    /// Atomically claim an installation. At most one caller ever sees
    /// [`ClaimOutcome::Claimed`] for a given installation.
    async fn claim_installation(
        &self,
        installation_id: i64,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> Result<ClaimOutcome>;

    /// Undo a claim whose completion failed.
    async fn release_installation_claim(&self, installation_id: i64) -> Result<bool>;

    async fn delete_installation(&self, installation_id: i64) -> Result<bool>;

    /// Delete installations past their expiry, claimed or not.
    async fn delete_expired_installations(&self, now: OffsetDateTime) -> Result<u64>;
}

/// Device authorization sessions.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn create_device_session(&self, session: NewDeviceSession) -> Result<DeviceSession>;

    async fn get_device_session(&self, device_code: &TokenHash) -> Result<Option<DeviceSession>>;

    /// Approve the pending session with the given user code.
    async fn authorize_device_session(
        &self,
        user_code: &str,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> Result<AuthorizeOutcome>;

    /// Move an `authorized` session to `issued` with the given tokens.
    ///
    /// Returns the updated session, or `None` if the session was not in the
    /// `authorized` state (so tokens are minted at most once).
    async fn issue_device_tokens(
        &self,
        device_code: &TokenHash,
        tokens: IssuedTokens,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>>;

    /// Replace the token pair of the issued session owning `refresh_token`.
    ///
    /// Returns `None` if the refresh token is unknown, expired, or revoked.
    async fn rotate_device_tokens(
        &self,
        refresh_token: &TokenHash,
        tokens: IssuedTokens,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>>;

    /// Revoke the session owning `token` (access or refresh).
    async fn revoke_device_tokens(&self, token: &TokenHash, now: OffsetDateTime) -> Result<bool>;

    /// The issued session whose unexpired access token hashes to `token`.
    async fn find_session_by_access_token(
        &self,
        token: &TokenHash,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>>;

    /// Delete sessions that can never be used again.
    async fn delete_expired_device_sessions(&self, now: OffsetDateTime) -> Result<u64>;
}

/// Everything the broker persists.
#[async_trait]
pub trait Storage:
    IntegrationStore + CredentialStore + InstallationStore + DeviceStore + std::fmt::Debug
{
    /// Ensure the backing store is reachable.
    async fn ping(&self) -> Result<()>;
}
