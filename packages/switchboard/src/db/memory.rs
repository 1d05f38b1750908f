//! In-memory storage.
//!
//! All tables sit behind one async mutex, which serializes every write the
//! same way row locks and transactions do in [`super::Postgres`]. Data is lost
//! on restart; use it for development and tests only.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use clients::switchboard::v1::{ConnectorType, IntegrationStatus};
use color_eyre::{Result, eyre::bail};
use derive_more::Debug;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AuthorizeOutcome, ClaimOutcome, CredentialRecord, CredentialStore, DeviceSession,
    DeviceStatus, DeviceStore, InstallationStore, Integration, IntegrationStore, IssuedTokens,
    NewCredential, NewDeviceSession, NewInstallation, NewIntegration, Storage,
    UnclaimedInstallation,
};
use crate::{
    auth::{Caller, CredentialId, DeviceSessionId, IntegrationId, OrgId},
    crypto::{KeyId, TokenHash},
};

#[derive(Default)]
struct Tables {
    integrations: HashMap<IntegrationId, Integration>,
    credentials: HashMap<IntegrationId, CredentialRecord>,
    installations: HashMap<i64, UnclaimedInstallation>,
    devices: HashMap<DeviceSessionId, DeviceSession>,
}

impl Tables {
    fn device_by<'a>(
        &'a mut self,
        matches: impl Fn(&DeviceSession) -> bool,
    ) -> Option<&'a mut DeviceSession> {
        self.devices.values_mut().find(|session| matches(session))
    }
}

/// Storage held in process memory.
#[derive(Clone, Debug, Default)]
#[debug("Memory(..)")]
pub struct Memory {
    tables: Arc<Mutex<Tables>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntegrationStore for Memory {
    #[tracing::instrument(name = "Memory::create_integration", skip(credential))]
    async fn create_integration(
        &self,
        integration: NewIntegration,
        credential: NewCredential,
    ) -> Result<Integration> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let record = Integration {
            id: IntegrationId::generate(),
            organization_id: integration.organization_id,
            user_id: integration.user_id,
            connector: integration.connector,
            status: IntegrationStatus::Pending,
            connector_organization_id: integration.connector_organization_id,
            connector_bot_id: integration.connector_bot_id,
            metadata: integration.metadata,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        };
        tables.credentials.insert(
            record.id,
            CredentialRecord {
                id: CredentialId::generate(),
                integration_id: record.id,
                kind: credential.kind,
                sealed: credential.sealed,
                expires_at: credential.expires_at,
                created_at: now,
                updated_at: now,
            },
        );
        tables.integrations.insert(record.id, record.clone());
        Ok(record)
    }

    #[tracing::instrument(name = "Memory::get_integration")]
    async fn get_integration(&self, id: IntegrationId) -> Result<Option<Integration>> {
        Ok(self.tables.lock().await.integrations.get(&id).cloned())
    }

    #[tracing::instrument(name = "Memory::list_integrations")]
    async fn list_integrations(&self, organization: &OrgId) -> Result<Vec<Integration>> {
        let tables = self.tables.lock().await;
        let mut integrations = tables
            .integrations
            .values()
            .filter(|integration| &integration.organization_id == organization)
            .cloned()
            .collect::<Vec<_>>();
        integrations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(integrations)
    }

    #[tracing::instrument(name = "Memory::list_integrations_by_status")]
    async fn list_integrations_by_status(
        &self,
        status: IntegrationStatus,
    ) -> Result<Vec<Integration>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .integrations
            .values()
            .filter(|integration| integration.status == status)
            .cloned()
            .collect())
    }

    #[tracing::instrument(name = "Memory::find_integration_by_account")]
    async fn find_integration_by_account(
        &self,
        connector: ConnectorType,
        connector_organization_id: &str,
    ) -> Result<Option<Integration>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .integrations
            .values()
            .filter(|integration| {
                integration.connector == connector
                    && integration.status != IntegrationStatus::Revoked
                    && integration.connector_organization_id.as_deref()
                        == Some(connector_organization_id)
            })
            .max_by_key(|integration| {
                (
                    integration.status == IntegrationStatus::Active,
                    integration.updated_at,
                )
            })
            .cloned())
    }

    #[tracing::instrument(name = "Memory::set_integration_status")]
    async fn set_integration_status(
        &self,
        id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(integration) = tables.integrations.get_mut(&id) else {
            return Ok(false);
        };
        if status == IntegrationStatus::Active && integration.status != IntegrationStatus::Active {
            bail!("use activate_integration to mark integration {id} active");
        }
        integration.status = status;
        integration.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    #[tracing::instrument(name = "Memory::activate_integration")]
    async fn activate_integration(&self, id: IntegrationId) -> Result<Vec<IntegrationId>> {
        let mut tables = self.tables.lock().await;
        let Some(target) = tables.integrations.get(&id).cloned() else {
            bail!("integration {id} does not exist");
        };

        let superseded = tables
            .integrations
            .values()
            .filter(|other| {
                other.id != id
                    && other.status == IntegrationStatus::Active
                    && other.organization_id == target.organization_id
                    && other.connector == target.connector
            })
            .map(|other| other.id)
            .collect::<Vec<_>>();
        for other in &superseded {
            tables.integrations.remove(other);
            tables.credentials.remove(other);
        }

        if let Some(integration) = tables.integrations.get_mut(&id) {
            integration.status = IntegrationStatus::Active;
            integration.updated_at = OffsetDateTime::now_utc();
        }
        Ok(superseded)
    }

    #[tracing::instrument(name = "Memory::touch_integration")]
    async fn touch_integration(&self, id: IntegrationId, now: OffsetDateTime) -> Result<()> {
        if let Some(integration) = self.tables.lock().await.integrations.get_mut(&id) {
            integration.last_used_at = Some(now);
        }
        Ok(())
    }

    #[tracing::instrument(name = "Memory::delete_integration")]
    async fn delete_integration(&self, id: IntegrationId) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        tables.credentials.remove(&id);
        Ok(tables.integrations.remove(&id).is_some())
    }
}

#[async_trait]
impl CredentialStore for Memory {
    #[tracing::instrument(name = "Memory::get_credential")]
    async fn get_credential(&self, integration: IntegrationId) -> Result<Option<CredentialRecord>> {
        Ok(self.tables.lock().await.credentials.get(&integration).cloned())
    }

    #[tracing::instrument(name = "Memory::replace_credential", skip(credential))]
    async fn replace_credential(
        &self,
        integration: IntegrationId,
        credential: NewCredential,
    ) -> Result<CredentialRecord> {
        let mut tables = self.tables.lock().await;
        if !tables.integrations.contains_key(&integration) {
            bail!("integration {integration} does not exist");
        }

        let now = OffsetDateTime::now_utc();
        let (id, created_at) = tables
            .credentials
            .get(&integration)
            .map(|existing| (existing.id, existing.created_at))
            .unwrap_or_else(|| (CredentialId::generate(), now));
        let record = CredentialRecord {
            id,
            integration_id: integration,
            kind: credential.kind,
            sealed: credential.sealed,
            expires_at: credential.expires_at,
            created_at,
            updated_at: now,
        };
        tables.credentials.insert(integration, record.clone());
        Ok(record)
    }

    #[tracing::instrument(name = "Memory::delete_credential")]
    async fn delete_credential(&self, integration: IntegrationId) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .credentials
            .remove(&integration)
            .is_some())
    }

    #[tracing::instrument(name = "Memory::list_credentials_not_under_key")]
    async fn list_credentials_not_under_key(
        &self,
        key_id: &KeyId,
    ) -> Result<Vec<CredentialRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .credentials
            .values()
            .filter(|credential| &credential.sealed.key_id != key_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InstallationStore for Memory {
    #[tracing::instrument(name = "Memory::record_installation", skip(installation), fields(installation_id = installation.installation_id))]
    async fn record_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<UnclaimedInstallation> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.installations.get_mut(&installation.installation_id) {
            if existing.claimed_at.is_none() {
                existing.account_id = installation.account_id;
                existing.account_login = installation.account_login;
                existing.account_type = installation.account_type;
                existing.repository_selection = installation.repository_selection;
                existing.permissions = installation.permissions;
                existing.payload = installation.payload;
                existing.expires_at = installation.expires_at;
            }
            return Ok(existing.clone());
        }

        let record = UnclaimedInstallation {
            id: Uuid::new_v4(),
            installation_id: installation.installation_id,
            account_id: installation.account_id,
            account_login: installation.account_login,
            account_type: installation.account_type,
            repository_selection: installation.repository_selection,
            permissions: installation.permissions,
            payload: installation.payload,
            created_at: OffsetDateTime::now_utc(),
            expires_at: installation.expires_at,
            claimed_at: None,
            claimed_by: None,
        };
        tables
            .installations
            .insert(record.installation_id, record.clone());
        Ok(record)
    }

    #[tracing::instrument(name = "Memory::get_installation")]
    async fn get_installation(&self, installation_id: i64) -> Result<Option<UnclaimedInstallation>> {
        Ok(self
            .tables
            .lock()
            .await
            .installations
            .get(&installation_id)
            .cloned())
    }

    #[tracing::instrument(name = "Memory::claim_installation")]
    async fn claim_installation(
        &self,
        installation_id: i64,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> Result<ClaimOutcome> {
        let mut tables = self.tables.lock().await;
        let Some(installation) = tables.installations.get_mut(&installation_id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if installation.claimed_at.is_some() {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        if installation.expires_at <= now {
            return Ok(ClaimOutcome::Expired);
        }

        installation.claimed_at = Some(now);
        installation.claimed_by = Some(caller.clone());
        Ok(ClaimOutcome::Claimed(installation.clone()))
    }

    #[tracing::instrument(name = "Memory::release_installation_claim")]
    async fn release_installation_claim(&self, installation_id: i64) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(installation) = tables.installations.get_mut(&installation_id) else {
            return Ok(false);
        };
        let released = installation.claimed_at.take().is_some();
        installation.claimed_by = None;
        Ok(released)
    }

    #[tracing::instrument(name = "Memory::delete_installation")]
    async fn delete_installation(&self, installation_id: i64) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .installations
            .remove(&installation_id)
            .is_some())
    }

    #[tracing::instrument(name = "Memory::delete_expired_installations")]
    async fn delete_expired_installations(&self, now: OffsetDateTime) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.installations.len();
        tables
            .installations
            .retain(|_, installation| installation.expires_at > now);
        Ok((before - tables.installations.len()) as u64)
    }
}

#[async_trait]
impl DeviceStore for Memory {
    #[tracing::instrument(name = "Memory::create_device_session", skip(session))]
    async fn create_device_session(&self, session: NewDeviceSession) -> Result<DeviceSession> {
        let mut tables = self.tables.lock().await;
        let collision = tables.devices.values().any(|existing| {
            existing.status == DeviceStatus::Pending && existing.user_code == session.user_code
        });
        if collision {
            bail!("a pending device session already uses this user code");
        }

        let record = DeviceSession {
            id: DeviceSessionId::generate(),
            device_code_hash: session.device_code_hash,
            user_code: session.user_code,
            status: DeviceStatus::Pending,
            expires_at: session.expires_at,
            interval_secs: session.interval_secs,
            authorized_by: None,
            authorized_at: None,
            access_token_hash: None,
            refresh_token_hash: None,
            access_expires_at: None,
            refresh_expires_at: None,
            issued_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.devices.insert(record.id, record.clone());
        Ok(record)
    }

    #[tracing::instrument(name = "Memory::get_device_session", skip(device_code))]
    async fn get_device_session(&self, device_code: &TokenHash) -> Result<Option<DeviceSession>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .device_by(|session| &session.device_code_hash == device_code)
            .map(|session| session.clone()))
    }

    #[tracing::instrument(name = "Memory::authorize_device_session")]
    async fn authorize_device_session(
        &self,
        user_code: &str,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> Result<AuthorizeOutcome> {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.device_by(|session| {
            session.status == DeviceStatus::Pending && session.user_code == user_code
        }) else {
            return Ok(AuthorizeOutcome::NotFound);
        };
        if session.expires_at <= now {
            return Ok(AuthorizeOutcome::Expired);
        }

        session.status = DeviceStatus::Authorized;
        session.authorized_by = Some(caller.clone());
        session.authorized_at = Some(now);
        Ok(AuthorizeOutcome::Authorized)
    }

    #[tracing::instrument(name = "Memory::issue_device_tokens", skip_all)]
    async fn issue_device_tokens(
        &self,
        device_code: &TokenHash,
        tokens: IssuedTokens,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>> {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.device_by(|session| {
            &session.device_code_hash == device_code && session.status == DeviceStatus::Authorized
        }) else {
            return Ok(None);
        };

        session.status = DeviceStatus::Issued;
        session.access_token_hash = Some(tokens.access_token_hash);
        session.refresh_token_hash = Some(tokens.refresh_token_hash);
        session.access_expires_at = Some(tokens.access_expires_at);
        session.refresh_expires_at = Some(tokens.refresh_expires_at);
        session.issued_at = Some(now);
        Ok(Some(session.clone()))
    }

    #[tracing::instrument(name = "Memory::rotate_device_tokens", skip_all)]
    async fn rotate_device_tokens(
        &self,
        refresh_token: &TokenHash,
        tokens: IssuedTokens,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>> {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.device_by(|session| {
            session.status == DeviceStatus::Issued
                && session.refresh_token_hash.as_ref() == Some(refresh_token)
                && session
                    .refresh_expires_at
                    .is_some_and(|expires_at| expires_at > now)
        }) else {
            return Ok(None);
        };

        session.access_token_hash = Some(tokens.access_token_hash);
        session.refresh_token_hash = Some(tokens.refresh_token_hash);
        session.access_expires_at = Some(tokens.access_expires_at);
        session.refresh_expires_at = Some(tokens.refresh_expires_at);
        Ok(Some(session.clone()))
    }

    #[tracing::instrument(name = "Memory::revoke_device_tokens", skip_all)]
    async fn revoke_device_tokens(&self, token: &TokenHash, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.device_by(|session| {
            session.status == DeviceStatus::Issued
                && (session.access_token_hash.as_ref() == Some(token)
                    || session.refresh_token_hash.as_ref() == Some(token))
        }) else {
            return Ok(false);
        };

        session.status = DeviceStatus::Revoked;
        session.revoked_at = Some(now);
        Ok(true)
    }

    #[tracing::instrument(name = "Memory::find_session_by_access_token", skip_all)]
    async fn find_session_by_access_token(
        &self,
        token: &TokenHash,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .device_by(|session| {
                session.status == DeviceStatus::Issued
                    && session.access_token_hash.as_ref() == Some(token)
                    && session
                        .access_expires_at
                        .is_some_and(|expires_at| expires_at > now)
            })
            .map(|session| session.clone()))
    }

    #[tracing::instrument(name = "Memory::delete_expired_device_sessions")]
    async fn delete_expired_device_sessions(&self, now: OffsetDateTime) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.devices.len();
        tables.devices.retain(|_, session| match session.status {
            DeviceStatus::Pending | DeviceStatus::Authorized => session.expires_at > now,
            DeviceStatus::Issued => session
                .refresh_expires_at
                .is_some_and(|expires_at| expires_at > now),
            DeviceStatus::Revoked => false,
        });
        Ok((before - tables.devices.len()) as u64)
    }
}

#[async_trait]
impl Storage for Memory {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
