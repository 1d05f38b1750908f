//! The integration service.
//!
//! Ties connectors, the keyring and storage together: it runs authorization
//! flows to completion, keeps credentials encrypted at rest, and hands out
//! decrypted credentials on demand.

use std::sync::Arc;

use clients::switchboard::v1::{AuthorizationIntent, ConnectorType, IntegrationStatus};
use color_eyre::eyre::eyre;
use dashmap::DashMap;
use derive_more::Debug;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::{
    auth::{Caller, IntegrationId},
    connector::{Authorized, Connector, Credentials, Grant, Registry, STATE_TTL},
    crypto::{Keyring, StateSigner},
    db::{
        ClaimOutcome, CredentialStore, InstallationStore, Integration, IntegrationStore,
        NewCredential, NewIntegration, Storage,
    },
    error::BrokerError,
};

/// Credentials expiring within this window are refreshed before use.
pub const REFRESH_WINDOW: Duration = Duration::minutes(5);

/// Parameters a provider sends back to the authorization callback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorizationData {
    #[debug(skip)]
    pub code: Option<String>,
    pub state: Option<String>,
    pub installation_id: Option<i64>,
}

/// Counts from a health check pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct Inner {
    #[debug(skip)]
    store: Arc<dyn Storage>,
    keyring: Keyring,
    signer: StateSigner,
    registry: Registry,

    /// Serializes credential reads that may refresh, and writes, per
    /// integration.
    locks: DashMap<IntegrationId, Arc<Mutex<()>>>,
}

/// Authorization and credential operations over all configured connectors.
#[derive(Clone, Debug)]
pub struct Integrations {
    inner: Arc<Inner>,
}

impl Integrations {
    pub fn new(
        store: Arc<dyn Storage>,
        keyring: Keyring,
        signer: StateSigner,
        registry: Registry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                keyring,
                signer,
                registry,
                locks: DashMap::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.inner.store
    }

    /// Start authorizing `connector` on behalf of `caller`.
    #[tracing::instrument(name = "Integrations::initiate", skip(self))]
    pub async fn initiate(
        &self,
        connector: ConnectorType,
        caller: &Caller,
    ) -> Result<AuthorizationIntent, BrokerError> {
        let connector = self.inner.registry.get(connector)?;
        let state = self
            .inner
            .signer
            .sign(connector.connector_type(), caller, STATE_TTL);
        let intent = connector.initiate_authorization(&state).await?;
        info!(kind = %intent.kind, "integration.initiate.success");
        Ok(intent)
    }

    /// Finish an authorization from the provider's callback.
    ///
    /// The caller is recovered from the signed `state`.
    #[tracing::instrument(name = "Integrations::complete", skip(self))]
    pub async fn complete(
        &self,
        connector: ConnectorType,
        data: AuthorizationData,
    ) -> Result<Integration, BrokerError> {
        let state = data.state.as_deref().ok_or(BrokerError::InvalidState)?;
        let caller = self.inner.signer.verify(connector, state)?;

        match (data.installation_id, data.code) {
            (Some(installation_id), _) => {
                self.claim_installation(connector, installation_id, &caller)
                    .await
            }
            (None, Some(code)) => {
                let connector = self.inner.registry.get(connector)?;
                let authorized = connector.complete_authorization(Grant::Code(code)).await?;
                self.establish(connector.as_ref(), &caller, authorized).await
            }
            (None, None) => Err(BrokerError::AuthExchangeFailed {
                reason: String::from("callback carried neither a code nor an installation id"),
            }),
        }
    }

    /// Link an app installation to `caller`'s organization.
    ///
    /// An installation that GitHub reported by webhook is claimed atomically,
    /// so only the first caller succeeds. An installation we have not heard
    /// about yet is completed directly. If completion fails the claim is
    /// released so the user can try again.
    #[tracing::instrument(name = "Integrations::claim_installation", skip(self))]
    pub async fn claim_installation(
        &self,
        connector: ConnectorType,
        installation_id: i64,
        caller: &Caller,
    ) -> Result<Integration, BrokerError> {
        let connector = self.inner.registry.get(connector)?;
        let claimed = match self
            .inner
            .store
            .claim_installation(installation_id, caller, OffsetDateTime::now_utc())
            .await?
        {
            ClaimOutcome::Claimed(_) => true,
            ClaimOutcome::NotFound => false,
            ClaimOutcome::AlreadyClaimed | ClaimOutcome::Expired => {
                info!(installation_id, "integration.claim.unavailable");
                return Err(BrokerError::InstallationUnavailable { installation_id });
            }
        };

        let result = match connector
            .complete_authorization(Grant::Installation(installation_id))
            .await
        {
            Ok(authorized) => self.establish(connector.as_ref(), caller, authorized).await,
            Err(error) => Err(error),
        };

        if let Err(error) = &result {
            if claimed {
                warn!(%error, installation_id, "integration.claim.released");
                if let Err(release) = self
                    .inner
                    .store
                    .release_installation_claim(installation_id)
                    .await
                {
                    error!(?release, installation_id, "integration.claim.release_error");
                }
            }
        } else {
            info!(installation_id, "integration.claim.success");
        }
        result
    }

    /// Persist freshly authorized credentials, validate them, and activate
    /// the integration.
    async fn establish(
        &self,
        connector: &dyn Connector,
        caller: &Caller,
        authorized: Authorized,
    ) -> Result<Integration, BrokerError> {
        let Authorized {
            credentials,
            account,
        } = authorized;
        let credential = self.seal(&credentials)?;
        let integration = self
            .inner
            .store
            .create_integration(
                NewIntegration {
                    organization_id: caller.organization_id.clone(),
                    user_id: caller.user_id.clone(),
                    connector: connector.connector_type(),
                    connector_organization_id: Some(account.connector_organization_id),
                    connector_bot_id: account.bot_id,
                    metadata: account.metadata,
                },
                credential,
            )
            .await?;
        info!(integration = %integration.id, "integration.complete.created");

        if let Err(error) = connector.validate_credentials(&credentials).await {
            warn!(%error, integration = %integration.id, "integration.complete.invalid");
            self.inner
                .store
                .set_integration_status(integration.id, IntegrationStatus::Error)
                .await?;
            return self.load(integration.id).await;
        }

        self.supersede(connector, &integration).await;
        let deleted = self.inner.store.activate_integration(integration.id).await?;
        for id in &deleted {
            self.inner.locks.remove(id);
        }
        info!(
            integration = %integration.id,
            superseded = deleted.len(),
            "integration.complete.success"
        );
        self.load(integration.id).await
    }

    /// Revoke, on the provider side, the credentials of every other active
    /// integration that activating `integration` is about to replace.
    async fn supersede(&self, connector: &dyn Connector, integration: &Integration) {
        let previous = match self
            .inner
            .store
            .list_integrations(&integration.organization_id)
            .await
        {
            Ok(previous) => previous,
            Err(error) => {
                warn!(?error, "integration.supersede.list_error");
                return;
            }
        };
        for old in previous.iter().filter(|old| {
            old.id != integration.id
                && old.connector == integration.connector
                && old.status == IntegrationStatus::Active
        }) {
            self.revoke_remote(connector, old.id).await;
        }
    }

    /// Best-effort provider-side revocation; failures are logged only.
    async fn revoke_remote(&self, connector: &dyn Connector, id: IntegrationId) {
        let credentials = match self.open(id).await {
            Ok(credentials) => credentials,
            Err(error) => {
                warn!(%error, integration = %id, "integration.revoke.remote_skipped");
                return;
            }
        };
        match connector.revoke_credentials(&credentials).await {
            Ok(()) => info!(integration = %id, "integration.revoke.remote_success"),
            Err(BrokerError::NotSupported { .. }) => {
                info!(integration = %id, "integration.revoke.remote_unsupported");
            }
            Err(error) => warn!(%error, integration = %id, "integration.revoke.remote_error"),
        }
    }

    /// The integrations of the caller's organization.
    #[tracing::instrument(name = "Integrations::list", skip(self))]
    pub async fn list(&self, caller: &Caller) -> Result<Vec<Integration>, BrokerError> {
        Ok(self
            .inner
            .store
            .list_integrations(&caller.organization_id)
            .await?)
    }

    /// An integration owned by the caller's organization.
    #[tracing::instrument(name = "Integrations::get", skip(self))]
    pub async fn get(&self, id: IntegrationId, caller: &Caller) -> Result<Integration, BrokerError> {
        match self.inner.store.get_integration(id).await? {
            Some(integration) if integration.organization_id == caller.organization_id => {
                Ok(integration)
            }
            _ => Err(BrokerError::IntegrationNotFound { integration: id }),
        }
    }

    /// Check the integration's credentials with the provider and record the
    /// result in its status.
    #[tracing::instrument(name = "Integrations::validate", skip(self))]
    pub async fn validate(
        &self,
        id: IntegrationId,
        caller: &Caller,
    ) -> Result<Integration, BrokerError> {
        let integration = self.get(id, caller).await?;
        self.check(&integration).await?;
        self.load(id).await
    }

    async fn check(&self, integration: &Integration) -> Result<(), BrokerError> {
        let connector = self.inner.registry.get(integration.connector)?;
        let outcome = match self.credentials(integration.id).await {
            Ok(credentials) => connector.validate_credentials(&credentials).await,
            Err(error) => Err(error),
        };

        match outcome {
            Ok(()) => {
                if integration.status != IntegrationStatus::Active {
                    self.reactivate(integration).await?;
                }
                Ok(())
            }
            Err(error) if error.is_transient() => Err(error),
            Err(error) => {
                warn!(%error, integration = %integration.id, "integration.validate.failed");
                self.inner
                    .store
                    .set_integration_status(integration.id, IntegrationStatus::Error)
                    .await?;
                Err(error)
            }
        }
    }

    /// Activate an integration whose credentials work again, unless another
    /// integration took its place in the meantime.
    async fn reactivate(&self, integration: &Integration) -> Result<(), BrokerError> {
        let replaced = self
            .inner
            .store
            .list_integrations(&integration.organization_id)
            .await?
            .into_iter()
            .any(|other| {
                other.id != integration.id
                    && other.connector == integration.connector
                    && other.status == IntegrationStatus::Active
            });
        if replaced {
            info!(integration = %integration.id, "integration.validate.superseded");
            return Ok(());
        }
        self.inner
            .store
            .activate_integration(integration.id)
            .await?;
        info!(integration = %integration.id, "integration.validate.reactivated");
        Ok(())
    }

    /// Refresh the integration's credentials now.
    #[tracing::instrument(name = "Integrations::refresh", skip(self))]
    pub async fn refresh(
        &self,
        id: IntegrationId,
        caller: &Caller,
    ) -> Result<Integration, BrokerError> {
        let integration = self.get(id, caller).await?;
        let connector = self.inner.registry.get(integration.connector)?;
        let _guard = self.lock(id).await;
        let credentials = self.open(id).await?;
        match self.refresh_locked(connector.as_ref(), id, &credentials).await {
            Ok(_) => self.load(id).await,
            Err(error @ BrokerError::CredentialRejected { .. }) => {
                self.inner
                    .store
                    .set_integration_status(id, IntegrationStatus::Error)
                    .await?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Revoke the integration's credentials with the provider and delete it.
    ///
    /// The local delete happens even when the provider cannot be reached.
    #[tracing::instrument(name = "Integrations::revoke", skip(self))]
    pub async fn revoke(&self, id: IntegrationId, caller: &Caller) -> Result<(), BrokerError> {
        let integration = self.get(id, caller).await?;
        {
            let _guard = self.lock(id).await;
            match self.inner.registry.get(integration.connector) {
                Ok(connector) => self.revoke_remote(connector.as_ref(), id).await,
                Err(error) => warn!(%error, integration = %id, "integration.revoke.remote_skipped"),
            }
            self.inner.store.delete_integration(id).await?;
        }
        self.inner.locks.remove(&id);
        info!(integration = %id, "integration.revoke.success");
        Ok(())
    }

    /// Decrypted credentials for an integration, refreshed first when they
    /// are about to expire.
    #[tracing::instrument(name = "Integrations::credentials", skip(self))]
    pub async fn credentials(&self, id: IntegrationId) -> Result<Credentials, BrokerError> {
        let integration = self
            .inner
            .store
            .get_integration(id)
            .await?
            .ok_or(BrokerError::IntegrationNotFound { integration: id })?;
        let connector = self.inner.registry.get(integration.connector)?;

        let _guard = self.lock(id).await;
        let mut credentials = self.open(id).await?;
        let now = OffsetDateTime::now_utc();
        if credentials.expires_within(REFRESH_WINDOW, now) {
            if connector.capabilities().refresh {
                credentials = self
                    .refresh_locked(connector.as_ref(), id, &credentials)
                    .await?;
            } else if credentials.expires_within(Duration::ZERO, now) {
                return Err(BrokerError::CredentialExpired { integration: id });
            }
        }

        self.inner.store.touch_integration(id, now).await?;
        Ok(credentials)
    }

    /// Refresh and store new credentials. The caller holds the lock for `id`.
    async fn refresh_locked(
        &self,
        connector: &dyn Connector,
        id: IntegrationId,
        credentials: &Credentials,
    ) -> Result<Credentials, BrokerError> {
        let refreshed = connector.refresh_credentials(credentials).await?;
        self.inner
            .store
            .replace_credential(id, self.seal(&refreshed)?)
            .await?;
        info!(integration = %id, "integration.refresh.success");
        Ok(refreshed)
    }

    /// Validate every active integration, marking failures as `error`.
    #[tracing::instrument(name = "Integrations::check_active", skip(self))]
    pub async fn check_active(&self) -> color_eyre::Result<HealthReport> {
        let mut report = HealthReport::default();
        for integration in self
            .inner
            .store
            .list_integrations_by_status(IntegrationStatus::Active)
            .await?
        {
            match self.check(&integration).await {
                Ok(()) => report.healthy += 1,
                Err(error) => {
                    warn!(%error, integration = %integration.id, "integration.health.failed");
                    report.failed += 1;
                }
            }
        }
        info!(healthy = report.healthy, failed = report.failed, "integration.health.done");
        Ok(report)
    }

    /// Delete unclaimed installations past their expiry.
    #[tracing::instrument(name = "Integrations::cleanup_expired", skip(self))]
    pub async fn cleanup_expired(&self) -> color_eyre::Result<u64> {
        let deleted = self
            .inner
            .store
            .delete_expired_installations(OffsetDateTime::now_utc())
            .await?;
        if deleted > 0 {
            info!(deleted, "installation.cleanup.success");
        }
        Ok(deleted)
    }

    /// Re-encrypt every credential not sealed under the current key.
    #[tracing::instrument(name = "Integrations::rotate_keys", skip(self))]
    pub async fn rotate_keys(&self) -> color_eyre::Result<usize> {
        let current = self.inner.keyring.current_key_id().clone();
        let stale = self
            .inner
            .store
            .list_credentials_not_under_key(&current)
            .await?;
        let mut rotated = 0;
        for record in stale {
            let _guard = self.lock(record.integration_id).await;
            let plaintext = self
                .inner
                .keyring
                .open(&record.sealed)
                .map_err(|error| eyre!("open credential {}: {error}", record.id))?;
            let sealed = self
                .inner
                .keyring
                .seal(&plaintext)
                .map_err(|error| eyre!("seal credential {}: {error}", record.id))?;
            self.inner
                .store
                .replace_credential(
                    record.integration_id,
                    NewCredential {
                        kind: record.kind,
                        sealed,
                        expires_at: record.expires_at,
                    },
                )
                .await?;
            rotated += 1;
        }
        info!(rotated, key_id = %current, "credential.rotate.success");
        Ok(rotated)
    }

    /// Ensure storage is reachable.
    pub async fn ping(&self) -> color_eyre::Result<()> {
        self.inner.store.ping().await
    }

    async fn load(&self, id: IntegrationId) -> Result<Integration, BrokerError> {
        self.inner
            .store
            .get_integration(id)
            .await?
            .ok_or(BrokerError::IntegrationNotFound { integration: id })
    }

    async fn open(&self, id: IntegrationId) -> Result<Credentials, BrokerError> {
        let record = self
            .inner
            .store
            .get_credential(id)
            .await?
            .ok_or(BrokerError::CredentialNotFound { integration: id })?;
        self.inner.keyring.open_json(&record.sealed)
    }

    fn seal(&self, credentials: &Credentials) -> Result<NewCredential, BrokerError> {
        Ok(NewCredential {
            kind: credentials.kind,
            sealed: self.inner.keyring.seal_json(credentials)?,
            expires_at: credentials.expires_at,
        })
    }

    async fn lock(&self, id: IntegrationId) -> OwnedMutexGuard<()> {
        let lock = self.inner.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }
}
