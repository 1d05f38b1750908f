//! Postgres storage.
//!
//! Queries are checked at runtime rather than with the `query!` macros so the
//! crate builds without a live database.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    str::FromStr,
};

use async_trait::async_trait;
use clients::switchboard::v1::{ConnectorType, CredentialKind, IntegrationStatus};
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::Debug;
use sqlx::{
    FromRow, PgPool,
    migrate::{Migrate, Migrator},
    types::Json,
};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    AuthorizeOutcome, ClaimOutcome, CredentialRecord, CredentialStore, DeviceSession,
    DeviceStatus, DeviceStore, InstallationStore, Integration, IntegrationStore, IssuedTokens,
    NewCredential, NewDeviceSession, NewInstallation, NewIntegration, Storage,
    UnclaimedInstallation,
};
use crate::{
    auth::{Caller, CredentialId, DeviceSessionId, IntegrationId, OrgId, UserId},
    crypto::{KeyId, Sealed, TokenHash},
};

/// A connected Postgres database instance.
#[derive(Clone, Debug)]
#[debug("Postgres(pool_size = {})", self.pool.size())]
pub struct Postgres {
    pub pool: PgPool,
}

impl Postgres {
    /// The migrator for the database.
    pub const MIGRATOR: Migrator = sqlx::migrate!("./schema/migrations");

    /// Connect to the Postgres database.
    #[tracing::instrument(name = "Postgres::connect", skip(url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await.context("connect to database")?;
        Ok(Self { pool })
    }

    /// Apply all pending migrations.
    #[tracing::instrument(name = "Postgres::migrate")]
    pub async fn migrate(&self) -> Result<()> {
        Self::MIGRATOR
            .run(&self.pool)
            .await
            .context("apply migrations")
    }

    /// Validate that all migrations have been applied to the database.
    ///
    /// Fails on a dirty migration, on pending migrations, on applied
    /// migrations whose checksum changed, and on applied migrations this build
    /// does not know about. It never applies anything; use the `migrate`
    /// command for that.
    #[tracing::instrument(name = "Postgres::validate_migrations")]
    pub async fn validate_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("acquire connection")?;
        conn.ensure_migrations_table()
            .await
            .context("ensure migrations table")?;

        if let Some(version) = conn.dirty_version().await.context("check dirty version")? {
            bail!(
                "Database has a dirty migration (version {version}). \
                 Resolve it manually and re-run 'switchboard migrate'."
            );
        }

        let applied = conn
            .list_applied_migrations()
            .await
            .context("list applied migrations")?;
        let applied_checksums = applied
            .iter()
            .map(|m| (m.version, m.checksum.clone()))
            .collect::<HashMap<_, _>>();

        let expected = Self::MIGRATOR
            .iter()
            .filter(|m| m.migration_type.is_up_migration())
            .collect::<Vec<_>>();
        let expected_versions = expected.iter().map(|m| m.version).collect::<HashSet<_>>();

        let mut pending = expected
            .iter()
            .filter(|m| !applied_checksums.contains_key(&m.version))
            .map(|m| m.version)
            .collect::<Vec<_>>();
        pending.sort();
        if !pending.is_empty() {
            bail!(
                "Database has pending migrations: [{}]. Run 'switchboard migrate' first.",
                join_versions(&pending)
            );
        }

        let mismatched = expected
            .iter()
            .filter(|m| {
                applied_checksums
                    .get(&m.version)
                    .is_some_and(|checksum| *checksum != m.checksum)
            })
            .map(|m| m.version)
            .collect::<Vec<_>>();
        if !mismatched.is_empty() {
            bail!(
                "Database has migrations with checksum mismatches: [{}]. \
                 Migrations were modified after being applied.",
                join_versions(&mismatched)
            );
        }

        if !Self::MIGRATOR.ignore_missing {
            let mut missing = applied_checksums
                .keys()
                .filter(|version| !expected_versions.contains(version))
                .copied()
                .collect::<Vec<_>>();
            missing.sort();
            if !missing.is_empty() {
                bail!(
                    "Database has applied migrations missing from codebase: [{}]. \
                     This may indicate you're running an older version of the code.",
                    join_versions(&missing)
                );
            }
        }

        Ok(())
    }
}

fn join_versions(versions: &[i64]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl AsRef<PgPool> for Postgres {
    fn as_ref(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_column<T: FromStr>(column: &str, value: &str) -> Result<T> {
    T::from_str(value).map_err(|_| eyre!("unexpected value in column {column}: {value:?}"))
}

// =============================================================================
// Integrations
// =============================================================================

const INTEGRATION_COLUMNS: &str = "id, organization_id, user_id, connector_type, status, \
    connector_organization_id, connector_bot_id, metadata, created_at, updated_at, last_used_at";

#[derive(FromRow)]
struct IntegrationRow {
    id: Uuid,
    organization_id: String,
    user_id: String,
    connector_type: String,
    status: String,
    connector_organization_id: Option<String>,
    connector_bot_id: Option<String>,
    metadata: Json<BTreeMap<String, String>>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    last_used_at: Option<OffsetDateTime>,
}

impl TryFrom<IntegrationRow> for Integration {
    type Error = color_eyre::Report;

    fn try_from(row: IntegrationRow) -> Result<Self> {
        Ok(Self {
            id: IntegrationId::from(row.id),
            organization_id: OrgId::new(row.organization_id),
            user_id: UserId::new(row.user_id),
            connector: parse_column("integration.connector_type", &row.connector_type)?,
            status: parse_column("integration.status", &row.status)?,
            connector_organization_id: row.connector_organization_id,
            connector_bot_id: row.connector_bot_id,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[async_trait]
impl IntegrationStore for Postgres {
    #[tracing::instrument(name = "Postgres::create_integration", skip(credential))]
    async fn create_integration(
        &self,
        integration: NewIntegration,
        credential: NewCredential,
    ) -> Result<Integration> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, IntegrationRow>(&format!(
            r#"
            INSERT INTO integration (id, organization_id, user_id, connector_type, status,
                connector_organization_id, connector_bot_id, metadata)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING {INTEGRATION_COLUMNS}
            "#
        ))
        .bind(IntegrationId::generate().as_uuid())
        .bind(integration.organization_id.as_str())
        .bind(integration.user_id.as_str())
        .bind(integration.connector.as_ref())
        .bind(integration.connector_organization_id)
        .bind(integration.connector_bot_id)
        .bind(Json(integration.metadata))
        .fetch_one(&mut *tx)
        .await
        .context("insert integration")?;

        sqlx::query(
            r#"
            INSERT INTO integration_credential (id, integration_id, credential_type,
                encrypted_payload, encryption_key_id, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(CredentialId::generate().as_uuid())
        .bind(row.id)
        .bind(credential.kind.as_ref())
        .bind(credential.sealed.bytes)
        .bind(credential.sealed.key_id.as_str())
        .bind(credential.expires_at)
        .execute(&mut *tx)
        .await
        .context("insert credential")?;

        tx.commit().await.context("commit transaction")?;
        Integration::try_from(row)
    }

    #[tracing::instrument(name = "Postgres::get_integration")]
    async fn get_integration(&self, id: IntegrationId) -> Result<Option<Integration>> {
        sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integration WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("fetch integration")?
        .map(Integration::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::list_integrations")]
    async fn list_integrations(&self, organization: &OrgId) -> Result<Vec<Integration>> {
        sqlx::query_as::<_, IntegrationRow>(&format!(
            r#"
            SELECT {INTEGRATION_COLUMNS}
            FROM integration
            WHERE organization_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(organization.as_str())
        .fetch_all(&self.pool)
        .await
        .context("list integrations")?
        .into_iter()
        .map(Integration::try_from)
        .collect()
    }

    #[tracing::instrument(name = "Postgres::list_integrations_by_status")]
    async fn list_integrations_by_status(
        &self,
        status: IntegrationStatus,
    ) -> Result<Vec<Integration>> {
        sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integration WHERE status = $1"
        ))
        .bind(status.as_ref())
        .fetch_all(&self.pool)
        .await
        .context("list integrations by status")?
        .into_iter()
        .map(Integration::try_from)
        .collect()
    }

    #[tracing::instrument(name = "Postgres::find_integration_by_account")]
    async fn find_integration_by_account(
        &self,
        connector: ConnectorType,
        connector_organization_id: &str,
    ) -> Result<Option<Integration>> {
        sqlx::query_as::<_, IntegrationRow>(&format!(
            r#"
            SELECT {INTEGRATION_COLUMNS}
            FROM integration
            WHERE connector_type = $1
              AND connector_organization_id = $2
              AND status <> 'revoked'
            ORDER BY (status = 'active') DESC, updated_at DESC
            LIMIT 1
            "#
        ))
        .bind(connector.as_ref())
        .bind(connector_organization_id)
        .fetch_optional(&self.pool)
        .await
        .context("find integration by account")?
        .map(Integration::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::set_integration_status")]
    async fn set_integration_status(
        &self,
        id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<bool> {
        // Entering `active` has to go through `activate_integration`; staying
        // active is a no-op update.
        let result = sqlx::query(
            r#"
            UPDATE integration
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND ($2 <> 'active' OR status = 'active')
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_ref())
        .execute(&self.pool)
        .await
        .context("update integration status")?;

        if result.rows_affected() == 0 && status == IntegrationStatus::Active {
            let exists = self.get_integration(id).await?.is_some();
            if exists {
                bail!("use activate_integration to mark integration {id} active");
            }
        }
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "Postgres::activate_integration")]
    async fn activate_integration(&self, id: IntegrationId) -> Result<Vec<IntegrationId>> {
        let mut tx = self.pool.begin().await?;

        let target = sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integration WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .context("lock integration")?
        .ok_or_else(|| eyre!("integration {id} does not exist"))?;

        let superseded = sqlx::query_scalar::<_, Uuid>(
            r#"
            DELETE FROM integration
            WHERE organization_id = $1
              AND connector_type = $2
              AND status = 'active'
              AND id <> $3
            RETURNING id
            "#,
        )
        .bind(&target.organization_id)
        .bind(&target.connector_type)
        .bind(target.id)
        .fetch_all(&mut *tx)
        .await
        .context("delete superseded integrations")?;

        sqlx::query("UPDATE integration SET status = 'active', updated_at = NOW() WHERE id = $1")
            .bind(target.id)
            .execute(&mut *tx)
            .await
            .context("activate integration")?;

        tx.commit().await.context("commit transaction")?;
        Ok(superseded.into_iter().map(IntegrationId::from).collect())
    }

    #[tracing::instrument(name = "Postgres::touch_integration")]
    async fn touch_integration(&self, id: IntegrationId, now: OffsetDateTime) -> Result<()> {
        sqlx::query("UPDATE integration SET last_used_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await
            .context("touch integration")?;
        Ok(())
    }

    #[tracing::instrument(name = "Postgres::delete_integration")]
    async fn delete_integration(&self, id: IntegrationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM integration WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .context("delete integration")?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Credentials
// =============================================================================

const CREDENTIAL_COLUMNS: &str = "id, integration_id, credential_type, encrypted_payload, \
    encryption_key_id, expires_at, created_at, updated_at";

#[derive(FromRow)]
struct CredentialRow {
    id: Uuid,
    integration_id: Uuid,
    credential_type: String,
    encrypted_payload: Vec<u8>,
    encryption_key_id: String,
    expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CredentialRow> for CredentialRecord {
    type Error = color_eyre::Report;

    fn try_from(row: CredentialRow) -> Result<Self> {
        Ok(Self {
            id: CredentialId::from(row.id),
            integration_id: IntegrationId::from(row.integration_id),
            kind: parse_column::<CredentialKind>(
                "integration_credential.credential_type",
                &row.credential_type,
            )?,
            sealed: Sealed {
                key_id: KeyId::new(row.encryption_key_id),
                bytes: row.encrypted_payload,
            },
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl CredentialStore for Postgres {
    #[tracing::instrument(name = "Postgres::get_credential")]
    async fn get_credential(&self, integration: IntegrationId) -> Result<Option<CredentialRecord>> {
        sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM integration_credential WHERE integration_id = $1"
        ))
        .bind(integration.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("fetch credential")?
        .map(CredentialRecord::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::replace_credential", skip(credential))]
    async fn replace_credential(
        &self,
        integration: IntegrationId,
        credential: NewCredential,
    ) -> Result<CredentialRecord> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_scalar::<_, Uuid>("SELECT id FROM integration WHERE id = $1 FOR UPDATE")
            .bind(integration.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .context("lock integration")?;
        if locked.is_none() {
            bail!("integration {integration} does not exist");
        }

        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            INSERT INTO integration_credential (id, integration_id, credential_type,
                encrypted_payload, encryption_key_id, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (integration_id) DO UPDATE
            SET credential_type = EXCLUDED.credential_type,
                encrypted_payload = EXCLUDED.encrypted_payload,
                encryption_key_id = EXCLUDED.encryption_key_id,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(CredentialId::generate().as_uuid())
        .bind(integration.as_uuid())
        .bind(credential.kind.as_ref())
        .bind(credential.sealed.bytes)
        .bind(credential.sealed.key_id.as_str())
        .bind(credential.expires_at)
        .fetch_one(&mut *tx)
        .await
        .context("upsert credential")?;

        tx.commit().await.context("commit transaction")?;
        CredentialRecord::try_from(row)
    }

    #[tracing::instrument(name = "Postgres::delete_credential")]
    async fn delete_credential(&self, integration: IntegrationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM integration_credential WHERE integration_id = $1")
            .bind(integration.as_uuid())
            .execute(&self.pool)
            .await
            .context("delete credential")?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "Postgres::list_credentials_not_under_key")]
    async fn list_credentials_not_under_key(
        &self,
        key_id: &KeyId,
    ) -> Result<Vec<CredentialRecord>> {
        sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM integration_credential WHERE encryption_key_id <> $1"
        ))
        .bind(key_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("list credentials by key")?
        .into_iter()
        .map(CredentialRecord::try_from)
        .collect()
    }
}

// =============================================================================
// Installations
// =============================================================================

const INSTALLATION_COLUMNS: &str = "id, installation_id, account_id, account_login, account_type, \
    repository_selection, permissions, payload, created_at, expires_at, claimed_at, \
    claimed_by_organization_id, claimed_by_user_id";

#[derive(FromRow)]
struct InstallationRow {
    id: Uuid,
    installation_id: i64,
    account_id: i64,
    account_login: String,
    account_type: String,
    repository_selection: Option<String>,
    permissions: Json<BTreeMap<String, String>>,
    payload: serde_json::Value,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    claimed_at: Option<OffsetDateTime>,
    claimed_by_organization_id: Option<String>,
    claimed_by_user_id: Option<String>,
}

impl From<InstallationRow> for UnclaimedInstallation {
    fn from(row: InstallationRow) -> Self {
        let claimed_by = match (row.claimed_by_organization_id, row.claimed_by_user_id) {
            (Some(organization), Some(user)) => Some(Caller::new(organization, user)),
            _ => None,
        };
        Self {
            id: row.id,
            installation_id: row.installation_id,
            account_id: row.account_id,
            account_login: row.account_login,
            account_type: row.account_type,
            repository_selection: row.repository_selection,
            permissions: row.permissions.0,
            payload: row.payload,
            created_at: row.created_at,
            expires_at: row.expires_at,
            claimed_at: row.claimed_at,
            claimed_by,
        }
    }
}

#[async_trait]
impl InstallationStore for Postgres {
    #[tracing::instrument(name = "Postgres::record_installation", skip(installation), fields(installation_id = installation.installation_id))]
    async fn record_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<UnclaimedInstallation> {
        let installation_id = installation.installation_id;
        let row = sqlx::query_as::<_, InstallationRow>(&format!(
            r#"
            INSERT INTO unclaimed_installation (id, installation_id, account_id, account_login,
                account_type, repository_selection, permissions, payload, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (installation_id) DO UPDATE
            SET account_id = EXCLUDED.account_id,
                account_login = EXCLUDED.account_login,
                account_type = EXCLUDED.account_type,
                repository_selection = EXCLUDED.repository_selection,
                permissions = EXCLUDED.permissions,
                payload = EXCLUDED.payload,
                expires_at = EXCLUDED.expires_at
            WHERE unclaimed_installation.claimed_at IS NULL
            RETURNING {INSTALLATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(installation.installation_id)
        .bind(installation.account_id)
        .bind(installation.account_login)
        .bind(installation.account_type)
        .bind(installation.repository_selection)
        .bind(Json(installation.permissions))
        .bind(installation.payload)
        .bind(installation.expires_at)
        .fetch_optional(&self.pool)
        .await
        .context("upsert installation")?;

        match row {
            Some(row) => Ok(row.into()),
            None => self
                .get_installation(installation_id)
                .await?
                .ok_or_else(|| eyre!("installation {installation_id} vanished during upsert")),
        }
    }

    #[tracing::instrument(name = "Postgres::get_installation")]
    async fn get_installation(&self, installation_id: i64) -> Result<Option<UnclaimedInstallation>> {
        let row = sqlx::query_as::<_, InstallationRow>(&format!(
            "SELECT {INSTALLATION_COLUMNS} FROM unclaimed_installation WHERE installation_id = $1"
        ))
        .bind(installation_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch installation")?;
        Ok(row.map(UnclaimedInstallation::from))
    }

    #[tracing::instrument(name = "Postgres::claim_installation")]
    async fn claim_installation(
        &self,
        installation_id: i64,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> Result<ClaimOutcome> {
        let claimed = sqlx::query_as::<_, InstallationRow>(&format!(
            r#"
            UPDATE unclaimed_installation
            SET claimed_at = $2,
                claimed_by_organization_id = $3,
                claimed_by_user_id = $4
            WHERE installation_id = $1
              AND claimed_at IS NULL
              AND expires_at > $2
            RETURNING {INSTALLATION_COLUMNS}
            "#
        ))
        .bind(installation_id)
        .bind(now)
        .bind(caller.organization_id.as_str())
        .bind(caller.user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("claim installation")?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(row.into()));
        }
        Ok(match self.get_installation(installation_id).await? {
            None => ClaimOutcome::NotFound,
            Some(existing) if existing.claimed_at.is_some() => ClaimOutcome::AlreadyClaimed,
            Some(_) => ClaimOutcome::Expired,
        })
    }

    #[tracing::instrument(name = "Postgres::release_installation_claim")]
    async fn release_installation_claim(&self, installation_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE unclaimed_installation
            SET claimed_at = NULL,
                claimed_by_organization_id = NULL,
                claimed_by_user_id = NULL
            WHERE installation_id = $1 AND claimed_at IS NOT NULL
            "#,
        )
        .bind(installation_id)
        .execute(&self.pool)
        .await
        .context("release installation claim")?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "Postgres::delete_installation")]
    async fn delete_installation(&self, installation_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM unclaimed_installation WHERE installation_id = $1")
            .bind(installation_id)
            .execute(&self.pool)
            .await
            .context("delete installation")?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "Postgres::delete_expired_installations")]
    async fn delete_expired_installations(&self, now: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query("DELETE FROM unclaimed_installation WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("delete expired installations")?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Device sessions
// =============================================================================

const DEVICE_COLUMNS: &str = "id, device_code_hash, user_code, status, expires_at, interval_secs, \
    organization_id, user_id, authorized_at, access_token_hash, refresh_token_hash, \
    access_expires_at, refresh_expires_at, issued_at, revoked_at, created_at";

#[derive(FromRow)]
struct DeviceRow {
    id: Uuid,
    device_code_hash: Vec<u8>,
    user_code: String,
    status: String,
    expires_at: OffsetDateTime,
    interval_secs: i32,
    organization_id: Option<String>,
    user_id: Option<String>,
    authorized_at: Option<OffsetDateTime>,
    access_token_hash: Option<Vec<u8>>,
    refresh_token_hash: Option<Vec<u8>>,
    access_expires_at: Option<OffsetDateTime>,
    refresh_expires_at: Option<OffsetDateTime>,
    issued_at: Option<OffsetDateTime>,
    revoked_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<DeviceRow> for DeviceSession {
    type Error = color_eyre::Report;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let authorized_by = match (row.organization_id, row.user_id) {
            (Some(organization), Some(user)) => Some(Caller::new(organization, user)),
            _ => None,
        };
        Ok(Self {
            id: DeviceSessionId::from(row.id),
            device_code_hash: TokenHash::from_stored(row.device_code_hash),
            user_code: row.user_code,
            status: parse_column::<DeviceStatus>("device_session.status", &row.status)?,
            expires_at: row.expires_at,
            interval_secs: u32::try_from(row.interval_secs)
                .with_context(|| format!("negative poll interval: {}", row.interval_secs))?,
            authorized_by,
            authorized_at: row.authorized_at,
            access_token_hash: row.access_token_hash.map(TokenHash::from_stored),
            refresh_token_hash: row.refresh_token_hash.map(TokenHash::from_stored),
            access_expires_at: row.access_expires_at,
            refresh_expires_at: row.refresh_expires_at,
            issued_at: row.issued_at,
            revoked_at: row.revoked_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl DeviceStore for Postgres {
    #[tracing::instrument(name = "Postgres::create_device_session", skip(session))]
    async fn create_device_session(&self, session: NewDeviceSession) -> Result<DeviceSession> {
        let interval = i32::try_from(session.interval_secs).context("poll interval too large")?;
        sqlx::query_as::<_, DeviceRow>(&format!(
            r#"
            INSERT INTO device_session (id, device_code_hash, user_code, status, expires_at,
                interval_secs)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(DeviceSessionId::generate().as_uuid())
        .bind(session.device_code_hash.as_bytes())
        .bind(session.user_code)
        .bind(session.expires_at)
        .bind(interval)
        .fetch_one(&self.pool)
        .await
        .context("insert device session")?
        .try_into()
    }

    #[tracing::instrument(name = "Postgres::get_device_session", skip(device_code))]
    async fn get_device_session(&self, device_code: &TokenHash) -> Result<Option<DeviceSession>> {
        sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM device_session WHERE device_code_hash = $1"
        ))
        .bind(device_code.as_bytes())
        .fetch_optional(&self.pool)
        .await
        .context("fetch device session")?
        .map(DeviceSession::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::authorize_device_session")]
    async fn authorize_device_session(
        &self,
        user_code: &str,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> Result<AuthorizeOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE device_session
            SET status = 'authorized',
                organization_id = $2,
                user_id = $3,
                authorized_at = $4
            WHERE user_code = $1 AND status = 'pending' AND expires_at > $4
            "#,
        )
        .bind(user_code)
        .bind(caller.organization_id.as_str())
        .bind(caller.user_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("authorize device session")?;
        if result.rows_affected() > 0 {
            return Ok(AuthorizeOutcome::Authorized);
        }

        let pending = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM device_session WHERE user_code = $1 AND status = 'pending'",
        )
        .bind(user_code)
        .fetch_optional(&self.pool)
        .await
        .context("look up pending device session")?;
        Ok(match pending {
            Some(_) => AuthorizeOutcome::Expired,
            None => AuthorizeOutcome::NotFound,
        })
    }

    #[tracing::instrument(name = "Postgres::issue_device_tokens", skip_all)]
    async fn issue_device_tokens(
        &self,
        device_code: &TokenHash,
        tokens: IssuedTokens,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>> {
        sqlx::query_as::<_, DeviceRow>(&format!(
            r#"
            UPDATE device_session
            SET status = 'issued',
                access_token_hash = $2,
                refresh_token_hash = $3,
                access_expires_at = $4,
                refresh_expires_at = $5,
                issued_at = $6
            WHERE device_code_hash = $1 AND status = 'authorized'
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(device_code.as_bytes())
        .bind(tokens.access_token_hash.as_bytes())
        .bind(tokens.refresh_token_hash.as_bytes())
        .bind(tokens.access_expires_at)
        .bind(tokens.refresh_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("issue device tokens")?
        .map(DeviceSession::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::rotate_device_tokens", skip_all)]
    async fn rotate_device_tokens(
        &self,
        refresh_token: &TokenHash,
        tokens: IssuedTokens,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>> {
        sqlx::query_as::<_, DeviceRow>(&format!(
            r#"
            UPDATE device_session
            SET access_token_hash = $2,
                refresh_token_hash = $3,
                access_expires_at = $4,
                refresh_expires_at = $5
            WHERE refresh_token_hash = $1
              AND status = 'issued'
              AND refresh_expires_at > $6
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(refresh_token.as_bytes())
        .bind(tokens.access_token_hash.as_bytes())
        .bind(tokens.refresh_token_hash.as_bytes())
        .bind(tokens.access_expires_at)
        .bind(tokens.refresh_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("rotate device tokens")?
        .map(DeviceSession::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::revoke_device_tokens", skip_all)]
    async fn revoke_device_tokens(&self, token: &TokenHash, now: OffsetDateTime) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE device_session
            SET status = 'revoked', revoked_at = $2
            WHERE status = 'issued'
              AND (access_token_hash = $1 OR refresh_token_hash = $1)
            "#,
        )
        .bind(token.as_bytes())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("revoke device tokens")?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(name = "Postgres::find_session_by_access_token", skip_all)]
    async fn find_session_by_access_token(
        &self,
        token: &TokenHash,
        now: OffsetDateTime,
    ) -> Result<Option<DeviceSession>> {
        sqlx::query_as::<_, DeviceRow>(&format!(
            r#"
            SELECT {DEVICE_COLUMNS}
            FROM device_session
            WHERE access_token_hash = $1
              AND status = 'issued'
              AND access_expires_at > $2
            "#
        ))
        .bind(token.as_bytes())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("find session by access token")?
        .map(DeviceSession::try_from)
        .transpose()
    }

    #[tracing::instrument(name = "Postgres::delete_expired_device_sessions")]
    async fn delete_expired_device_sessions(&self, now: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM device_session
            WHERE status = 'revoked'
               OR (status IN ('pending', 'authorized') AND expires_at <= $1)
               OR (status = 'issued' AND refresh_expires_at <= $1)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("delete expired device sessions")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Storage for Postgres {
    #[tracing::instrument(name = "Postgres::ping")]
    async fn ping(&self) -> Result<()> {
        let pong = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("ping database")?;
        if pong != 1 {
            bail!("database ping failed; unexpected response: {pong}");
        }
        Ok(())
    }
}
