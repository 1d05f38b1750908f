//! Device authorization flow.
//!
//! Headless clients (CLIs, agents) log in by showing the user a short code
//! that the user approves in a browser session that already knows who they
//! are. The states are:
//!
//! ```text
//! pending --(user approves)--> authorized --(first poll)--> issued --> revoked
//! pending --(code expires)--> expired
//! ```
//!
//! Approving a user code only records who approved it; tokens are minted by
//! the poll that follows, exactly once per session. Any later poll with the
//! same device code is answered with `invalid_device_code`.

use std::sync::Arc;

use clients::switchboard::v1::device::{DeviceCodeResponse, DeviceErrorCode, TokenResponse};
use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use url::Url;

use crate::{
    auth::{Caller, RawToken},
    crypto::{
        TokenHash, format_user_code, generate_access_token, generate_device_code,
        generate_refresh_token, generate_user_code, normalize_user_code,
    },
    db::{AuthorizeOutcome, DeviceStatus, DeviceStore, IssuedTokens, NewDeviceSession, Storage},
};

/// Attempts at finding a user code not used by another pending session.
const USER_CODE_ATTEMPTS: usize = 5;

/// Lifetimes and URLs of the device flow.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Page where users enter the user code.
    pub verification_uri: Url,

    /// How long a device code stays valid while waiting for approval.
    pub code_ttl: Duration,

    /// Minimum delay between polls advertised to clients.
    pub interval: Duration,

    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl DeviceConfig {
    pub const DEFAULT_CODE_TTL: Duration = Duration::minutes(15);
    pub const DEFAULT_INTERVAL: Duration = Duration::seconds(5);
    pub const DEFAULT_ACCESS_TTL: Duration = Duration::hours(1);
    pub const DEFAULT_REFRESH_TTL: Duration = Duration::days(30);

    /// Default lifetimes with the given verification page.
    pub fn new(verification_uri: Url) -> Self {
        Self {
            verification_uri,
            code_ttl: Self::DEFAULT_CODE_TTL,
            interval: Self::DEFAULT_INTERVAL,
            access_ttl: Self::DEFAULT_ACCESS_TTL,
            refresh_ttl: Self::DEFAULT_REFRESH_TTL,
        }
    }
}

/// Result of polling with a device code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Tokens minted by this poll. They are never returned again.
    Issued(TokenResponse),

    /// The poll did not produce tokens.
    Rejected(DeviceErrorCode),
}

/// The device authorization service.
#[derive(Clone, Debug)]
pub struct DeviceFlow {
    #[debug(skip)]
    store: Arc<dyn Storage>,
    config: Arc<DeviceConfig>,
}

impl DeviceFlow {
    pub fn new(store: Arc<dyn Storage>, config: DeviceConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Start a device authorization.
    #[tracing::instrument(name = "DeviceFlow::initiate", skip(self))]
    pub async fn initiate(&self) -> Result<DeviceCodeResponse> {
        self.initiate_at(OffsetDateTime::now_utc()).await
    }

    async fn initiate_at(&self, now: OffsetDateTime) -> Result<DeviceCodeResponse> {
        let device_code = generate_device_code();
        let expires_at = now + self.config.code_ttl;
        let interval_secs = u32::try_from(self.config.interval.whole_seconds().max(1))
            .context("poll interval out of range")?;

        let mut attempt = 0;
        let session = loop {
            attempt += 1;
            let session = NewDeviceSession {
                device_code_hash: TokenHash::from(&device_code),
                user_code: generate_user_code(),
                expires_at,
                interval_secs,
            };
            match self.store.create_device_session(session).await {
                Ok(session) => break session,
                Err(error) if attempt < USER_CODE_ATTEMPTS => {
                    warn!(?error, attempt, "device.initiate.retry");
                }
                Err(error) => return Err(error).context("create device session"),
            }
        };

        let user_code = format_user_code(&session.user_code);
        let mut complete = self.config.verification_uri.clone();
        complete
            .query_pairs_mut()
            .append_pair("user_code", &user_code);

        info!(session = %session.id, "device.initiate.success");
        Ok(DeviceCodeResponse::builder()
            .device_code(device_code.expose())
            .user_code(user_code)
            .verification_uri(self.config.verification_uri.as_str())
            .verification_uri_complete(complete.as_str())
            .expires_in(seconds(self.config.code_ttl))
            .interval(u64::from(interval_secs))
            .build())
    }

    /// Approve the pending session identified by a user code.
    ///
    /// The user code is matched case-insensitively with dashes and spaces
    /// ignored.
    #[tracing::instrument(name = "DeviceFlow::authorize", skip(self, user_code))]
    pub async fn authorize(&self, user_code: &str, caller: &Caller) -> Result<AuthorizeOutcome> {
        let user_code = normalize_user_code(user_code);
        let outcome = self
            .store
            .authorize_device_session(&user_code, caller, OffsetDateTime::now_utc())
            .await?;
        match outcome {
            AuthorizeOutcome::Authorized => info!("device.authorize.success"),
            AuthorizeOutcome::Expired => info!("device.authorize.expired"),
            AuthorizeOutcome::NotFound => info!("device.authorize.not_found"),
        }
        Ok(outcome)
    }

    /// Poll for tokens.
    #[tracing::instrument(name = "DeviceFlow::poll", skip_all)]
    pub async fn poll(&self, device_code: &RawToken) -> Result<PollOutcome> {
        self.poll_at(device_code, OffsetDateTime::now_utc()).await
    }

    async fn poll_at(&self, device_code: &RawToken, now: OffsetDateTime) -> Result<PollOutcome> {
        let hash = TokenHash::from(device_code);
        let Some(session) = self.store.get_device_session(&hash).await? else {
            return Ok(PollOutcome::Rejected(DeviceErrorCode::InvalidDeviceCode));
        };

        match session.status {
            DeviceStatus::Issued | DeviceStatus::Revoked => {
                warn!(session = %session.id, "device.poll.replayed");
                return Ok(PollOutcome::Rejected(DeviceErrorCode::InvalidDeviceCode));
            }
            _ if session.expires_at <= now => {
                return Ok(PollOutcome::Rejected(DeviceErrorCode::ExpiredToken));
            }
            DeviceStatus::Pending => {
                return Ok(PollOutcome::Rejected(DeviceErrorCode::AuthorizationPending));
            }
            DeviceStatus::Authorized => {}
        }

        let (access, refresh, tokens) = self.mint(now);
        match self.store.issue_device_tokens(&hash, tokens, now).await? {
            Some(session) => {
                info!(session = %session.id, "device.poll.issued");
                Ok(PollOutcome::Issued(self.response(&access, &refresh)))
            }
            // Lost the race against a concurrent poll with the same code.
            None => Ok(PollOutcome::Rejected(DeviceErrorCode::InvalidDeviceCode)),
        }
    }

    /// Rotate a token pair. The presented refresh token stops working.
    ///
    /// Returns `None` if the refresh token is unknown, already rotated,
    /// expired, or revoked.
    #[tracing::instrument(name = "DeviceFlow::refresh", skip_all)]
    pub async fn refresh(&self, refresh_token: &RawToken) -> Result<Option<TokenResponse>> {
        let now = OffsetDateTime::now_utc();
        let (access, refresh, tokens) = self.mint(now);
        let rotated = self
            .store
            .rotate_device_tokens(&TokenHash::from(refresh_token), tokens, now)
            .await?;
        match rotated {
            Some(session) => {
                info!(session = %session.id, "device.refresh.success");
                Ok(Some(self.response(&access, &refresh)))
            }
            None => {
                info!("device.refresh.invalid_grant");
                Ok(None)
            }
        }
    }

    /// Revoke the token pair that `token` (access or refresh) belongs to.
    ///
    /// Returns whether anything was revoked.
    #[tracing::instrument(name = "DeviceFlow::revoke", skip_all)]
    pub async fn revoke(&self, token: &RawToken) -> Result<bool> {
        let revoked = self
            .store
            .revoke_device_tokens(&TokenHash::from(token), OffsetDateTime::now_utc())
            .await?;
        if revoked {
            info!("device.revoke.success");
        }
        Ok(revoked)
    }

    /// Resolve a bearer access token into the caller that approved it.
    #[tracing::instrument(name = "DeviceFlow::authenticate", skip_all)]
    pub async fn authenticate(&self, token: &RawToken) -> Result<Option<Caller>> {
        let session = self
            .store
            .find_session_by_access_token(&TokenHash::from(token), OffsetDateTime::now_utc())
            .await?;
        Ok(session.and_then(|session| session.authorized_by))
    }

    /// Delete sessions that can no longer be used.
    #[tracing::instrument(name = "DeviceFlow::cleanup", skip(self))]
    pub async fn cleanup(&self) -> Result<u64> {
        let deleted = self
            .store
            .delete_expired_device_sessions(OffsetDateTime::now_utc())
            .await?;
        if deleted > 0 {
            info!(deleted, "device.cleanup.success");
        }
        Ok(deleted)
    }

    fn mint(&self, now: OffsetDateTime) -> (RawToken, RawToken, IssuedTokens) {
        let access = generate_access_token();
        let refresh = generate_refresh_token();
        let tokens = IssuedTokens {
            access_token_hash: TokenHash::from(&access),
            refresh_token_hash: TokenHash::from(&refresh),
            access_expires_at: now + self.config.access_ttl,
            refresh_expires_at: now + self.config.refresh_ttl,
        };
        (access, refresh, tokens)
    }

    fn response(&self, access: &RawToken, refresh: &RawToken) -> TokenResponse {
        TokenResponse::builder()
            .access_token(access.expose())
            .refresh_token(refresh.expose())
            .expires_in(seconds(self.config.access_ttl))
            .refresh_token_expires_in(seconds(self.config.refresh_ttl))
            .build()
    }
}

fn seconds(duration: Duration) -> u64 {
    u64::try_from(duration.whole_seconds()).unwrap_or_default()
}
