//! GitHub App connector.
//!
//! Authorization is an app installation: the user installs the app on an
//! account, GitHub redirects back with an installation id, and we mint an
//! installation access token by authenticating as the app with an RS256 JWT.
//! Installation tokens live for an hour and are refreshed by minting a new
//! one.
//!
//! Events arrive by webhook. An `installation.created` delivery can arrive
//! before (or without) the user coming back through the callback; those are
//! recorded as unclaimed installations until someone claims them.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{body::Bytes, http::HeaderMap};
use clients::switchboard::v1::{
    AuthorizationIntent, ConnectorType, CredentialKind, IntegrationStatus, IntentKind,
};
use color_eyre::eyre::eyre;
use derive_more::Debug;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use super::{
    Authorized, Capabilities, ConnectedAccount, Connector, Credentials, EventEnvelope,
    EventHandler, Grant, endpoint, json_str,
};
use crate::{
    db::{CredentialStore, InstallationStore, IntegrationStore, NewInstallation, Storage},
    error::BrokerError,
    webhook::{self, Inbound, WebhookSource, header},
};

/// Header carrying the `sha256=<hex>` body signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Header carrying the event name.
pub const EVENT_HEADER: &str = "x-github-event";

/// Header carrying the unique delivery id.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "switchboard";

/// Credential value keys.
pub const INSTALLATION_ID: &str = "installation_id";
pub const TOKEN: &str = "token";

/// Events forwarded to handlers; everything else is acknowledged and dropped.
const FORWARDED_EVENTS: &[&str] = &[
    "installation",
    "installation_repositories",
    "push",
    "pull_request",
    "pull_request_review",
    "pull_request_review_comment",
    "issues",
    "issue_comment",
    "check_run",
    "check_suite",
    "workflow_run",
    "release",
];

/// Settings for the GitHub App connector.
#[derive(Clone, Debug)]
pub struct GitHubConfig {
    pub app_id: String,
    pub app_slug: String,

    /// PEM encoded RSA private key of the app.
    #[debug(skip)]
    pub private_key: String,

    /// Secret used to sign webhook deliveries; the listener only runs when
    /// this and `webhook_addr` are both set.
    #[debug(skip)]
    pub webhook_secret: Option<String>,
    pub webhook_addr: Option<SocketAddr>,

    pub api_base: Url,
    pub web_base: Url,

    /// How long an installation nobody claimed is kept.
    pub installation_ttl: Duration,

    /// How long in-flight deliveries may run after shutdown begins.
    pub shutdown_grace: std::time::Duration,
}

impl GitHubConfig {
    pub const DEFAULT_API_BASE: &str = "https://api.github.com";
    pub const DEFAULT_WEB_BASE: &str = "https://github.com";
    pub const DEFAULT_INSTALLATION_TTL: Duration = Duration::hours(72);
}

/// The GitHub App connector.
#[derive(Clone, Debug)]
pub struct GitHub {
    config: Arc<GitHubConfig>,
    #[debug(skip)]
    key: EncodingKey,
    http: reqwest::Client,
    store: Arc<dyn Storage>,
}

#[derive(Debug, Serialize)]
struct AppClaims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: i64,
    account: AccountResponse,
    #[serde(default)]
    repository_selection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    id: i64,
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

impl GitHub {
    /// Create the connector, parsing the app's private key up front.
    pub fn new(config: GitHubConfig, store: Arc<dyn Storage>) -> Result<Self, BrokerError> {
        let key = EncodingKey::from_rsa_pem(config.private_key.as_bytes()).map_err(|error| {
            BrokerError::Internal(eyre!("parse GitHub App private key: {error}"))
        })?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(BrokerError::transport)?;
        Ok(Self {
            config: Arc::new(config),
            key,
            http,
            store,
        })
    }

    /// The webhook half of this connector, if a webhook secret is configured.
    pub fn webhook(&self) -> Option<GitHubWebhook> {
        let secret = self.config.webhook_secret.clone()?;
        Some(GitHubWebhook {
            secret,
            installation_ttl: self.config.installation_ttl,
            store: self.store.clone(),
        })
    }

    /// Sign a short-lived JWT that authenticates as the app.
    ///
    /// Issued a minute in the past to tolerate clock drift; GitHub rejects
    /// app tokens valid for longer than ten minutes.
    fn app_jwt(&self) -> Result<String, BrokerError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 9 * 60,
            iss: &self.config.app_id,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|error| BrokerError::Internal(eyre!("sign GitHub App JWT: {error}")))
    }

    fn request(&self, method: reqwest::Method, url: Url, bearer: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(bearer)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    #[tracing::instrument(skip(self))]
    async fn installation(&self, installation_id: i64) -> Result<InstallationResponse, BrokerError> {
        let url = endpoint(
            &self.config.api_base,
            &["app", "installations", &installation_id.to_string()],
        )?;
        let response = self
            .request(reqwest::Method::GET, url, &self.app_jwt()?)
            .send()
            .await
            .map_err(BrokerError::transport)?;
        match response.status() {
            status if status.is_success() => parse(response).await,
            StatusCode::NOT_FOUND => Err(BrokerError::AuthExchangeFailed {
                reason: format!("installation {installation_id} does not exist for this app"),
            }),
            status => Err(BrokerError::AuthExchangeFailed {
                reason: unexpected("fetch installation", status, response).await,
            }),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn mint_token(&self, installation_id: i64) -> Result<AccessTokenResponse, BrokerError> {
        let url = endpoint(
            &self.config.api_base,
            &[
                "app",
                "installations",
                &installation_id.to_string(),
                "access_tokens",
            ],
        )?;
        let response = self
            .request(reqwest::Method::POST, url, &self.app_jwt()?)
            .send()
            .await
            .map_err(BrokerError::transport)?;
        match response.status() {
            status if status.is_success() => parse(response).await,
            status if status.is_server_error() => Err(BrokerError::transport(
                unexpected("mint installation token", status, response).await,
            )),
            status => Err(BrokerError::AuthExchangeFailed {
                reason: unexpected("mint installation token", status, response).await,
            }),
        }
    }

    fn credentials(installation_id: i64, token: AccessTokenResponse) -> Credentials {
        Credentials::new(CredentialKind::Installation)
            .with(INSTALLATION_ID, installation_id.to_string())
            .with(TOKEN, token.token)
            .expiring_at(Some(token.expires_at))
    }
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BrokerError> {
    response.json::<T>().await.map_err(BrokerError::transport)
}

async fn unexpected(operation: &str, status: StatusCode, response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    format!("unexpected status code from GitHub ({operation}): {status}\n{body}")
}

fn installation_id(credentials: &Credentials) -> Result<i64, BrokerError> {
    let raw = credentials.require(INSTALLATION_ID)?;
    raw.parse().map_err(|_| BrokerError::CredentialRejected {
        reason: format!("stored installation id is not a number: {raw:?}"),
    })
}

#[async_trait]
impl Connector for GitHub {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::GitHub
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            refresh: true,
            revoke: true,
            subscribe: self.config.webhook_secret.is_some() && self.config.webhook_addr.is_some(),
        }
    }

    async fn initiate_authorization(&self, state: &str) -> Result<AuthorizationIntent, BrokerError> {
        let mut url = endpoint(
            &self.config.web_base,
            &["apps", &self.config.app_slug, "installations", "new"],
        )?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(AuthorizationIntent::builder()
            .kind(IntentKind::AppInstall)
            .url(url.to_string())
            .build())
    }

    #[tracing::instrument(skip(self))]
    async fn complete_authorization(&self, grant: Grant) -> Result<Authorized, BrokerError> {
        let Grant::Installation(installation_id) = grant else {
            return Err(BrokerError::AuthExchangeFailed {
                reason: String::from("GitHub App authorization requires an installation id"),
            });
        };

        let installation = self.installation(installation_id).await?;
        let token = self.mint_token(installation.id).await?;

        let mut metadata = BTreeMap::new();
        metadata.insert(String::from(INSTALLATION_ID), installation.id.to_string());
        metadata.insert(String::from("account_login"), installation.account.login);
        metadata.insert(String::from("account_type"), installation.account.kind);
        if let Some(selection) = installation.repository_selection {
            metadata.insert(String::from("repository_selection"), selection);
        }

        info!(installation_id, "github.authorization.complete");
        Ok(Authorized {
            credentials: Self::credentials(installation.id, token),
            account: ConnectedAccount {
                connector_organization_id: installation.account.id.to_string(),
                bot_id: Some(self.config.app_slug.clone()),
                metadata,
            },
        })
    }

    #[tracing::instrument(skip_all)]
    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        let mut url = endpoint(&self.config.api_base, &["installation", "repositories"])?;
        url.query_pairs_mut().append_pair("per_page", "1");
        let response = self
            .request(reqwest::Method::GET, url, credentials.require(TOKEN)?)
            .send()
            .await
            .map_err(BrokerError::transport)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) => {
                Err(BrokerError::CredentialRejected {
                    reason: unexpected("list installation repositories", status, response).await,
                })
            }
            status => Err(BrokerError::transport(
                unexpected("list installation repositories", status, response).await,
            )),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn refresh_credentials(&self, credentials: &Credentials) -> Result<Credentials, BrokerError> {
        let installation_id = installation_id(credentials)?;
        let token = self.mint_token(installation_id).await?;
        Ok(Self::credentials(installation_id, token))
    }

    #[tracing::instrument(skip_all)]
    async fn revoke_credentials(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        let url = endpoint(&self.config.api_base, &["installation", "token"])?;
        let response = self
            .request(reqwest::Method::DELETE, url, credentials.require(TOKEN)?)
            .send()
            .await
            .map_err(BrokerError::transport)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // The token already expired or was revoked.
            StatusCode::UNAUTHORIZED => Ok(()),
            status => Err(BrokerError::transport(
                unexpected("revoke installation token", status, response).await,
            )),
        }
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BrokerError> {
        let (Some(source), Some(addr)) = (self.webhook(), self.config.webhook_addr) else {
            return Err(BrokerError::NotSupported {
                connector: ConnectorType::GitHub,
                capability: "subscribe",
            });
        };
        let listener = TcpListener::bind(addr)
            .await
            .map_err(BrokerError::transport)?;
        let router = webhook::router(Arc::new(source), handler, cancel.clone());
        webhook::serve(listener, router, cancel, self.config.shutdown_grace).await
    }
}

/// Check an `X-Hub-Signature-256` header against the raw body.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: Option<&str>) -> Result<(), BrokerError> {
    let signature = signature
        .and_then(|value| value.strip_prefix("sha256="))
        .ok_or(BrokerError::SignatureInvalid)?;
    webhook::verify_hmac_sha256(secret, &[body], signature)
}

/// Produce an `X-Hub-Signature-256` header value.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    format!("sha256={}", webhook::sign_hmac_sha256(secret, &[body]))
}

/// The webhook side of the GitHub connector.
#[derive(Clone, Debug)]
pub struct GitHubWebhook {
    #[debug(skip)]
    secret: String,
    installation_ttl: Duration,
    store: Arc<dyn Storage>,
}

impl GitHubWebhook {
    pub fn new(secret: impl Into<String>, installation_ttl: Duration, store: Arc<dyn Storage>) -> Self {
        Self {
            secret: secret.into(),
            installation_ttl,
            store,
        }
    }

    /// Record or retire installations as GitHub reports them.
    #[tracing::instrument(skip(self, payload))]
    async fn track_installation(&self, action: &str, payload: &Value) -> Result<(), BrokerError> {
        let (installation_id, account_id) = installation_ids(payload)?;
        let linked = self
            .store
            .find_integration_by_account(ConnectorType::GitHub, &account_id.to_string())
            .await?
            .filter(|integration| {
                integration.metadata.get(INSTALLATION_ID).map(String::as_str)
                    == Some(installation_id.to_string().as_str())
            });

        match action {
            "created" => match linked {
                Some(integration) => {
                    info!(installation_id, integration = %integration.id, "github.installation.linked");
                }
                None => {
                    let permissions = payload
                        .pointer("/installation/permissions")
                        .and_then(Value::as_object)
                        .map(|permissions| {
                            permissions
                                .iter()
                                .filter_map(|(name, level)| {
                                    level.as_str().map(|level| (name.clone(), level.to_owned()))
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    self.store
                        .record_installation(NewInstallation {
                            installation_id,
                            account_id,
                            account_login: json_str(payload, "/installation/account/login")
                                .unwrap_or_default(),
                            account_type: json_str(payload, "/installation/account/type")
                                .unwrap_or_default(),
                            repository_selection: json_str(
                                payload,
                                "/installation/repository_selection",
                            ),
                            permissions,
                            payload: payload.clone(),
                            expires_at: OffsetDateTime::now_utc() + self.installation_ttl,
                        })
                        .await?;
                    info!(installation_id, "github.installation.recorded");
                }
            },
            "deleted" => {
                if let Some(integration) = linked {
                    self.store
                        .set_integration_status(integration.id, IntegrationStatus::Revoked)
                        .await?;
                    self.store.delete_credential(integration.id).await?;
                    info!(installation_id, integration = %integration.id, "github.installation.revoked");
                }
                self.store.delete_installation(installation_id).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookSource for GitHubWebhook {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::GitHub
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), BrokerError> {
        verify_signature(self.secret.as_bytes(), body, header(headers, SIGNATURE_HEADER))
    }

    async fn accept(&self, headers: &HeaderMap, body: Bytes) -> Result<Inbound, BrokerError> {
        let event_type = header(headers, EVENT_HEADER)
            .ok_or_else(|| BrokerError::InvalidPayload(format!("{EVENT_HEADER} header is missing")))?
            .to_owned();
        if !FORWARDED_EVENTS.contains(&event_type.as_str()) {
            return Ok(Inbound::Ignored { event_type });
        }

        let payload = serde_json::from_slice::<Value>(&body)
            .map_err(|error| BrokerError::InvalidPayload(format!("parse body: {error}")))?;
        let action = json_str(&payload, "/action");
        if event_type == "installation" {
            installation_ids(&payload)?;
        }

        let id = header(headers, DELIVERY_HEADER)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                warn!("github.delivery.missing_id");
                Uuid::new_v4().to_string()
            });
        Ok(Inbound::Event(envelope(id, event_type, action, payload)))
    }

    async fn record(&self, event: &EventEnvelope) -> Result<(), BrokerError> {
        if event.event_type != "installation" {
            return Ok(());
        }
        let payload = Value::Object(event.extensions.clone());
        self.track_installation(event.action.as_deref().unwrap_or_default(), &payload)
            .await
    }
}

/// The installation and account ids of an `installation` event.
fn installation_ids(payload: &Value) -> Result<(i64, i64), BrokerError> {
    let installation_id = payload
        .pointer("/installation/id")
        .and_then(Value::as_i64)
        .ok_or_else(|| BrokerError::InvalidPayload(String::from("installation.id is missing")))?;
    let account_id = payload
        .pointer("/installation/account/id")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            BrokerError::InvalidPayload(String::from("installation.account.id is missing"))
        })?;
    Ok((installation_id, account_id))
}

fn envelope(id: String, event_type: String, action: Option<String>, payload: Value) -> EventEnvelope {
    let text_pointer = match event_type.as_str() {
        "issue_comment" | "pull_request_review_comment" => Some("/comment/body"),
        "pull_request" => Some("/pull_request/title"),
        "pull_request_review" => Some("/review/body"),
        "issues" => Some("/issue/title"),
        "push" => Some("/head_commit/message"),
        "release" => Some("/release/name"),
        _ => None,
    };

    let mut event = EventEnvelope::new(id, ConnectorType::GitHub, event_type);
    event.action = action;
    event.connector_organization_id = json_str(&payload, "/installation/account/id")
        .or_else(|| json_str(&payload, "/organization/id"))
        .or_else(|| json_str(&payload, "/repository/owner/id"));
    event.actor = json_str(&payload, "/sender/login");
    event.resource = json_str(&payload, "/repository/full_name");
    event.text = text_pointer.and_then(|pointer| json_str(&payload, pointer));

    if let Value::Object(mut fields) = payload {
        fields.remove("action");
        fields.remove("sender");
        if let Some(installation_id) = fields
            .get("installation")
            .and_then(|installation| installation.get("id"))
            .cloned()
        {
            fields.insert(String::from(INSTALLATION_ID), installation_id);
        }
        event.extensions = fields;
    }
    event
}
