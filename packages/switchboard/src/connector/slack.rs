//! Slack connector.
//!
//! Authorization is Slack's OAuth v2 flow for bot tokens. When token rotation
//! is enabled on the Slack app, `oauth.v2.access` also hands out a refresh
//! token and the access token expires; otherwise the bot token never expires
//! and cannot be refreshed.
//!
//! Events are received through Socket Mode when an app-level token is
//! configured, or through the HTTP Events API otherwise.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{HeaderMap, header::CONTENT_TYPE},
};
use clients::switchboard::v1::{AuthorizationIntent, ConnectorType, CredentialKind, IntentKind};
use derive_more::Debug;
use oauth2::{AuthUrl, ClientId, ClientSecret, CsrfToken, RedirectUrl, basic::BasicClient};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use time::{Duration, OffsetDateTime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use super::{
    Authorized, Capabilities, ConnectedAccount, Connector, Credentials, EventEnvelope,
    EventHandler, Grant, endpoint, json_str,
};
use crate::{
    error::BrokerError,
    webhook::{self, Inbound, WebhookSource, header},
};

mod socket;

pub use socket::Backoff;

/// Header carrying the `v0=<hex>` request signature.
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

/// Header carrying the unix timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Requests signed further than this from the current time are rejected.
pub const SIGNATURE_WINDOW: Duration = Duration::minutes(5);

/// Credential value keys.
pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const TEAM_ID: &str = "team_id";
pub const BOT_USER_ID: &str = "bot_user_id";
pub const SCOPE: &str = "scope";

/// `auth.test` errors that mean the token itself is no good.
const REJECTED_TOKEN_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "token_revoked",
    "token_expired",
    "account_inactive",
];

/// Settings for the Slack connector.
#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub client_id: String,
    pub client_secret: ClientSecret,
    pub scopes: Vec<String>,

    /// Where Slack sends the user after consent.
    pub redirect_uri: Url,

    /// App-level token (`xapp-...`) enabling Socket Mode.
    #[debug(skip)]
    pub app_token: Option<String>,

    /// Signing secret enabling the HTTP Events API listener.
    #[debug(skip)]
    pub signing_secret: Option<String>,
    pub webhook_addr: Option<SocketAddr>,

    pub api_base: Url,
    pub authorize_url: Url,
    pub backoff: Backoff,
    pub shutdown_grace: std::time::Duration,
}

impl SlackConfig {
    pub const DEFAULT_API_BASE: &str = "https://slack.com/api";
    pub const DEFAULT_AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";
}

/// The Slack connector.
#[derive(Clone, Debug)]
pub struct Slack {
    config: Arc<SlackConfig>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Team {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OauthAccess {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    bot_user_id: Option<String>,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    team: Option<Team>,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpen {
    url: String,
}

/// A Slack Web API reply: either the method's payload or Slack's error code.
type Reply<T> = Result<T, String>;

impl Slack {
    pub fn new(config: SlackConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .user_agent("switchboard")
            .build()
            .map_err(BrokerError::transport)?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    /// The HTTP Events API half of this connector, if a signing secret is
    /// configured.
    pub fn webhook(&self) -> Option<SlackWebhook> {
        self.config
            .signing_secret
            .clone()
            .map(SlackWebhook::new)
    }

    /// Call a Slack Web API method.
    ///
    /// Slack answers most failures with HTTP 200 and `ok: false`; those come
    /// back as the inner `Err` with Slack's error code.
    #[tracing::instrument(skip(self, bearer, form))]
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        bearer: Option<&str>,
        form: &[(&str, &str)],
    ) -> Result<Reply<T>, BrokerError> {
        let url = endpoint(&self.config.api_base, &[method])?;
        let mut request = self.http.post(url).form(form);
        if let Some(bearer) = bearer {
            request = request.bearer_auth(bearer);
        }
        let response = request.send().await.map_err(BrokerError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::transport(format!(
                "unexpected status code from Slack ({method}): {status}\n{body}"
            )));
        }

        let body = response.json::<Value>().await.map_err(BrokerError::transport)?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = json_str(&body, "/error").unwrap_or_else(|| String::from("unknown_error"));
            return Ok(Err(error));
        }
        serde_json::from_value::<T>(body)
            .map(Ok)
            .map_err(|error| BrokerError::transport(format!("parse Slack {method} reply: {error}")))
    }

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<OauthAccess, BrokerError> {
        let client_secret = self.config.client_secret.secret().as_str();
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", client_secret),
        ];
        params.extend_from_slice(form);
        self.call::<OauthAccess>("oauth.v2.access", None, &params)
            .await?
            .map_err(|reason| BrokerError::AuthExchangeFailed { reason })
    }

    fn credentials(access: &OauthAccess, team_id: &str) -> Credentials {
        let expires_at = access
            .expires_in
            .map(|seconds| OffsetDateTime::now_utc() + Duration::seconds(seconds));
        Credentials::new(CredentialKind::Oauth2)
            .with(ACCESS_TOKEN, access.access_token.clone())
            .with(TEAM_ID, team_id)
            .with_opt(REFRESH_TOKEN, access.refresh_token.clone())
            .with_opt(BOT_USER_ID, access.bot_user_id.clone())
            .with_opt(SCOPE, access.scope.clone())
            .expiring_at(expires_at)
    }

    /// Ask Slack for a Socket Mode websocket URL.
    async fn open_connection(&self, app_token: &str) -> Result<Url, BrokerError> {
        let opened = self
            .call::<ConnectionsOpen>("apps.connections.open", Some(app_token), &[])
            .await?
            .map_err(|error| BrokerError::transport(format!("apps.connections.open: {error}")))?;
        Url::parse(&opened.url).map_err(BrokerError::transport)
    }
}

#[async_trait]
impl Connector for Slack {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Slack
    }

    fn capabilities(&self) -> Capabilities {
        let http_events =
            self.config.signing_secret.is_some() && self.config.webhook_addr.is_some();
        Capabilities {
            refresh: true,
            revoke: true,
            subscribe: self.config.app_token.is_some() || http_events,
        }
    }

    async fn initiate_authorization(&self, state: &str) -> Result<AuthorizationIntent, BrokerError> {
        let client = BasicClient::new(ClientId::new(self.config.client_id.clone()))
            .set_auth_uri(AuthUrl::from_url(self.config.authorize_url.clone()))
            .set_redirect_uri(RedirectUrl::from_url(self.config.redirect_uri.clone()));
        let state = state.to_owned();
        let (url, _) = client
            .authorize_url(move || CsrfToken::new(state))
            .add_extra_param("scope", self.config.scopes.join(","))
            .url();
        Ok(AuthorizationIntent::builder()
            .kind(IntentKind::OauthRedirect)
            .url(url.to_string())
            .build())
    }

    #[tracing::instrument(skip_all)]
    async fn complete_authorization(&self, grant: Grant) -> Result<Authorized, BrokerError> {
        let Grant::Code(code) = grant else {
            return Err(BrokerError::AuthExchangeFailed {
                reason: String::from("Slack authorization requires an authorization code"),
            });
        };

        let redirect_uri = self.config.redirect_uri.to_string();
        let access = self
            .exchange(&[("code", code.as_str()), ("redirect_uri", redirect_uri.as_str())])
            .await?;
        let Some(team) = &access.team else {
            return Err(BrokerError::AuthExchangeFailed {
                reason: String::from("oauth.v2.access reply has no team"),
            });
        };

        let mut metadata = BTreeMap::new();
        if let Some(name) = &team.name {
            metadata.insert(String::from("team_name"), name.clone());
        }
        if let Some(app_id) = &access.app_id {
            metadata.insert(String::from("app_id"), app_id.clone());
        }
        if let Some(scope) = &access.scope {
            metadata.insert(String::from(SCOPE), scope.clone());
        }

        info!(team_id = %team.id, "slack.authorization.complete");
        Ok(Authorized {
            credentials: Self::credentials(&access, &team.id),
            account: ConnectedAccount {
                connector_organization_id: team.id.clone(),
                bot_id: access.bot_user_id.clone(),
                metadata,
            },
        })
    }

    #[tracing::instrument(skip_all)]
    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        let reply = self
            .call::<Value>("auth.test", Some(credentials.require(ACCESS_TOKEN)?), &[])
            .await?;
        match reply {
            Ok(_) => Ok(()),
            Err(error) if REJECTED_TOKEN_ERRORS.contains(&error.as_str()) => {
                Err(BrokerError::CredentialRejected { reason: error })
            }
            Err(error) => Err(BrokerError::transport(format!("auth.test: {error}"))),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn refresh_credentials(&self, credentials: &Credentials) -> Result<Credentials, BrokerError> {
        let Some(refresh_token) = credentials.get(REFRESH_TOKEN) else {
            return Err(BrokerError::RefreshUnsupported {
                connector: ConnectorType::Slack,
            });
        };
        let access = self
            .exchange(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        let team_id = access
            .team
            .as_ref()
            .map(|team| team.id.clone())
            .or_else(|| credentials.get(TEAM_ID).map(str::to_owned))
            .unwrap_or_default();
        let mut refreshed = Self::credentials(&access, &team_id);
        // Slack omits fields that did not change on rotation.
        for key in [BOT_USER_ID, SCOPE, REFRESH_TOKEN] {
            if !refreshed.values.contains_key(key) {
                if let Some(value) = credentials.get(key) {
                    refreshed.values.insert(String::from(key), value.to_owned());
                }
            }
        }
        Ok(refreshed)
    }

    #[tracing::instrument(skip_all)]
    async fn revoke_credentials(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        let reply = self
            .call::<Value>("auth.revoke", Some(credentials.require(ACCESS_TOKEN)?), &[])
            .await?;
        match reply {
            Ok(_) => Ok(()),
            Err(error) if REJECTED_TOKEN_ERRORS.contains(&error.as_str()) => Ok(()),
            Err(error) => Err(BrokerError::transport(format!("auth.revoke: {error}"))),
        }
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BrokerError> {
        if let Some(app_token) = &self.config.app_token {
            return socket::run(self, app_token, cancel, handler).await;
        }

        let (Some(source), Some(addr)) = (self.webhook(), self.config.webhook_addr) else {
            return Err(BrokerError::NotSupported {
                connector: ConnectorType::Slack,
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

/// Check a Slack request signature: HMAC-SHA256 over `v0:{timestamp}:{body}`.
///
/// Requests whose timestamp is more than [`SIGNATURE_WINDOW`] away from `now`
/// are rejected to limit replays.
pub fn verify_signature(
    secret: &[u8],
    timestamp: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
    now: OffsetDateTime,
) -> Result<(), BrokerError> {
    let timestamp = timestamp.ok_or(BrokerError::SignatureInvalid)?;
    let signed_at = timestamp
        .parse::<i64>()
        .map_err(|_| BrokerError::SignatureInvalid)?;
    if (now.unix_timestamp() - signed_at).abs() > SIGNATURE_WINDOW.whole_seconds() {
        return Err(BrokerError::SignatureInvalid);
    }
    let signature = signature
        .and_then(|value| value.strip_prefix("v0="))
        .ok_or(BrokerError::SignatureInvalid)?;
    webhook::verify_hmac_sha256(
        secret,
        &[b"v0:", timestamp.as_bytes(), b":", body],
        signature,
    )
}

/// Produce an `X-Slack-Signature` header value.
pub fn sign(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let signature =
        webhook::sign_hmac_sha256(secret, &[b"v0:", timestamp.as_bytes(), b":", body]);
    format!("v0={signature}")
}

/// The HTTP Events API side of the Slack connector.
#[derive(Clone, Debug)]
pub struct SlackWebhook {
    #[debug(skip)]
    signing_secret: String,
}

impl SlackWebhook {
    pub fn new(signing_secret: impl Into<String>) -> Self {
        Self {
            signing_secret: signing_secret.into(),
        }
    }
}

#[async_trait]
impl WebhookSource for SlackWebhook {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Slack
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), BrokerError> {
        verify_signature(
            self.signing_secret.as_bytes(),
            header(headers, TIMESTAMP_HEADER),
            body,
            header(headers, SIGNATURE_HEADER),
            OffsetDateTime::now_utc(),
        )
    }

    async fn accept(&self, headers: &HeaderMap, body: Bytes) -> Result<Inbound, BrokerError> {
        // Slash commands and interactivity post forms; only Socket Mode
        // delivers those.
        let form = header(headers, CONTENT_TYPE.as_str())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
        if form {
            return Ok(Inbound::Ignored {
                event_type: String::from("form_post"),
            });
        }

        let payload = serde_json::from_slice::<Value>(&body)
            .map_err(|error| BrokerError::InvalidPayload(format!("parse body: {error}")))?;
        match payload.get("type").and_then(Value::as_str) {
            Some("url_verification") => {
                let challenge = json_str(&payload, "/challenge").ok_or_else(|| {
                    BrokerError::InvalidPayload(String::from("url_verification has no challenge"))
                })?;
                Ok(Inbound::Reply(json!({ "challenge": challenge })))
            }
            Some("event_callback") => events_api_envelope(&payload)
                .map(Inbound::Event)
                .ok_or_else(|| BrokerError::InvalidPayload(String::from("event_callback has no event"))),
            other => Ok(Inbound::Ignored {
                event_type: other.unwrap_or("unknown").to_owned(),
            }),
        }
    }
}

/// Convert an Events API `event_callback` body.
pub(crate) fn events_api_envelope(payload: &Value) -> Option<EventEnvelope> {
    let event = payload.get("event")?;
    let event_type = json_str(event, "/type")?;
    let id = json_str(payload, "/event_id")
        .or_else(|| json_str(event, "/event_ts"))
        .or_else(|| json_str(event, "/ts"))?;

    let mut envelope = EventEnvelope::new(id, ConnectorType::Slack, event_type);
    envelope.action = json_str(event, "/subtype");
    envelope.connector_organization_id =
        json_str(payload, "/team_id").or_else(|| json_str(event, "/team"));
    envelope.actor = json_str(event, "/user").or_else(|| json_str(event, "/bot_id"));
    envelope.resource = json_str(event, "/channel");
    envelope.text = json_str(event, "/text");
    if let Value::Object(fields) = event {
        envelope.extensions = fields
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "type" | "subtype" | "user" | "channel" | "text"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
    }
    if let Some(api_app_id) = payload.get("api_app_id") {
        envelope
            .extensions
            .insert(String::from("api_app_id"), api_app_id.clone());
    }
    Some(envelope)
}
