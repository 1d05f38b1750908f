//! The capability interface every external service implements.
//!
//! A connector owns the provider side of an integration: building the
//! authorization link, exchanging grants for credentials, checking and
//! rotating those credentials, and delivering provider events to a handler.
//! Connectors never touch plaintext storage; the [`crate::integration`]
//! service seals whatever they return before it is persisted.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    future::Future,
    sync::Arc,
};

use async_trait::async_trait;
use clients::switchboard::v1::{AuthorizationIntent, ConnectorType, CredentialKind};
use color_eyre::Result;
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{IntegrationId, OrgId},
    error::BrokerError,
};

pub mod github;
pub mod slack;

pub use github::GitHub;
pub use slack::Slack;

/// How long a signed authorization `state` stays valid.
pub const STATE_TTL: Duration = Duration::minutes(10);

/// Optional operations a connector supports.
///
/// Callers branch on these instead of calling an operation and treating a
/// no-op as success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub refresh: bool,
    pub revoke: bool,
    pub subscribe: bool,
}

/// Decrypted credential material.
///
/// Only ever held in memory for the duration of a connector call. The debug
/// output lists the keys but never the values.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[debug(
    "Credentials(kind = {}, keys = {:?}, expires_at = {:?})",
    self.kind,
    self.values.keys().collect::<Vec<_>>(),
    self.expires_at
)]
pub struct Credentials {
    pub kind: CredentialKind,
    pub values: BTreeMap<String, String>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Credentials {
    pub fn new(kind: CredentialKind) -> Self {
        Self {
            kind,
            values: BTreeMap::new(),
            expires_at: None,
        }
    }

    /// Set a value, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Set a value if one is present.
    pub fn with_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn expiring_at(mut self, expires_at: Option<OffsetDateTime>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a value the connector cannot work without.
    pub fn require(&self, key: &str) -> Result<&str, BrokerError> {
        self.get(key).ok_or_else(|| BrokerError::CredentialRejected {
            reason: format!("stored {} credential has no {key}", self.kind),
        })
    }

    /// Whether the credential expires before `now + window`.
    pub fn expires_within(&self, window: Duration, now: OffsetDateTime) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now + window)
    }
}

/// The grant a provider hands back after the user approved access.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Grant {
    /// A one-time OAuth authorization code.
    #[debug("Code(..)")]
    Code(String),

    /// An app installation id.
    Installation(i64),
}

/// The provider-side account an integration is linked to.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ConnectedAccount {
    /// Slack team id, GitHub account id.
    pub connector_organization_id: String,
    pub bot_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Output of a successful authorization exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorized {
    pub credentials: Credentials,
    pub account: ConnectedAccount,
}

/// A provider event parsed into the fields every consumer needs.
///
/// Provider-specific fields that do not map onto the common shape stay in
/// [`EventEnvelope::extensions`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventEnvelope {
    /// The provider's delivery or event id; unique per delivery.
    pub id: String,
    pub connector: ConnectorType,

    /// The provider's event name, e.g. `app_mention` or `pull_request`.
    pub event_type: String,

    /// Sub-type of the event, e.g. `opened` for a pull request.
    pub action: Option<String>,

    /// The provider-side account the event belongs to.
    pub connector_organization_id: Option<String>,
    pub actor: Option<String>,

    /// Where the event happened: a Slack channel or a GitHub repository.
    pub resource: Option<String>,
    pub text: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,

    /// Set by the broker when the account is linked to an integration.
    pub integration_id: Option<IntegrationId>,
    pub organization_id: Option<OrgId>,

    pub extensions: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(
        id: impl Into<String>,
        connector: ConnectorType,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            connector,
            event_type: event_type.into(),
            action: None,
            connector_organization_id: None,
            actor: None,
            resource: None,
            text: None,
            received_at: OffsetDateTime::now_utc(),
            integration_id: None,
            organization_id: None,
            extensions: Map::new(),
        }
    }
}

/// Receives events from a connector.
///
/// An error means this one event was not handled. It never stops the
/// subscription: webhook connectors answer with a 500 so the provider
/// redelivers, socket connectors log and move on.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, event: EventEnvelope) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, _cancel: &CancellationToken, event: EventEnvelope) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// The authorization, credential, and subscription contract for one
/// external service.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn connector_type(&self) -> ConnectorType;

    fn capabilities(&self) -> Capabilities;

    /// Build the link that starts authorization.
    ///
    /// `state` is opaque to the connector and must come back unchanged on
    /// the callback.
    async fn initiate_authorization(&self, state: &str) -> Result<AuthorizationIntent, BrokerError>;

    /// Exchange a grant for long-lived credentials.
    async fn complete_authorization(&self, grant: Grant) -> Result<Authorized, BrokerError>;

    /// Make a cheap provider call proving the credentials work.
    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), BrokerError>;

    async fn refresh_credentials(
        &self,
        _credentials: &Credentials,
    ) -> Result<Credentials, BrokerError> {
        Err(BrokerError::RefreshUnsupported {
            connector: self.connector_type(),
        })
    }

    /// Revoke the credentials with the provider.
    async fn revoke_credentials(&self, _credentials: &Credentials) -> Result<(), BrokerError> {
        Err(BrokerError::NotSupported {
            connector: self.connector_type(),
            capability: "revoke",
        })
    }

    /// Deliver events to `handler` until `cancel` fires or the transport
    /// fails for good.
    async fn subscribe(
        &self,
        _cancel: CancellationToken,
        _handler: Arc<dyn EventHandler>,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::NotSupported {
            connector: self.connector_type(),
            capability: "subscribe",
        })
    }
}

/// The connectors enabled in this process, keyed by type.
///
/// Built once at startup and shared by the API, the integration service and
/// the broker.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    connectors: Arc<HashMap<ConnectorType, Arc<dyn Connector>>>,
}

impl Registry {
    pub fn get(&self, connector: ConnectorType) -> Result<Arc<dyn Connector>, BrokerError> {
        self.connectors
            .get(&connector)
            .cloned()
            .ok_or(BrokerError::ConnectorNotConfigured { connector })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Connector>> {
        self.connectors.values()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl FromIterator<Arc<dyn Connector>> for Registry {
    fn from_iter<T: IntoIterator<Item = Arc<dyn Connector>>>(iter: T) -> Self {
        let connectors = iter
            .into_iter()
            .map(|connector| (connector.connector_type(), connector))
            .collect();
        Self {
            connectors: Arc::new(connectors),
        }
    }
}

/// Remembers recently delivered event ids so redeliveries are dropped.
///
/// Holds at most `capacity` ids; the oldest is forgotten first.
#[derive(Debug)]
pub struct DeliveryLog {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DeliveryLog {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Record a delivery. Returns `false` if it was already recorded.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Forget a delivery so a later attempt with the same id is handled.
    pub fn remove(&mut self, id: &str) {
        if self.seen.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Append path segments to a provider API base URL.
pub(crate) fn endpoint(base: &url::Url, segments: &[&str]) -> Result<url::Url, BrokerError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| BrokerError::Internal(color_eyre::eyre::eyre!("invalid API base: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Read an optional string field from a JSON object.
pub(crate) fn json_str(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
