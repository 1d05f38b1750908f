//! Slack Socket Mode.
//!
//! Slack hands out a single-use websocket URL per connection. Every envelope
//! that carries an `envelope_id` must be acknowledged on the socket or Slack
//! redelivers it. Slack periodically asks clients to reconnect with a
//! `disconnect` envelope; that is routine and does not count as a failure.

use std::sync::Arc;

use clients::switchboard::v1::ConnectorType;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Slack, events_api_envelope};
use crate::{
    connector::{DeliveryLog, EventEnvelope, EventHandler, json_str},
    error::BrokerError,
};

/// Reconnect policy for the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first reconnect attempt after a failure.
    pub initial: std::time::Duration,

    /// Upper bound for the doubling delay.
    pub max: std::time::Duration,

    /// Consecutive failed attempts after which the subscription gives up.
    pub max_failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: std::time::Duration::from_secs(1),
            max: std::time::Duration::from_secs(30),
            max_failures: 8,
        }
    }
}

#[derive(Debug)]
struct Reconnect {
    policy: Backoff,
    failures: u32,
    delay: std::time::Duration,
}

impl Reconnect {
    fn new(policy: Backoff) -> Self {
        Self {
            policy,
            failures: 0,
            delay: policy.initial,
        }
    }

    /// Clear the failure streak after a session Slack greeted, and return the
    /// pause before reconnecting. Greeted sessions still wait the initial
    /// delay so a server that says hello and hangs up is not hammered.
    fn greeted(&mut self) -> std::time::Duration {
        self.failures = 0;
        self.delay = self.policy.initial;
        self.policy.initial
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or the terminal error once the budget is spent.
    fn fail(&mut self, error: BrokerError) -> Result<std::time::Duration, BrokerError> {
        self.failures += 1;
        if self.failures >= self.policy.max_failures {
            return Err(BrokerError::TransportFailure(format!(
                "slack socket failed {} times in a row; last error: {error}",
                self.failures
            )));
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.policy.max);
        Ok(delay)
    }
}

#[derive(Debug, Deserialize)]
struct SocketEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,

    /// The connection ended; `greeted` is whether Slack said hello first.
    Disconnected { greeted: bool },
}

/// Keep a Socket Mode connection open until `cancel` fires.
pub(super) async fn run(
    slack: &Slack,
    app_token: &str,
    cancel: CancellationToken,
    handler: Arc<dyn EventHandler>,
) -> Result<(), BrokerError> {
    let mut reconnect = Reconnect::new(slack.config.backoff);
    let mut deliveries = DeliveryLog::default();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let outcome = match slack.open_connection(app_token).await {
            Ok(url) => session(url.as_str(), &cancel, handler.as_ref(), &mut deliveries).await,
            Err(error) => Err(error),
        };

        let delay = match outcome {
            Ok(SessionEnd::Cancelled) => return Ok(()),
            Ok(SessionEnd::Disconnected { greeted: true }) => {
                info!("slack.socket.reconnect");
                reconnect.greeted()
            }
            Ok(SessionEnd::Disconnected { greeted: false }) => reconnect.fail(
                BrokerError::transport("socket closed before hello"),
            )?,
            Err(error) => {
                warn!(%error, failures = reconnect.failures + 1, "slack.socket.error");
                reconnect.fail(error)?
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session(
    url: &str,
    cancel: &CancellationToken,
    handler: &dyn EventHandler,
    deliveries: &mut DeliveryLog,
) -> Result<SessionEnd, BrokerError> {
    let (stream, _response) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        connected = connect_async(url) => connected.map_err(BrokerError::transport)?,
    };
    let (mut sink, mut source) = stream.split();
    let mut greeted = false;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                // Best effort; the connection is dropped either way.
                let _ = sink.close().await;
                return Ok(SessionEnd::Cancelled);
            }
            message = source.next() => message,
        };
        let Some(message) = message else {
            return Ok(SessionEnd::Disconnected { greeted });
        };

        let raw = match message.map_err(BrokerError::transport)? {
            WsMessage::Text(text) => text.as_bytes().to_vec(),
            WsMessage::Binary(bytes) => bytes.to_vec(),
            WsMessage::Close(_) => return Ok(SessionEnd::Disconnected { greeted }),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };
        let envelope = match serde_json::from_slice::<SocketEnvelope>(&raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "slack.socket.unparseable");
                continue;
            }
        };

        match envelope.kind.as_str() {
            "hello" => {
                greeted = true;
                info!("slack.socket.connected");
                continue;
            }
            "disconnect" => {
                info!(reason = ?envelope.reason, "slack.socket.disconnect");
                return Ok(SessionEnd::Disconnected { greeted });
            }
            _ => {}
        }

        if let Some(envelope_id) = &envelope.envelope_id {
            let ack = json!({ "envelope_id": envelope_id }).to_string();
            sink.send(WsMessage::Text(ack.into()))
                .await
                .map_err(BrokerError::transport)?;
        }

        let Some(event) = convert(&envelope) else {
            info!(kind = %envelope.kind, "slack.socket.ignored");
            continue;
        };
        if deliveries.contains(&event.id) {
            info!(id = %event.id, "slack.event.duplicate");
            continue;
        }

        let id = event.id.clone();
        match handler.handle(cancel, event).await {
            Ok(()) => {
                deliveries.insert(id);
            }
            Err(error) => error!(?error, %id, "slack.handler.error"),
        }
    }
}

/// Convert a Socket Mode envelope into an event, if it carries one.
fn convert(envelope: &SocketEnvelope) -> Option<EventEnvelope> {
    let payload = &envelope.payload;
    match envelope.kind.as_str() {
        "events_api" => events_api_envelope(payload),
        "slash_commands" => {
            let id = envelope.envelope_id.clone()?;
            let mut event = EventEnvelope::new(id, ConnectorType::Slack, "slash_command");
            event.action = json_str(payload, "/command");
            event.connector_organization_id = json_str(payload, "/team_id");
            event.actor = json_str(payload, "/user_id");
            event.resource = json_str(payload, "/channel_id");
            event.text = json_str(payload, "/text");
            if let Some(trigger_id) = payload.get("trigger_id") {
                event
                    .extensions
                    .insert(String::from("trigger_id"), trigger_id.clone());
            }
            Some(event)
        }
        "interactive" => {
            let id = envelope.envelope_id.clone()?;
            let mut event = EventEnvelope::new(id, ConnectorType::Slack, "interactive");
            event.action = json_str(payload, "/type");
            event.connector_organization_id = json_str(payload, "/team/id");
            event.actor = json_str(payload, "/user/id");
            event.resource = json_str(payload, "/channel/id");
            if let Value::Object(fields) = payload {
                event.extensions = fields.clone();
            }
            Some(event)
        }
        _ => None,
    }
}
