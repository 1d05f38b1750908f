//! Webhook ingress.
//!
//! Each webhook connector runs its own listener with one route,
//! `POST /webhooks/{connector}`. A delivery goes through the same steps
//! regardless of provider:
//!
//! 1. The full body is read before anything else; signatures cover raw bytes.
//! 2. The provider's signature is checked in constant time (401 on failure).
//! 3. The payload is converted into an [`EventEnvelope`] (or a direct reply,
//!    or dropped with 200 when the event type is of no interest).
//! 4. The event id is reserved in the delivery log. Redeliveries of an id
//!    already handled, or still being handled, are acknowledged without
//!    calling the handler again.
//! 5. The source records its own side effects, then the handler runs. An
//!    error or panic in either releases the reservation and answers 500 so
//!    the provider retries.
//!
//! Panics anywhere in conversion or handling become a 500 through
//! [`CatchPanicLayer`]; the listener keeps serving.

use std::{
    any::Any,
    future::IntoFuture,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Response, StatusCode},
    response::IntoResponse,
    routing::post,
};
use clients::switchboard::v1::ConnectorType;
use hmac::Mac;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    connector::{DeliveryLog, EventEnvelope, EventHandler},
    crypto::HmacSha256,
    error::BrokerError,
};

/// Largest webhook body accepted.
pub const MAX_BODY_SIZE: usize = 5 * 1024 * 1024;

/// Verify a hex encoded HMAC-SHA256 over the concatenation of `parts`.
///
/// The comparison is constant time; a malformed signature fails the same way
/// as a wrong one.
pub fn verify_hmac_sha256(
    secret: &[u8],
    parts: &[&[u8]],
    signature_hex: &str,
) -> Result<(), BrokerError> {
    let provided = hex::decode(signature_hex.trim()).map_err(|_| BrokerError::SignatureInvalid)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| BrokerError::SignatureInvalid)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(&provided)
        .map_err(|_| BrokerError::SignatureInvalid)
}

/// Compute a hex encoded HMAC-SHA256 over the concatenation of `parts`.
pub fn sign_hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Read a header as a string, treating non-UTF8 values as absent.
pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// What to do with a verified delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Deliver to the event handler.
    Event(EventEnvelope),

    /// Answer the provider directly without involving the handler (e.g. a
    /// URL verification challenge).
    Reply(serde_json::Value),

    /// Acknowledge and drop.
    Ignored { event_type: String },
}

/// The provider-specific half of a webhook listener.
#[async_trait]
pub trait WebhookSource: Send + Sync + 'static {
    fn connector_type(&self) -> ConnectorType;

    /// Check the delivery's signature against the raw body.
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), BrokerError>;

    /// Convert a verified delivery.
    async fn accept(&self, headers: &HeaderMap, body: Bytes) -> Result<Inbound, BrokerError>;

    /// Apply the source's own side effects for an event, once per delivery
    /// id. Runs after duplicate detection and before the handler.
    async fn record(&self, _event: &EventEnvelope) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct Ingress {
    source: Arc<dyn WebhookSource>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    deliveries: Mutex<DeliveryLog>,
}

impl Ingress {
    /// Claim `id` for this request. `None` if it was already delivered or
    /// another request holds it.
    fn reserve(&self, id: &str) -> Option<Reservation<'_>> {
        let fresh = self
            .deliveries
            .lock()
            .map(|mut log| log.insert(id))
            .unwrap_or(true);
        fresh.then(|| Reservation {
            deliveries: &self.deliveries,
            id: id.to_owned(),
            delivered: false,
        })
    }
}

/// A delivery id held in the log while its request runs.
///
/// Released on drop unless marked delivered, which covers handler errors,
/// panics and requests dropped mid-flight.
struct Reservation<'a> {
    deliveries: &'a Mutex<DeliveryLog>,
    id: String,
    delivered: bool,
}

impl Reservation<'_> {
    fn delivered(mut self) {
        self.delivered = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        if let Ok(mut log) = self.deliveries.lock() {
            log.remove(&self.id);
        }
    }
}

/// Build the router for one webhook source.
pub fn router(
    source: Arc<dyn WebhookSource>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
) -> Router {
    let path = format!("/webhooks/{}", source.connector_type());
    let ingress = Arc::new(Ingress {
        source,
        handler,
        cancel,
        deliveries: Mutex::new(DeliveryLog::default()),
    });
    Router::new()
        .route(&path, post(receive))
        .with_state(ingress)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE)),
        )
}

/// Serve `router` until `cancel` fires.
///
/// In-flight deliveries get `grace` to finish after cancellation; no new
/// connections are accepted in the meantime.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<(), BrokerError> {
    let addr = listener.local_addr().map_err(BrokerError::transport)?;
    info!(%addr, "webhook.listen");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();
    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result.map_err(BrokerError::transport),
        _ = deadline => {
            warn!(%addr, ?grace, "webhook.shutdown.timeout");
            Ok(())
        }
    }
}

#[derive(Debug)]
enum WebhookResponse {
    Accepted,
    Duplicate,
    Ignored,
    Reply(serde_json::Value),
    BadRequest(String),
    Unauthorized,
    Error,
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            WebhookResponse::Accepted | WebhookResponse::Duplicate | WebhookResponse::Ignored => {
                StatusCode::OK.into_response()
            }
            WebhookResponse::Reply(body) => (StatusCode::OK, Json(body)).into_response(),
            WebhookResponse::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            WebhookResponse::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            WebhookResponse::Error => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

#[tracing::instrument(skip_all, fields(connector = %ingress.source.connector_type()))]
async fn receive(
    State(ingress): State<Arc<Ingress>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    if let Err(error) = ingress.source.verify(&headers, &body) {
        warn!(%error, "webhook.signature.invalid");
        return WebhookResponse::Unauthorized;
    }

    let event = match ingress.source.accept(&headers, body).await {
        Ok(Inbound::Event(event)) => event,
        Ok(Inbound::Reply(reply)) => return WebhookResponse::Reply(reply),
        Ok(Inbound::Ignored { event_type }) => {
            info!(%event_type, "webhook.event.ignored");
            return WebhookResponse::Ignored;
        }
        Err(BrokerError::Internal(error)) => {
            error!(?error, "webhook.accept.error");
            return WebhookResponse::Error;
        }
        Err(error) => {
            warn!(%error, "webhook.payload.invalid");
            return WebhookResponse::BadRequest(error.to_string());
        }
    };

    let Some(reservation) = ingress.reserve(&event.id) else {
        info!(id = %event.id, "webhook.event.duplicate");
        return WebhookResponse::Duplicate;
    };

    let id = event.id.clone();
    let event_type = event.event_type.clone();
    match ingress.source.record(&event).await {
        Ok(()) => {}
        Err(BrokerError::Internal(error)) => {
            error!(?error, %id, %event_type, "webhook.record.error");
            return WebhookResponse::Error;
        }
        Err(error) => {
            warn!(%error, %id, %event_type, "webhook.payload.invalid");
            return WebhookResponse::BadRequest(error.to_string());
        }
    }

    match ingress.handler.handle(&ingress.cancel, event).await {
        Ok(()) => {
            reservation.delivered();
            info!(%id, %event_type, "webhook.event.delivered");
            WebhookResponse::Accepted
        }
        Err(error) => {
            error!(?error, %id, %event_type, "webhook.handler.error");
            WebhookResponse::Error
        }
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(%message, "webhook.handler.panic");
    let mut response = Response::new(Body::from("internal error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
