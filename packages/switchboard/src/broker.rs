//! Event subscriptions across all connectors.
//!
//! [`Broker::subscribe`] runs every connector that can subscribe as its own
//! task. The tasks share one cancellation token: the first connector to fail
//! cancels the others, which then get a grace period to shut down before
//! they are aborted. Event handler errors never reach this level; connectors
//! deal with them per delivery.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use clients::switchboard::v1::ConnectorType;
use color_eyre::{Result, eyre::eyre};
use derive_more::Debug;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    connector::{EventEnvelope, EventHandler, Registry},
    db::{IntegrationStore, Storage},
    error::BrokerError,
};

/// Business handlers, keyed by connector type and then by event type.
#[derive(Clone, Default, Debug)]
#[debug("HandlerRegistry(routes = {}, fallbacks = {})", self.routes.len(), self.fallbacks.len())]
pub struct HandlerRegistry {
    routes: HashMap<(ConnectorType, String), Arc<dyn EventHandler>>,
    fallbacks: HashMap<ConnectorType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Handle `event_type` events from `connector` with `handler`.
    pub fn on(
        mut self,
        connector: ConnectorType,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.routes.insert((connector, event_type.into()), handler);
        self
    }

    /// Handle events from `connector` that have no specific handler.
    pub fn fallback(mut self, connector: ConnectorType, handler: Arc<dyn EventHandler>) -> Self {
        self.fallbacks.insert(connector, handler);
        self
    }

    fn route(&self, connector: ConnectorType, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.routes
            .get(&(connector, event_type.to_owned()))
            .or_else(|| self.fallbacks.get(&connector))
    }
}

/// The handler the broker gives to each connector.
///
/// Attaches the owning integration to each event, then routes it.
#[derive(Debug)]
pub struct Dispatcher {
    connector: ConnectorType,
    handlers: Arc<HandlerRegistry>,
    #[debug(skip)]
    store: Arc<dyn Storage>,
}

impl Dispatcher {
    pub fn new(
        connector: ConnectorType,
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn Storage>,
    ) -> Self {
        Self {
            connector,
            handlers,
            store,
        }
    }
}

#[async_trait]
impl EventHandler for Dispatcher {
    #[tracing::instrument(name = "Dispatcher::handle", skip_all, fields(connector = %self.connector, event_type = %event.event_type, id = %event.id))]
    async fn handle(&self, cancel: &CancellationToken, mut event: EventEnvelope) -> Result<()> {
        if let Some(account) = event.connector_organization_id.as_deref() {
            if let Some(integration) = self
                .store
                .find_integration_by_account(self.connector, account)
                .await?
            {
                event.integration_id = Some(integration.id);
                event.organization_id = Some(integration.organization_id);
            }
        }

        match self.handlers.route(self.connector, &event.event_type) {
            Some(handler) => handler.handle(cancel, event).await,
            None => {
                debug!("broker.event.unrouted");
                Ok(())
            }
        }
    }
}

/// Runs the subscriptions of every configured connector.
#[derive(Clone, Debug)]
pub struct Broker {
    registry: Registry,
    handlers: Arc<HandlerRegistry>,
    #[debug(skip)]
    store: Arc<dyn Storage>,
    grace: Duration,
}

impl Broker {
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

    pub fn new(registry: Registry, handlers: HandlerRegistry, store: Arc<dyn Storage>) -> Self {
        Self {
            registry,
            handlers: Arc::new(handlers),
            store,
            grace: Self::DEFAULT_GRACE,
        }
    }

    /// How long subscriptions may take to stop once cancelled.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Subscribe to every connector until `cancel` fires or one of them
    /// fails.
    ///
    /// Returns the first failure. Either way, every subscription has stopped
    /// (or been aborted after the grace period) when this returns.
    #[tracing::instrument(name = "Broker::subscribe", skip_all)]
    pub async fn subscribe(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let group = cancel.child_token();
        let mut tasks = JoinSet::new();
        for connector in self.registry.iter() {
            let kind = connector.connector_type();
            if !connector.capabilities().subscribe {
                info!(connector = %kind, "broker.subscribe.skipped");
                continue;
            }

            let connector = connector.clone();
            let handler = Arc::new(Dispatcher::new(kind, self.handlers.clone(), self.store.clone()));
            let token = group.clone();
            tasks.spawn(async move { (kind, connector.subscribe(token, handler).await) });
            info!(connector = %kind, "broker.subscribe.started");
        }

        let first_error = loop {
            tokio::select! {
                _ = group.cancelled() => break None,
                joined = tasks.join_next() => match joined {
                    None => {
                        info!("broker.subscribe.finished");
                        return Ok(());
                    }
                    Some(Ok((kind, Ok(())))) => info!(connector = %kind, "broker.subscribe.stopped"),
                    Some(Ok((kind, Err(error)))) => {
                        error!(connector = %kind, %error, "broker.subscribe.failed");
                        group.cancel();
                        break Some(error);
                    }
                    Some(Err(join_error)) => {
                        error!(?join_error, "broker.subscribe.panicked");
                        group.cancel();
                        break Some(BrokerError::Internal(eyre!("subscription task failed: {join_error}")));
                    }
                },
            }
        };

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((kind, Ok(()))) => info!(connector = %kind, "broker.subscribe.stopped"),
                    Ok((kind, Err(error))) => {
                        warn!(connector = %kind, %error, "broker.subscribe.failed_during_shutdown");
                    }
                    Err(join_error) => warn!(?join_error, "broker.subscribe.panicked_during_shutdown"),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "broker.shutdown.timeout");
            tasks.abort_all();
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
