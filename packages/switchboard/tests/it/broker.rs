//! Broker lifecycle with scripted connectors.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use clients::switchboard::v1::{AuthorizationIntent, ConnectorType, CredentialKind};
use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use switchboard::{
    auth::{OrgId, UserId},
    broker::{Broker, HandlerRegistry},
    connector::{
        Authorized, Capabilities, Connector, Credentials, EventEnvelope, EventHandler, Grant,
        Registry, handler_fn,
    },
    db::{IntegrationStore, Memory, NewCredential, NewIntegration, Storage},
    error::BrokerError,
};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::helpers;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
enum Script {
    /// Run until cancelled.
    Idle,
    /// Deliver one event for account `T1`, then run until cancelled.
    Emit,
    /// Fail shortly after starting.
    Fail,
    Panic,
    /// Never return, even when cancelled.
    Stuck,
    /// Report no subscribe capability.
    Passive,
}

#[derive(Debug)]
struct Scripted {
    kind: ConnectorType,
    script: Script,
    saw_cancel: Arc<AtomicBool>,
}

impl Scripted {
    fn new(kind: ConnectorType, script: Script) -> (Arc<dyn Connector>, Arc<AtomicBool>) {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(Self {
            kind,
            script,
            saw_cancel: saw_cancel.clone(),
        });
        (connector, saw_cancel)
    }
}

#[async_trait]
impl Connector for Scripted {
    fn connector_type(&self) -> ConnectorType {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            refresh: false,
            revoke: false,
            subscribe: !matches!(self.script, Script::Passive),
        }
    }

    async fn initiate_authorization(&self, _state: &str) -> Result<AuthorizationIntent, BrokerError> {
        Err(BrokerError::NotSupported {
            connector: self.kind,
            capability: "initiate",
        })
    }

    async fn complete_authorization(&self, _grant: Grant) -> Result<Authorized, BrokerError> {
        Err(BrokerError::AuthExchangeFailed {
            reason: String::from("scripted"),
        })
    }

    async fn validate_credentials(&self, _credentials: &Credentials) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BrokerError> {
        match self.script {
            Script::Idle => {}
            Script::Emit => {
                let mut event = EventEnvelope::new("Ev1", self.kind, "app_mention");
                event.connector_organization_id = Some(String::from("T1"));
                if let Err(error) = handler.handle(&cancel, event).await {
                    return Err(BrokerError::Internal(error));
                }
            }
            Script::Fail => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(BrokerError::TransportFailure(String::from("socket closed")));
            }
            Script::Panic => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                panic!("scripted panic");
            }
            Script::Stuck => {
                std::future::pending::<()>().await;
            }
            Script::Passive => panic!("passive connectors are never subscribed"),
        }
        cancel.cancelled().await;
        self.saw_cancel.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn broker(connectors: Vec<Arc<dyn Connector>>) -> Broker {
    Broker::new(
        connectors.into_iter().collect::<Registry>(),
        HandlerRegistry::default(),
        Arc::new(Memory::new()),
    )
    .with_grace(Duration::from_millis(200))
}

#[test_log::test(tokio::test)]
async fn cancellation_stops_every_subscription() -> Result<()> {
    let (slack, slack_cancelled) = Scripted::new(ConnectorType::Slack, Script::Idle);
    let (github, github_cancelled) = Scripted::new(ConnectorType::GitHub, Script::Idle);
    let broker = broker(vec![slack, github]);

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { broker.subscribe(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    timeout(WAIT, running).await???;
    assert!(slack_cancelled.load(Ordering::SeqCst));
    assert!(github_cancelled.load(Ordering::SeqCst));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn first_failure_cancels_siblings() -> Result<()> {
    let (slack, _) = Scripted::new(ConnectorType::Slack, Script::Fail);
    let (github, github_cancelled) = Scripted::new(ConnectorType::GitHub, Script::Idle);
    let parent = CancellationToken::new();

    let result = timeout(WAIT, broker(vec![slack, github]).subscribe(parent.clone())).await?;
    assert!(
        matches!(result, Err(BrokerError::TransportFailure(ref reason)) if reason == "socket closed"),
        "unexpected result: {result:?}"
    );
    assert!(github_cancelled.load(Ordering::SeqCst));
    // Only the broker's own group is cancelled; the caller decides what to
    // do with the error.
    assert!(!parent.is_cancelled());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn panic_is_reported_as_failure() -> Result<()> {
    let (slack, _) = Scripted::new(ConnectorType::Slack, Script::Panic);
    let (github, github_cancelled) = Scripted::new(ConnectorType::GitHub, Script::Idle);

    let result = timeout(WAIT, broker(vec![slack, github]).subscribe(CancellationToken::new())).await?;
    assert!(
        matches!(result, Err(BrokerError::Internal(_))),
        "unexpected result: {result:?}"
    );
    assert!(github_cancelled.load(Ordering::SeqCst));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn stuck_subscription_is_aborted_after_grace() -> Result<()> {
    let (slack, _) = Scripted::new(ConnectorType::Slack, Script::Stuck);
    let (github, _) = Scripted::new(ConnectorType::GitHub, Script::Fail);

    let started = tokio::time::Instant::now();
    let result = timeout(WAIT, broker(vec![slack, github]).subscribe(CancellationToken::new())).await?;
    assert!(matches!(result, Err(BrokerError::TransportFailure(_))));
    assert!(started.elapsed() >= Duration::from_millis(200));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn passive_connectors_are_skipped() -> Result<()> {
    let (slack, _) = Scripted::new(ConnectorType::Slack, Script::Passive);
    let result = timeout(WAIT, broker(vec![slack]).subscribe(CancellationToken::new())).await?;
    assert!(result.is_ok());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn events_are_attributed_and_routed() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let integration = store
        .create_integration(
            NewIntegration {
                organization_id: OrgId::new("org-1"),
                user_id: UserId::new("user-1"),
                connector: ConnectorType::Slack,
                connector_organization_id: Some(String::from("T1")),
                connector_bot_id: None,
                metadata: BTreeMap::new(),
            },
            NewCredential {
                kind: CredentialKind::Oauth2,
                sealed: helpers::keyring().seal(b"{}")?,
                expires_at: None,
            },
        )
        .await?;
    store.activate_integration(integration.id).await?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let handlers = HandlerRegistry::default().on(
        ConnectorType::Slack,
        "app_mention",
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok::<_, color_eyre::Report>(())
            }
        }),
    );
    let (slack, _) = Scripted::new(ConnectorType::Slack, Script::Emit);
    let broker = Broker::new([slack].into_iter().collect(), handlers, store);

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { broker.subscribe(cancel).await }
    });

    let event: EventEnvelope = timeout(WAIT, events.recv()).await?.expect("event routed");
    pretty_assert_eq!(event.integration_id, Some(integration.id));
    pretty_assert_eq!(event.organization_id, Some(OrgId::new("org-1")));

    cancel.cancel();
    timeout(WAIT, running).await???;
    Ok(())
}
