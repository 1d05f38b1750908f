use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use aerosol::Aero;
use atomic_time::AtomicInstant;
use clap::Parser;
use clients::switchboard::v1::ConnectorType;
use color_eyre::{Result, eyre::Context};
use switchboard::{
    api,
    auth::CallerPolicy,
    broker::{Broker, HandlerRegistry},
    config::{Command, Config, DatabaseConfig, RotateKeysConfig, ServeConfig},
    connector::{Connector, Registry, github::GitHub, handler_fn, slack::Slack},
    crypto::StateSigner,
    db::{Memory, Postgres, Storage},
    device::DeviceFlow,
    integration::Integrations,
};
use tap::Pipe;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_tree::time::FormatTime;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match config.command {
        Command::Serve(config) => serve(config).await,
        Command::Migrate(config) => migrate(config).await,
        Command::RotateKeys(config) => rotate_keys(config).await,
    }
}

async fn migrate(config: DatabaseConfig) -> Result<()> {
    let db = Postgres::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("migrations.applied");
    Ok(())
}

async fn rotate_keys(config: RotateKeysConfig) -> Result<()> {
    let db = Postgres::connect(&config.database.database_url).await?;
    db.validate_migrations().await?;

    // Key rotation never talks to a provider, so no connectors are needed.
    let keyring = config.encryption.keyring()?;
    let signer = StateSigner::new(&config.encryption.encryption_secret);
    let integrations = Integrations::new(Arc::new(db), keyring, signer, Registry::default());
    let rotated = integrations.rotate_keys().await?;
    info!(rotated, "credentials.rotated");
    Ok(())
}

async fn serve(config: ServeConfig) -> Result<()> {
    let store: Arc<dyn Storage> = match &config.database_url {
        Some(url) => {
            let db = Postgres::connect(url).await?;
            db.validate_migrations().await?;
            Arc::new(db)
        }
        None => {
            warn!("storage.memory: data will not survive a restart");
            Arc::new(Memory::new())
        }
    };

    let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
    if let Some(slack) = config.slack_config()? {
        connectors.push(Arc::new(Slack::new(slack).context("configure slack")?));
    }
    if let Some(github) = config.github_config().await? {
        connectors.push(Arc::new(
            GitHub::new(github, store.clone()).context("configure github")?,
        ));
    }
    let registry = connectors.into_iter().collect::<Registry>();
    if registry.is_empty() {
        warn!("connector.none: only device authorization is available");
    }
    for connector in registry.iter() {
        info!(connector = %connector.connector_type(), capabilities = ?connector.capabilities(), "connector.enabled");
    }

    let integrations = Integrations::new(
        store.clone(),
        config.encryption.keyring()?,
        StateSigner::new(config.state_secret()),
        registry.clone(),
    );
    let device = DeviceFlow::new(store.clone(), config.device_config()?);
    let policy = CallerPolicy {
        trust_identity_headers: config.trust_identity_headers,
    };
    if policy.trust_identity_headers {
        warn!("auth.identity_headers: trusting x-organization-id and x-user-id");
    }

    let state = Aero::new()
        .with(policy)
        .with(device.clone())
        .with(integrations.clone());
    let app = api::router(state);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown.signal"),
                Err(error) => error!(?error, "shutdown.signal.error"),
            }
            cancel.cancel();
        }
    });

    let handlers = HandlerRegistry::default()
        .fallback(ConnectorType::Slack, handler_fn(log_event))
        .fallback(ConnectorType::GitHub, handler_fn(log_event));
    let broker = Broker::new(registry, handlers, store).with_grace(config.shutdown_grace());

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let shutdown = cancel.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await });

    let maintenance = maintenance(
        integrations,
        device,
        config.health_check_interval(),
        config.cleanup_interval(),
        cancel.clone(),
    );

    let (served, subscribed, ()) = tokio::join!(
        async {
            let result = server.await;
            cancel.cancel();
            result
        },
        async {
            // Returns early without error when nothing subscribes; the API
            // keeps serving until shutdown.
            let result = broker.subscribe(cancel.clone()).await;
            if let Err(error) = &result {
                error!(%error, "broker.failed");
                cancel.cancel();
            }
            result
        },
        maintenance,
    );
    served.context("serve api")?;
    subscribed.context("run connectors")?;
    info!("shutdown.complete");
    Ok(())
}

/// Periodic health checks and cleanup, until `cancel` fires.
async fn maintenance(
    integrations: Integrations,
    device: DeviceFlow,
    health_interval: Duration,
    cleanup_interval: Duration,
    cancel: CancellationToken,
) {
    let mut health = tokio::time::interval(health_interval);
    let mut cleanup = tokio::time::interval(cleanup_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = health.tick() => match integrations.check_active().await {
                Ok(report) => info!(healthy = report.healthy, failed = report.failed, "health.checked"),
                Err(error) => warn!(?error, "health.check.error"),
            },
            _ = cleanup.tick() => {
                match integrations.cleanup_expired().await {
                    Ok(removed) => info!(removed, "installations.cleaned"),
                    Err(error) => warn!(?error, "installations.cleanup.error"),
                }
                match device.cleanup().await {
                    Ok(removed) => info!(removed, "device_sessions.cleaned"),
                    Err(error) => warn!(?error, "device_sessions.cleanup.error"),
                }
            }
        }
    }
}

async fn log_event(event: switchboard::connector::EventEnvelope) -> Result<()> {
    info!(
        id = %event.id,
        connector = %event.connector,
        event_type = %event.event_type,
        action = ?event.action,
        integration = ?event.integration_id,
        "event.received"
    );
    Ok(())
}

/// Prints the overall latency and latency between tracing events.
struct Uptime {
    start: Instant,
    prior: AtomicInstant,
}

impl Uptime {
    /// Get the [`Duration`] since the last time this function was called.
    ///
    /// Relaxed ordering; good enough for humans reading logs.
    fn elapsed_since_prior(&self) -> Duration {
        const RELAXED: Ordering = Ordering::Relaxed;
        self.prior
            .fetch_update(RELAXED, RELAXED, |_| Some(Instant::now()))
            .unwrap_or_else(|_| Instant::now())
            .pipe(|prior| prior.elapsed())
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            prior: AtomicInstant::now(),
        }
    }
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut impl std::fmt::Write) -> std::fmt::Result {
        let seconds = self.start.elapsed().as_secs_f64();
        write!(w, "{seconds:.03}s")
    }

    // `elapsed` is the time spent in the current span; show the gap since
    // the previous line instead.
    fn style_timestamp(
        &self,
        _ansi: bool,
        _elapsed: Duration,
        w: &mut impl std::fmt::Write,
    ) -> std::fmt::Result {
        let elapsed = self.elapsed_since_prior().as_millis();
        write!(w, "{elapsed: >3}ms")
    }
}
