//! Command line and environment configuration.
//!
//! Connectors are optional: a connector whose required settings are missing
//! is disabled with a warning and the rest of the service starts normally.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::Debug;
use oauth2::ClientSecret;
use tracing::warn;
use url::Url;

use crate::{
    connector::{
        github::GitHubConfig,
        slack::{Backoff, SlackConfig},
    },
    crypto::{KeyId, Keyring},
    device::DeviceConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API server, webhook listeners and event subscriptions.
    Serve(ServeConfig),

    /// Apply database migrations.
    Migrate(DatabaseConfig),

    /// Re-encrypt every stored credential under the current key.
    RotateKeys(RotateKeysConfig),
}

#[derive(Args, Debug)]
pub struct DatabaseConfig {
    /// Database URL (Postgres)
    #[arg(long, env = "DATABASE_URL")]
    #[debug(skip)]
    pub database_url: String,
}

#[derive(Args, Debug)]
pub struct RotateKeysConfig {
    #[command(flatten)]
    pub database: DatabaseConfig,

    #[command(flatten)]
    pub encryption: EncryptionConfig,
}

/// A retired encryption key given as `ID=SECRET`.
#[derive(Clone, Debug)]
pub struct PreviousKey {
    pub id: KeyId,
    #[debug(skip)]
    pub secret: String,
}

impl FromStr for PreviousKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((id, secret)) if !id.is_empty() && !secret.is_empty() => Ok(Self {
                id: KeyId::new(id),
                secret: secret.to_owned(),
            }),
            _ => Err(String::from("expected ID=SECRET")),
        }
    }
}

#[derive(Args, Debug)]
pub struct EncryptionConfig {
    /// Secret the credential encryption key is derived from
    #[arg(long, env = "ENCRYPTION_SECRET", hide_env_values = true)]
    #[debug(skip)]
    pub encryption_secret: String,

    /// Id recorded next to everything encrypted with the current key
    #[arg(long, env = "ENCRYPTION_KEY_ID", default_value = "v1")]
    pub encryption_key_id: String,

    /// Retired keys that can still decrypt, as ID=SECRET (repeatable)
    #[arg(
        long = "previous-encryption-key",
        env = "PREVIOUS_ENCRYPTION_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub previous_encryption_keys: Vec<PreviousKey>,
}

impl EncryptionConfig {
    pub fn keyring(&self) -> Result<Keyring> {
        let mut keyring = Keyring::new(KeyId::new(&self.encryption_key_id), &self.encryption_secret)
            .map_err(|error| eyre!("build keyring: {error}"))?;
        for previous in &self.previous_encryption_keys {
            keyring = keyring
                .with_previous(previous.id.clone(), &previous.secret)
                .map_err(|error| eyre!("add previous key {}: {error}", previous.id))?;
        }
        Ok(keyring)
    }
}

#[derive(Args, Debug)]
pub struct ServeConfig {
    /// Database URL (Postgres); without it data is kept in memory
    #[arg(long, env = "DATABASE_URL")]
    #[debug(skip)]
    pub database_url: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Public base URL of this service, used to build callback URLs
    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:3000")]
    pub public_url: Url,

    /// Trust x-organization-id and x-user-id headers set by an upstream backend
    #[arg(long, env = "TRUST_IDENTITY_HEADERS")]
    pub trust_identity_headers: bool,

    /// Secret for signing authorization state; defaults to the encryption secret
    #[arg(long, env = "STATE_SECRET", hide_env_values = true)]
    #[debug(skip)]
    pub state_secret: Option<String>,

    /// Seconds between health checks of active integrations
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value = "900")]
    pub health_check_interval_secs: u64,

    /// Seconds between deletions of expired installations and device sessions
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "3600")]
    pub cleanup_interval_secs: u64,

    /// Seconds in-flight work may take to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    pub shutdown_grace_secs: u64,

    #[command(flatten)]
    pub encryption: EncryptionConfig,

    #[command(flatten)]
    pub device: DeviceArgs,

    #[command(flatten)]
    pub slack: SlackArgs,

    #[command(flatten)]
    pub github: GitHubArgs,
}

impl ServeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn state_secret(&self) -> &str {
        self.state_secret
            .as_deref()
            .unwrap_or(&self.encryption.encryption_secret)
    }

    /// The public URL of an API path.
    pub fn public_endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.public_url.clone();
        url.path_segments_mut()
            .map_err(|()| eyre!("public URL cannot have path segments: {}", self.public_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn device_config(&self) -> Result<DeviceConfig> {
        let verification_uri = match &self.device.device_verification_uri {
            Some(uri) => uri.clone(),
            None => self.public_endpoint(&["device"])?,
        };
        Ok(DeviceConfig {
            verification_uri,
            code_ttl: seconds(self.device.device_code_ttl_secs)?,
            interval: seconds(self.device.device_poll_interval_secs)?,
            access_ttl: seconds(self.device.device_access_ttl_secs)?,
            refresh_ttl: seconds(self.device.device_refresh_ttl_secs)?,
        })
    }

    /// Slack settings, or `None` if Slack is not configured.
    pub fn slack_config(&self) -> Result<Option<SlackConfig>> {
        let args = &self.slack;
        let mut missing = Vec::new();
        if args.slack_client_id.is_none() {
            missing.push("--slack-client-id");
        }
        if args.slack_client_secret.is_none() {
            missing.push("--slack-client-secret");
        }
        let (Some(client_id), Some(client_secret)) =
            (&args.slack_client_id, &args.slack_client_secret)
        else {
            warn!(connector = "slack", ?missing, "connector.disabled");
            return Ok(None);
        };

        let webhook_addr = match (&args.slack_signing_secret, args.slack_webhook_port) {
            (Some(_), Some(port)) => Some(SocketAddr::new(self.host, port)),
            (Some(_), None) | (None, Some(_)) if args.slack_app_token.is_none() => {
                warn!(connector = "slack", "connector.events.incomplete");
                None
            }
            _ => None,
        };
        if args.slack_app_token.is_none() && webhook_addr.is_none() {
            warn!(connector = "slack", "connector.events.disabled");
        }

        Ok(Some(SlackConfig {
            client_id: client_id.clone(),
            client_secret: ClientSecret::new(client_secret.clone()),
            scopes: args.slack_scopes.clone(),
            redirect_uri: self.public_endpoint(&["api", "v1", "connectors", "slack", "callback"])?,
            app_token: args.slack_app_token.clone(),
            signing_secret: args.slack_signing_secret.clone(),
            webhook_addr,
            api_base: args.slack_api_base.clone(),
            authorize_url: args.slack_authorize_url.clone(),
            backoff: Backoff::default(),
            shutdown_grace: self.shutdown_grace(),
        }))
    }

    /// GitHub App settings, or `None` if the app is not configured.
    pub async fn github_config(&self) -> Result<Option<GitHubConfig>> {
        let args = &self.github;
        let private_key = match (&args.github_private_key, &args.github_private_key_file) {
            (Some(pem), _) => Some(pem.clone()),
            (None, Some(path)) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("read GitHub App private key from {path:?}"))?,
            ),
            (None, None) => None,
        };

        let mut missing = Vec::new();
        if args.github_app_id.is_none() {
            missing.push("--github-app-id");
        }
        if args.github_app_slug.is_none() {
            missing.push("--github-app-slug");
        }
        if private_key.is_none() {
            missing.push("--github-private-key");
        }
        let (Some(app_id), Some(app_slug), Some(private_key)) =
            (&args.github_app_id, &args.github_app_slug, private_key)
        else {
            warn!(connector = "github", ?missing, "connector.disabled");
            return Ok(None);
        };

        let webhook_addr = match (&args.github_webhook_secret, args.github_webhook_port) {
            (Some(_), Some(port)) => Some(SocketAddr::new(self.host, port)),
            (None, None) => {
                warn!(connector = "github", "connector.events.disabled");
                None
            }
            _ => {
                warn!(connector = "github", "connector.events.incomplete");
                None
            }
        };
        if args.github_installation_ttl_secs == 0 {
            bail!("--github-installation-ttl-secs must be positive");
        }

        Ok(Some(GitHubConfig {
            app_id: app_id.clone(),
            app_slug: app_slug.clone(),
            private_key,
            webhook_secret: args.github_webhook_secret.clone(),
            webhook_addr,
            api_base: args.github_api_base.clone(),
            web_base: args.github_web_base.clone(),
            installation_ttl: seconds(args.github_installation_ttl_secs)?,
            shutdown_grace: self.shutdown_grace(),
        }))
    }
}

fn seconds(secs: u64) -> Result<time::Duration> {
    let secs = i64::try_from(secs).context("duration out of range")?;
    Ok(time::Duration::seconds(secs))
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Page where users enter device user codes; defaults to PUBLIC_URL/device
    #[arg(long, env = "DEVICE_VERIFICATION_URI")]
    pub device_verification_uri: Option<Url>,

    #[arg(long, env = "DEVICE_CODE_TTL_SECS", default_value = "900")]
    pub device_code_ttl_secs: u64,

    #[arg(long, env = "DEVICE_POLL_INTERVAL_SECS", default_value = "5")]
    pub device_poll_interval_secs: u64,

    #[arg(long, env = "DEVICE_ACCESS_TTL_SECS", default_value = "3600")]
    pub device_access_ttl_secs: u64,

    #[arg(long, env = "DEVICE_REFRESH_TTL_SECS", default_value = "2592000")]
    pub device_refresh_ttl_secs: u64,
}

#[derive(Args, Debug)]
pub struct SlackArgs {
    #[arg(long, env = "SLACK_CLIENT_ID")]
    pub slack_client_id: Option<String>,

    #[arg(long, env = "SLACK_CLIENT_SECRET", hide_env_values = true)]
    #[debug(skip)]
    pub slack_client_secret: Option<String>,

    /// Bot scopes requested during installation
    #[arg(
        long,
        env = "SLACK_SCOPES",
        value_delimiter = ',',
        default_value = "app_mentions:read,channels:history,chat:write,commands"
    )]
    pub slack_scopes: Vec<String>,

    /// App-level token (xapp-...); enables Socket Mode
    #[arg(long, env = "SLACK_APP_TOKEN", hide_env_values = true)]
    #[debug(skip)]
    pub slack_app_token: Option<String>,

    /// Signing secret; with --slack-webhook-port enables the Events API listener
    #[arg(long, env = "SLACK_SIGNING_SECRET", hide_env_values = true)]
    #[debug(skip)]
    pub slack_signing_secret: Option<String>,

    #[arg(long, env = "SLACK_WEBHOOK_PORT")]
    pub slack_webhook_port: Option<u16>,

    #[arg(long, env = "SLACK_API_BASE", default_value = SlackConfig::DEFAULT_API_BASE)]
    pub slack_api_base: Url,

    #[arg(long, env = "SLACK_AUTHORIZE_URL", default_value = SlackConfig::DEFAULT_AUTHORIZE_URL)]
    pub slack_authorize_url: Url,
}

#[derive(Args, Debug)]
pub struct GitHubArgs {
    #[arg(long, env = "GITHUB_APP_ID")]
    pub github_app_id: Option<String>,

    /// The app's URL name, as in github.com/apps/<slug>
    #[arg(long, env = "GITHUB_APP_SLUG")]
    pub github_app_slug: Option<String>,

    /// PEM encoded private key of the app
    #[arg(long, env = "GITHUB_PRIVATE_KEY", hide_env_values = true)]
    #[debug(skip)]
    pub github_private_key: Option<String>,

    #[arg(long, env = "GITHUB_PRIVATE_KEY_FILE", conflicts_with = "github_private_key")]
    pub github_private_key_file: Option<PathBuf>,

    /// Webhook secret; with --github-webhook-port enables the webhook listener
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    #[debug(skip)]
    pub github_webhook_secret: Option<String>,

    #[arg(long, env = "GITHUB_WEBHOOK_PORT")]
    pub github_webhook_port: Option<u16>,

    #[arg(long, env = "GITHUB_API_BASE", default_value = GitHubConfig::DEFAULT_API_BASE)]
    pub github_api_base: Url,

    #[arg(long, env = "GITHUB_WEB_BASE", default_value = GitHubConfig::DEFAULT_WEB_BASE)]
    pub github_web_base: Url,

    /// Seconds an installation nobody claimed is kept
    #[arg(long, env = "GITHUB_INSTALLATION_TTL_SECS", default_value = "259200")]
    pub github_installation_ttl_secs: u64,
}
