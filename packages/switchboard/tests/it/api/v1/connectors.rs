//! Authorization endpoints, addressed by connector.

use std::sync::Arc;

use async_trait::async_trait;
use clients::switchboard::v1::{
    AuthorizationIntent, ClaimInstallationRequest, ConnectorType, CredentialKind, IntegrationStatus,
    IntegrationView, IntentKind,
};
use color_eyre::{Result, eyre::OptionExt};
use pretty_assertions::assert_eq as pretty_assert_eq;
use reqwest::StatusCode;
use switchboard::{
    connector::{
        Authorized, Capabilities, ConnectedAccount, Connector, Credentials, Grant, Registry,
    },
    error::BrokerError,
};
use url::Url;

use crate::helpers::{self, TestFixture, as_caller};

/// A Slack stand-in that accepts every code except `denied`.
#[derive(Debug)]
struct Consent;

#[async_trait]
impl Connector for Consent {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Slack
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            refresh: false,
            revoke: false,
            subscribe: false,
        }
    }

    async fn initiate_authorization(&self, state: &str) -> Result<AuthorizationIntent, BrokerError> {
        let mut url = Url::parse("https://consent.example.com/authorize")
            .map_err(BrokerError::transport)?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(AuthorizationIntent::builder()
            .kind(IntentKind::OauthRedirect)
            .url(url.as_str())
            .build())
    }

    async fn complete_authorization(&self, grant: Grant) -> Result<Authorized, BrokerError> {
        match grant {
            Grant::Code(code) if code != "denied" => Ok(Authorized {
                credentials: Credentials::new(CredentialKind::Oauth2).with("access_token", code),
                account: ConnectedAccount {
                    connector_organization_id: String::from("T1"),
                    ..Default::default()
                },
            }),
            _ => Err(BrokerError::AuthExchangeFailed {
                reason: String::from("access_denied"),
            }),
        }
    }

    async fn validate_credentials(&self, _credentials: &Credentials) -> Result<(), BrokerError> {
        Ok(())
    }
}

async fn fixture() -> Result<TestFixture> {
    let connector: Arc<dyn Connector> = Arc::new(Consent);
    TestFixture::spawn([connector].into_iter().collect::<Registry>()).await
}

async fn initiate(fixture: &TestFixture, connector: &str) -> Result<reqwest::Response> {
    let path = format!("api/v1/connectors/{connector}/initiate");
    let response = as_caller(reqwest::Client::new().post(fixture.url(&path)), &helpers::caller())
        .send()
        .await?;
    Ok(response)
}

#[test_log::test(tokio::test)]
async fn health_answers_without_identity() -> Result<()> {
    let fixture = fixture().await?;
    let response = reqwest::get(fixture.url("health")).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn initiate_then_callback_creates_integration() -> Result<()> {
    let fixture = fixture().await?;

    let intent = initiate(&fixture, "slack")
        .await?
        .error_for_status()?
        .json::<AuthorizationIntent>()
        .await?;
    pretty_assert_eq!(intent.kind, IntentKind::OauthRedirect);
    let state = Url::parse(&intent.url)?
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .ok_or_eyre("intent carries a state")?;

    let mut callback = fixture.url("api/v1/connectors/slack/callback");
    callback
        .query_pairs_mut()
        .append_pair("code", "xoxb-test")
        .append_pair("state", &state);
    let view = reqwest::get(callback)
        .await?
        .error_for_status()?
        .json::<IntegrationView>()
        .await?;
    pretty_assert_eq!(view.organization_id, "org-1");
    pretty_assert_eq!(view.user_id, "user-1");
    pretty_assert_eq!(view.connector, ConnectorType::Slack);
    pretty_assert_eq!(view.status, IntegrationStatus::Active);
    pretty_assert_eq!(view.connector_organization_id.as_deref(), Some("T1"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn denied_consent_is_bad_request() -> Result<()> {
    let fixture = fixture().await?;
    let state = helpers::signer().sign(
        ConnectorType::Slack,
        &helpers::caller(),
        time::Duration::minutes(5),
    );

    let mut callback = fixture.url("api/v1/connectors/slack/callback");
    callback
        .query_pairs_mut()
        .append_pair("code", "denied")
        .append_pair("state", &state);
    pretty_assert_eq!(reqwest::get(callback).await?.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn callback_without_state_is_bad_request() -> Result<()> {
    let fixture = fixture().await?;
    let response = reqwest::get(fixture.url("api/v1/connectors/slack/callback?code=abc")).await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_and_unconfigured_connectors_are_not_found() -> Result<()> {
    let fixture = fixture().await?;
    pretty_assert_eq!(initiate(&fixture, "jira").await?.status(), StatusCode::NOT_FOUND);
    pretty_assert_eq!(initiate(&fixture, "github").await?.status(), StatusCode::NOT_FOUND);

    let response = as_caller(
        reqwest::Client::new().post(fixture.url("api/v1/connectors/github/claim")),
        &helpers::caller(),
    )
    .json(&ClaimInstallationRequest::builder().installation_id(42).build())
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn initiate_and_claim_require_identity() -> Result<()> {
    let fixture = fixture().await?;
    let http = reqwest::Client::new();

    let response = http
        .post(fixture.url("api/v1/connectors/slack/initiate"))
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = http
        .post(fixture.url("api/v1/connectors/github/claim"))
        .json(&ClaimInstallationRequest::builder().installation_id(42).build())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn health_checks_storage() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;
    let response = reqwest::get(fixture.url("health")).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}
