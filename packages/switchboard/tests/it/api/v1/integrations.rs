//! Integration management endpoints against a seeded store.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use clients::switchboard::v1::{
    AuthorizationIntent, ConnectorType, CredentialKind, IntegrationList, IntegrationStatus,
    IntegrationView,
};
use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};
use simple_test_case::test_case;
use switchboard::{
    auth::{Caller, OrgId, UserId},
    connector::{Authorized, Capabilities, Connector, Credentials, Grant, Registry},
    db::{CredentialStore, Integration, IntegrationStore, NewCredential, NewIntegration},
    error::BrokerError,
};

use crate::helpers::{self, TestFixture, as_caller};

/// Accepts `good` tokens, rejects `bad` ones and is unreachable for `down`.
#[derive(Debug)]
struct TokenChecker;

#[async_trait]
impl Connector for TokenChecker {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::GitHub
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            refresh: false,
            revoke: false,
            subscribe: false,
        }
    }

    async fn initiate_authorization(&self, _state: &str) -> Result<AuthorizationIntent, BrokerError> {
        Err(BrokerError::NotSupported {
            connector: ConnectorType::GitHub,
            capability: "initiate",
        })
    }

    async fn complete_authorization(&self, _grant: Grant) -> Result<Authorized, BrokerError> {
        Err(BrokerError::AuthExchangeFailed {
            reason: String::from("not used"),
        })
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        match credentials.get("token") {
            Some("good") => Ok(()),
            Some("down") => Err(BrokerError::transport("connection refused")),
            _ => Err(BrokerError::CredentialRejected {
                reason: String::from("Bad credentials"),
            }),
        }
    }
}

async fn fixture() -> Result<TestFixture> {
    let connector: Arc<dyn Connector> = Arc::new(TokenChecker);
    TestFixture::spawn([connector].into_iter().collect::<Registry>()).await
}

async fn seed(fixture: &TestFixture, caller: &Caller, token: &str) -> Result<Integration> {
    let credentials = Credentials::new(CredentialKind::Token).with("token", token);
    let integration = fixture
        .store
        .create_integration(
            NewIntegration {
                organization_id: caller.organization_id.clone(),
                user_id: caller.user_id.clone(),
                connector: ConnectorType::GitHub,
                connector_organization_id: Some(String::from("acme")),
                connector_bot_id: None,
                metadata: BTreeMap::new(),
            },
            NewCredential {
                kind: CredentialKind::Token,
                sealed: helpers::keyring().seal_json(&credentials)?,
                expires_at: None,
            },
        )
        .await?;
    fixture.store.activate_integration(integration.id).await?;
    Ok(integration)
}

fn other_org() -> Caller {
    Caller {
        organization_id: OrgId::new("org-2"),
        user_id: UserId::new("user-9"),
    }
}

#[test_log::test(tokio::test)]
async fn identity_is_required() -> Result<()> {
    let fixture = fixture().await?;
    let response = reqwest::get(fixture.url("api/v1/integrations")).await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "error": "caller identity required" })
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn organizations_only_see_their_own() -> Result<()> {
    let fixture = fixture().await?;
    let http = reqwest::Client::new();
    let mine = seed(&fixture, &helpers::caller(), "good").await?;
    let theirs = seed(&fixture, &other_org(), "good").await?;

    let list = as_caller(http.get(fixture.url("api/v1/integrations")), &helpers::caller())
        .send()
        .await?
        .json::<IntegrationList>()
        .await?;
    pretty_assert_eq!(
        list.integrations.iter().map(|view| view.id).collect::<Vec<_>>(),
        vec![mine.id.as_uuid()]
    );
    pretty_assert_eq!(list.integrations[0].status, IntegrationStatus::Active);

    let path = format!("api/v1/integrations/{}", theirs.id.as_uuid());
    let response = as_caller(http.get(fixture.url(&path)), &helpers::caller())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = as_caller(http.delete(fixture.url(&path)), &helpers::caller())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(fixture.store.get_integration(theirs.id).await?.is_some());
    Ok(())
}

#[test_case("good", StatusCode::OK, IntegrationStatus::Active; "accepted")]
#[test_case("bad", StatusCode::UNPROCESSABLE_ENTITY, IntegrationStatus::Error; "rejected")]
#[test_case("down", StatusCode::BAD_GATEWAY, IntegrationStatus::Active; "unreachable")]
#[tokio::test]
async fn validate_records_the_outcome(token: &str, status: StatusCode, after: IntegrationStatus) {
    let fixture = fixture().await.unwrap();
    let integration = seed(&fixture, &helpers::caller(), token).await.unwrap();

    let path = format!("api/v1/integrations/{}/validate", integration.id.as_uuid());
    let response = as_caller(
        reqwest::Client::new().post(fixture.url(&path)),
        &helpers::caller(),
    )
    .send()
    .await
    .unwrap();
    pretty_assert_eq!(response.status(), status);

    let stored = fixture
        .store
        .get_integration(integration.id)
        .await
        .unwrap()
        .unwrap();
    pretty_assert_eq!(stored.status, after);
}

#[test_log::test(tokio::test)]
async fn validate_reactivates_fixed_integrations() -> Result<()> {
    let fixture = fixture().await?;
    let integration = seed(&fixture, &helpers::caller(), "good").await?;
    fixture
        .store
        .set_integration_status(integration.id, IntegrationStatus::Error)
        .await?;

    let path = format!("api/v1/integrations/{}/validate", integration.id.as_uuid());
    let view = as_caller(reqwest::Client::new().post(fixture.url(&path)), &helpers::caller())
        .send()
        .await?
        .error_for_status()?
        .json::<IntegrationView>()
        .await?;
    pretty_assert_eq!(view.status, IntegrationStatus::Active);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn refresh_without_support_conflicts() -> Result<()> {
    let fixture = fixture().await?;
    let integration = seed(&fixture, &helpers::caller(), "good").await?;

    let path = format!("api/v1/integrations/{}/refresh", integration.id.as_uuid());
    let response = as_caller(reqwest::Client::new().post(fixture.url(&path)), &helpers::caller())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::CONFLICT);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn revoke_deletes_even_without_remote_revocation() -> Result<()> {
    let fixture = fixture().await?;
    let http = reqwest::Client::new();
    let integration = seed(&fixture, &helpers::caller(), "good").await?;

    let path = format!("api/v1/integrations/{}", integration.id.as_uuid());
    let response = as_caller(http.delete(fixture.url(&path)), &helpers::caller())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = as_caller(http.get(fixture.url(&path)), &helpers::caller())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(fixture.store.get_credential(integration.id).await?.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn malformed_id_is_bad_request() -> Result<()> {
    let fixture = fixture().await?;
    let response = as_caller(
        reqwest::Client::new().get(fixture.url("api/v1/integrations/not-a-uuid")),
        &helpers::caller(),
    )
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
