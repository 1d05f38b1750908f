//! GitHub App installs, from webhook to usable credentials.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
};
use clients::switchboard::v1::{ConnectorType, IntegrationStatus, IntegrationView};
use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use serde_json::{Value, json};
use switchboard::{
    auth::{Caller, IntegrationId},
    broker::{Dispatcher, HandlerRegistry},
    connector::{
        Connector, Credentials, EventEnvelope, GitHub, Registry,
        github::{self, GitHubConfig},
        handler_fn,
    },
    db::{CredentialStore, InstallationStore, IntegrationStore, Memory, Storage},
    webhook,
};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::helpers::{self, GITHUB_APP_KEY, TestFixture, as_caller};

const WEBHOOK_SECRET: &str = "github-webhook-secret";

#[derive(Default)]
struct FakeGitHub {
    minted: AtomicUsize,
    revoked: AtomicUsize,
}

async fn installation(Path(id): Path<i64>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !bearer(&headers).is_some_and(|token| token.split('.').count() == 3) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "jwt required" })));
    }
    if id != 42 {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" })));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": 42,
            "account": { "id": 7, "login": "acme", "type": "Organization" },
            "repository_selection": "all",
        })),
    )
}

async fn access_token(
    State(fake): State<Arc<FakeGitHub>>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    let minted = fake.minted.fetch_add(1, Ordering::SeqCst) + 1;
    let expires_at = (OffsetDateTime::now_utc() + Duration::hours(1))
        .format(&Rfc3339)
        .unwrap();
    (
        StatusCode::CREATED,
        Json(json!({ "token": format!("ghs_{id}_{minted}"), "expires_at": expires_at })),
    )
}

async fn repositories(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    match bearer(&headers) {
        Some(token) if token.starts_with("ghs_") => (
            StatusCode::OK,
            Json(json!({ "total_count": 0, "repositories": [] })),
        ),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Bad credentials" }))),
    }
}

async fn revoke(State(fake): State<Arc<FakeGitHub>>) -> StatusCode {
    fake.revoked.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn fake_github() -> Result<(Arc<FakeGitHub>, Url)> {
    let fake = Arc::new(FakeGitHub::default());
    let router = Router::new()
        .route("/app/installations/{id}", get(installation))
        .route("/app/installations/{id}/access_tokens", post(access_token))
        .route("/installation/repositories", get(repositories))
        .route("/installation/token", delete(revoke))
        .with_state(fake.clone());
    let url = helpers::serve(router).await?;
    Ok((fake, url))
}

fn connector(api_base: Url, store: Arc<dyn Storage>) -> GitHub {
    let config = GitHubConfig {
        app_id: String::from("1234"),
        app_slug: String::from("switchboard-test"),
        private_key: String::from(GITHUB_APP_KEY),
        webhook_secret: Some(String::from(WEBHOOK_SECRET)),
        webhook_addr: None,
        web_base: Url::parse("https://github.example.com").unwrap(),
        api_base,
        installation_ttl: Duration::hours(72),
        shutdown_grace: StdDuration::from_secs(1),
    };
    GitHub::new(config, store).unwrap()
}

fn installation_created() -> Value {
    json!({
        "action": "created",
        "installation": {
            "id": 42,
            "account": { "id": 7, "login": "acme", "type": "Organization" },
            "repository_selection": "all",
            "permissions": { "contents": "read", "pull_requests": "write" },
        },
        "sender": { "login": "octocat" },
    })
}

async fn deliver(
    webhook_url: &Url,
    event: &str,
    delivery: &str,
    payload: &Value,
) -> Result<reqwest::Response> {
    let body = serde_json::to_vec(payload)?;
    let response = reqwest::Client::new()
        .post(webhook_url.join("webhooks/github")?)
        .header(github::EVENT_HEADER, event)
        .header(github::DELIVERY_HEADER, delivery)
        .header(
            github::SIGNATURE_HEADER,
            github::sign(WEBHOOK_SECRET.as_bytes(), &body),
        )
        .body(body)
        .send()
        .await?;
    Ok(response)
}

/// Wire the connector's webhook listener to a dispatcher that forwards
/// every routed event into a channel.
async fn webhook_listener(
    github: &GitHub,
    store: Arc<dyn Storage>,
    cancel: CancellationToken,
) -> Result<(Url, mpsc::UnboundedReceiver<EventEnvelope>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handlers = HandlerRegistry::default().fallback(
        ConnectorType::GitHub,
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok::<_, color_eyre::Report>(())
            }
        }),
    );
    let dispatcher = Dispatcher::new(ConnectorType::GitHub, Arc::new(handlers), store);
    let source = github.webhook().unwrap();
    let router = webhook::router(Arc::new(source), Arc::new(dispatcher), cancel);
    Ok((helpers::serve(router).await?, rx))
}

#[test_log::test(tokio::test)]
async fn installation_webhook_then_claim() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let (fake, api_base) = fake_github().await?;
    let github = connector(api_base, store.clone());
    let registry = [Arc::new(github.clone()) as Arc<dyn Connector>]
        .into_iter()
        .collect::<Registry>();
    let fixture = TestFixture::spawn_with_store(registry, store.clone()).await?;
    let cancel = CancellationToken::new();
    let (webhook_url, mut events) = webhook_listener(&github, store.clone(), cancel.clone()).await?;

    let response = deliver(&webhook_url, "installation", "delivery-1", &installation_created()).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    let recorded = store.get_installation(42).await?.expect("installation recorded");
    pretty_assert_eq!(recorded.account_login, "acme");
    pretty_assert_eq!(recorded.account_id, 7);
    pretty_assert_eq!(recorded.claimed_at, None);
    pretty_assert_eq!(
        recorded.permissions.get("pull_requests").map(String::as_str),
        Some("write")
    );

    let event = events.recv().await.expect("installation event forwarded");
    pretty_assert_eq!(event.event_type, "installation");
    pretty_assert_eq!(event.action.as_deref(), Some("created"));
    pretty_assert_eq!(event.integration_id, None);

    let response = as_caller(
        reqwest::Client::new().post(fixture.url("api/v1/connectors/github/claim")),
        &helpers::caller(),
    )
    .json(&json!({ "installation_id": 42 }))
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    let view = response.json::<IntegrationView>().await?;
    pretty_assert_eq!(view.status, IntegrationStatus::Active);
    pretty_assert_eq!(view.connector, ConnectorType::GitHub);
    pretty_assert_eq!(view.organization_id, "org-1");
    pretty_assert_eq!(view.user_id, "user-1");
    pretty_assert_eq!(view.connector_organization_id.as_deref(), Some("7"));
    pretty_assert_eq!(
        view.metadata.get("account_login").map(String::as_str),
        Some("acme")
    );

    let id = IntegrationId::from(view.id);
    let record = store.get_credential(id).await?.expect("credential stored");
    let decrypted = helpers::keyring().open_json::<Credentials>(&record.sealed)?;
    pretty_assert_eq!(decrypted.get(github::INSTALLATION_ID), Some("42"));
    pretty_assert_eq!(decrypted.get(github::TOKEN), Some("ghs_42_1"));
    assert!(
        !record
            .sealed
            .bytes
            .windows(b"ghs_42_1".len())
            .any(|window| window == b"ghs_42_1"),
        "credential must not be stored in plaintext"
    );

    let claimed = store.get_installation(42).await?.expect("installation kept");
    pretty_assert_eq!(claimed.claimed_by, Some(helpers::caller()));

    // A second organization cannot take the same installation.
    let response = as_caller(
        reqwest::Client::new().post(fixture.url("api/v1/connectors/github/claim")),
        &Caller::new("org-2", "user-9"),
    )
    .json(&json!({ "installation_id": 42 }))
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::CONFLICT);

    // Events for the account are now attributed to the integration.
    let pull_request = json!({
        "action": "opened",
        "installation": { "id": 42, "account": { "id": 7, "login": "acme" } },
        "repository": { "full_name": "acme/widgets", "owner": { "id": 7 } },
        "pull_request": { "number": 1, "title": "Add sprockets" },
        "sender": { "login": "octocat" },
    });
    let response = deliver(&webhook_url, "pull_request", "delivery-2", &pull_request).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    let event = events.recv().await.expect("pull request forwarded");
    pretty_assert_eq!(event.integration_id, Some(id));
    pretty_assert_eq!(event.organization_id.as_ref().map(|org| org.as_str()), Some("org-1"));
    pretty_assert_eq!(event.text.as_deref(), Some("Add sprockets"));

    pretty_assert_eq!(fake.minted.load(Ordering::SeqCst), 1);
    cancel.cancel();
    Ok(())
}

#[test_log::test(tokio::test)]
async fn redelivered_installation_is_not_recorded_twice() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let (_fake, api_base) = fake_github().await?;
    let github = connector(api_base, store.clone());
    let cancel = CancellationToken::new();
    let (webhook_url, mut events) = webhook_listener(&github, store.clone(), cancel.clone()).await?;

    let response = deliver(&webhook_url, "installation", "delivery-9", &installation_created()).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    assert!(store.get_installation(42).await?.is_some());
    events.recv().await.expect("installation event forwarded");

    // Once the first delivery went through, a redelivery touches neither the
    // store nor the handler.
    store.delete_installation(42).await?;
    let response = deliver(&webhook_url, "installation", "delivery-9", &installation_created()).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    assert!(store.get_installation(42).await?.is_none());
    assert!(events.try_recv().is_err());

    cancel.cancel();
    Ok(())
}

#[test_log::test(tokio::test)]
async fn callback_without_webhook_completes_directly() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let (_fake, api_base) = fake_github().await?;
    let github = connector(api_base, store.clone());
    let registry = [Arc::new(github) as Arc<dyn Connector>]
        .into_iter()
        .collect::<Registry>();
    let fixture = TestFixture::spawn_with_store(registry, store.clone()).await?;

    let state = helpers::signer().sign(ConnectorType::GitHub, &helpers::caller(), Duration::minutes(10));
    let mut url = fixture.url("api/v1/connectors/github/callback");
    url.query_pairs_mut()
        .append_pair("installation_id", "42")
        .append_pair("setup_action", "install")
        .append_pair("state", &state);
    let response = reqwest::get(url).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    let view = response.json::<IntegrationView>().await?;
    pretty_assert_eq!(view.status, IntegrationStatus::Active);
    let credentials = fixture
        .integrations
        .credentials(IntegrationId::from(view.id))
        .await?;
    pretty_assert_eq!(credentials.get(github::INSTALLATION_ID), Some("42"));

    let stored = store.get_integration(IntegrationId::from(view.id)).await?.unwrap();
    assert!(stored.last_used_at.is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn callback_rejects_forged_state() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let (fake, api_base) = fake_github().await?;
    let registry = [Arc::new(connector(api_base, store.clone())) as Arc<dyn Connector>]
        .into_iter()
        .collect::<Registry>();
    let fixture = TestFixture::spawn_with_store(registry, store).await?;

    let forged = switchboard::crypto::StateSigner::new("someone-else").sign(
        ConnectorType::GitHub,
        &helpers::caller(),
        Duration::minutes(10),
    );
    let mut url = fixture.url("api/v1/connectors/github/callback");
    url.query_pairs_mut()
        .append_pair("installation_id", "42")
        .append_pair("state", &forged);
    let response = reqwest::get(url).await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    pretty_assert_eq!(fake.minted.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn callback_waiting_for_owner_approval() -> Result<()> {
    let (_fake, api_base) = fake_github().await?;
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let registry = [Arc::new(connector(api_base, store.clone())) as Arc<dyn Connector>]
        .into_iter()
        .collect::<Registry>();
    let fixture = TestFixture::spawn_with_store(registry, store).await?;

    let mut url = fixture.url("api/v1/connectors/github/callback");
    url.query_pairs_mut().append_pair("setup_action", "request");
    let response = reqwest::get(url).await?;
    pretty_assert_eq!(response.status(), StatusCode::ACCEPTED);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn uninstall_revokes_integration() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let (_fake, api_base) = fake_github().await?;
    let github = connector(api_base, store.clone());
    let registry = [Arc::new(github.clone()) as Arc<dyn Connector>]
        .into_iter()
        .collect::<Registry>();
    let fixture = TestFixture::spawn_with_store(registry, store.clone()).await?;
    let cancel = CancellationToken::new();
    let (webhook_url, _events) = webhook_listener(&github, store.clone(), cancel.clone()).await?;

    let integration = fixture
        .integrations
        .claim_installation(ConnectorType::GitHub, 42, &helpers::caller())
        .await?;
    pretty_assert_eq!(integration.status, IntegrationStatus::Active);

    let mut deleted = installation_created();
    deleted["action"] = json!("deleted");
    let response = deliver(&webhook_url, "installation", "delivery-3", &deleted).await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    let integration = store.get_integration(integration.id).await?.unwrap();
    pretty_assert_eq!(integration.status, IntegrationStatus::Revoked);
    assert!(store.get_credential(integration.id).await?.is_none());
    cancel.cancel();
    Ok(())
}

#[test_log::test(tokio::test)]
async fn revoke_deletes_and_revokes_remotely() -> Result<()> {
    let store: Arc<dyn Storage> = Arc::new(Memory::new());
    let (fake, api_base) = fake_github().await?;
    let registry = [Arc::new(connector(api_base, store.clone())) as Arc<dyn Connector>]
        .into_iter()
        .collect::<Registry>();
    let fixture = TestFixture::spawn_with_store(registry, store.clone()).await?;

    let integration = fixture
        .integrations
        .claim_installation(ConnectorType::GitHub, 42, &helpers::caller())
        .await?;
    let response = as_caller(
        reqwest::Client::new().delete(fixture.url(&format!("api/v1/integrations/{}", integration.id))),
        &helpers::caller(),
    )
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::NO_CONTENT);
    pretty_assert_eq!(fake.revoked.load(Ordering::SeqCst), 1);
    assert!(store.get_integration(integration.id).await?.is_none());
    Ok(())
}
