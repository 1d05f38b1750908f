//! Slack OAuth installs and Socket Mode, against a fake Slack.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use clients::switchboard::v1::{
    AuthorizationIntent, ConnectorType, IntegrationStatus, IntegrationView, IntentKind,
};
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use oauth2::ClientSecret;
use pretty_assertions::assert_eq as pretty_assert_eq;
use serde_json::{Value, json};
use switchboard::{
    auth::IntegrationId,
    connector::{
        Connector, EventEnvelope, Registry, Slack, handler_fn,
        slack::{self, Backoff, SlackConfig},
    },
    error::BrokerError,
};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::helpers::{self, TestFixture, as_caller};

const WAIT: Duration = Duration::from_secs(5);

struct FakeSlack {
    socket_url: Option<Url>,
    connections_opened: AtomicUsize,
    refreshed: AtomicUsize,
}

async fn oauth_access(
    State(fake): State<Arc<FakeSlack>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    if form.get("client_secret").map(String::as_str) != Some("client-secret") {
        return Json(json!({ "ok": false, "error": "invalid_client_id" }));
    }
    if form.get("grant_type").map(String::as_str) == Some("refresh_token") {
        fake.refreshed.fetch_add(1, Ordering::SeqCst);
        return Json(json!({
            "ok": true,
            "access_token": "xoxb-refreshed",
            "refresh_token": "xoxe-2",
            "expires_in": 43200,
            "team": { "id": "T1" },
        }));
    }
    match form.get("code").map(String::as_str) {
        Some("good-code") => Json(json!({
            "ok": true,
            "access_token": "xoxb-initial",
            "refresh_token": "xoxe-1",
            // Inside the refresh window, so the first use refreshes.
            "expires_in": 60,
            "scope": "chat:write,commands",
            "bot_user_id": "U0BOT",
            "app_id": "A1",
            "team": { "id": "T1", "name": "Acme" },
        })),
        _ => Json(json!({ "ok": false, "error": "invalid_code" })),
    }
}

async fn auth_test(headers: HeaderMap) -> Json<Value> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match token {
        Some(token) if token.starts_with("xoxb-") => Json(json!({ "ok": true, "team_id": "T1" })),
        _ => Json(json!({ "ok": false, "error": "invalid_auth" })),
    }
}

async fn connections_open(State(fake): State<Arc<FakeSlack>>) -> Json<Value> {
    fake.connections_opened.fetch_add(1, Ordering::SeqCst);
    match &fake.socket_url {
        Some(url) => Json(json!({ "ok": true, "url": url })),
        None => Json(json!({ "ok": false, "error": "invalid_auth" })),
    }
}

async fn fake_slack(socket_url: Option<Url>) -> Result<(Arc<FakeSlack>, Url)> {
    let fake = Arc::new(FakeSlack {
        socket_url,
        connections_opened: AtomicUsize::new(0),
        refreshed: AtomicUsize::new(0),
    });
    let router = Router::new()
        .route("/api/oauth.v2.access", post(oauth_access))
        .route("/api/auth.test", post(auth_test))
        .route("/api/auth.revoke", post(auth_test))
        .route("/api/apps.connections.open", post(connections_open))
        .with_state(fake.clone());
    let base = helpers::serve(router).await?;
    Ok((fake, base.join("api")?))
}

fn connector(api_base: Url, app_token: Option<&str>) -> Slack {
    Slack::new(SlackConfig {
        client_id: String::from("123.456"),
        client_secret: ClientSecret::new(String::from("client-secret")),
        scopes: vec![String::from("chat:write"), String::from("commands")],
        redirect_uri: Url::parse("http://localhost/api/v1/connectors/slack/callback").unwrap(),
        app_token: app_token.map(str::to_owned),
        signing_secret: None,
        webhook_addr: None,
        api_base,
        authorize_url: Url::parse(SlackConfig::DEFAULT_AUTHORIZE_URL).unwrap(),
        backoff: Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(20),
            max_failures: 3,
        },
        shutdown_grace: Duration::from_secs(1),
    })
    .unwrap()
}

fn registry(slack: Slack) -> Registry {
    [Arc::new(slack) as Arc<dyn Connector>].into_iter().collect()
}

#[test_log::test(tokio::test)]
async fn oauth_install_and_refresh_on_use() -> Result<()> {
    let (fake, api_base) = fake_slack(None).await?;
    let fixture = TestFixture::spawn(registry(connector(api_base, None))).await?;
    let http = reqwest::Client::new();

    let response = as_caller(
        http.post(fixture.url("api/v1/connectors/slack/initiate")),
        &helpers::caller(),
    )
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    let intent = response.json::<AuthorizationIntent>().await?;
    pretty_assert_eq!(intent.kind, IntentKind::OauthRedirect);

    let consent = Url::parse(&intent.url)?;
    let params = consent.query_pairs().into_owned().collect::<HashMap<_, _>>();
    pretty_assert_eq!(params.get("client_id").map(String::as_str), Some("123.456"));
    pretty_assert_eq!(params.get("scope").map(String::as_str), Some("chat:write,commands"));
    let state = params.get("state").expect("state in consent URL").clone();

    let mut callback = fixture.url("api/v1/connectors/slack/callback");
    callback
        .query_pairs_mut()
        .append_pair("code", "good-code")
        .append_pair("state", &state);
    let response = http.get(callback).send().await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    let view = response.json::<IntegrationView>().await?;
    pretty_assert_eq!(view.status, IntegrationStatus::Active);
    pretty_assert_eq!(view.connector_organization_id.as_deref(), Some("T1"));
    pretty_assert_eq!(view.connector_bot_id.as_deref(), Some("U0BOT"));
    pretty_assert_eq!(view.metadata.get("team_name").map(String::as_str), Some("Acme"));

    // The stored token expires within the refresh window.
    let credentials = fixture
        .integrations
        .credentials(IntegrationId::from(view.id))
        .await?;
    pretty_assert_eq!(credentials.get(slack::ACCESS_TOKEN), Some("xoxb-refreshed"));
    pretty_assert_eq!(credentials.get(slack::REFRESH_TOKEN), Some("xoxe-2"));
    pretty_assert_eq!(credentials.get(slack::BOT_USER_ID), Some("U0BOT"));
    pretty_assert_eq!(fake.refreshed.load(Ordering::SeqCst), 1);

    // Fresh credentials are handed out without another refresh.
    fixture
        .integrations
        .credentials(IntegrationId::from(view.id))
        .await?;
    pretty_assert_eq!(fake.refreshed.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rejected_code_is_bad_request() -> Result<()> {
    let (_fake, api_base) = fake_slack(None).await?;
    let fixture = TestFixture::spawn(registry(connector(api_base, None))).await?;
    let state = helpers::signer().sign(
        ConnectorType::Slack,
        &helpers::caller(),
        time::Duration::minutes(10),
    );

    let mut callback = fixture.url("api/v1/connectors/slack/callback");
    callback
        .query_pairs_mut()
        .append_pair("code", "stale-code")
        .append_pair("state", &state);
    let response = reqwest::get(callback).await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.json::<Value>().await?;
    assert!(body["error"].as_str().unwrap().contains("invalid_code"));

    let integrations = fixture.integrations.list(&helpers::caller()).await?;
    assert!(integrations.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn state_for_other_connector_is_rejected() -> Result<()> {
    let (_fake, api_base) = fake_slack(None).await?;
    let fixture = TestFixture::spawn(registry(connector(api_base, None))).await?;
    let state = helpers::signer().sign(
        ConnectorType::GitHub,
        &helpers::caller(),
        time::Duration::minutes(10),
    );

    let mut callback = fixture.url("api/v1/connectors/slack/callback");
    callback
        .query_pairs_mut()
        .append_pair("code", "good-code")
        .append_pair("state", &state);
    let response = reqwest::get(callback).await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

fn events_api(envelope_id: &str, event_id: &str, text: &str) -> Value {
    json!({
        "type": "events_api",
        "envelope_id": envelope_id,
        "payload": {
            "type": "event_callback",
            "team_id": "T1",
            "api_app_id": "A1",
            "event_id": event_id,
            "event": {
                "type": "app_mention",
                "user": "U1",
                "channel": "C1",
                "text": text,
                "ts": "1700000000.000100",
            },
        },
    })
}

fn text(value: Value) -> WsMessage {
    WsMessage::Text(value.to_string().into())
}

/// A Socket Mode endpoint that serves two connections.
///
/// The first delivers an event, redelivers it under a new envelope, then
/// asks the client to reconnect. The second delivers another event and
/// stays open. Every acknowledgement is forwarded to `acks`.
async fn fake_socket(acks: mpsc::UnboundedSender<String>) -> Result<Url> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = Url::parse(&format!("ws://{}/socket", listener.local_addr()?))?;
    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            connection += 1;
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let script = match connection {
                1 => vec![
                    events_api("env-1", "Ev1", "<@U0BOT> hello"),
                    events_api("env-1b", "Ev1", "<@U0BOT> hello"),
                ],
                _ => vec![events_api("env-2", "Ev2", "<@U0BOT> again")],
            };

            ws.send(text(json!({ "type": "hello" }))).await.unwrap();
            for envelope in script {
                ws.send(text(envelope)).await.unwrap();
                if let Some(Ok(WsMessage::Text(ack))) = ws.next().await {
                    acks.send(ack.as_str().to_owned()).unwrap();
                }
            }

            if connection == 1 {
                ws.send(text(json!({ "type": "disconnect", "reason": "refresh_requested" })))
                    .await
                    .unwrap();
                let _ = ws.close(None).await;
            } else {
                while let Some(Ok(_)) = ws.next().await {}
            }
        }
    });
    Ok(url)
}

#[test_log::test(tokio::test)]
async fn socket_mode_acks_dedupes_and_reconnects() -> Result<()> {
    let (ack_tx, mut acks) = mpsc::unbounded_channel();
    let socket_url = fake_socket(ack_tx).await?;
    let (fake, api_base) = fake_slack(Some(socket_url)).await?;
    let slack = connector(api_base, Some("xapp-1"));
    assert!(slack.capabilities().subscribe);

    let (event_tx, mut events) = mpsc::unbounded_channel::<EventEnvelope>();
    let handler = handler_fn(move |event| {
        let event_tx = event_tx.clone();
        async move {
            event_tx.send(event)?;
            Ok::<_, color_eyre::Report>(())
        }
    });
    let cancel = CancellationToken::new();
    let subscription = tokio::spawn({
        let cancel = cancel.clone();
        async move { slack.subscribe(cancel, handler).await }
    });

    let first = timeout(WAIT, events.recv()).await?.expect("first event");
    pretty_assert_eq!(first.id, "Ev1");
    pretty_assert_eq!(first.event_type, "app_mention");
    pretty_assert_eq!(first.connector_organization_id.as_deref(), Some("T1"));
    pretty_assert_eq!(first.text.as_deref(), Some("<@U0BOT> hello"));

    // The redelivery of Ev1 is acknowledged but not handled again.
    let second = timeout(WAIT, events.recv()).await?.expect("second event");
    pretty_assert_eq!(second.id, "Ev2");

    let mut acked = Vec::new();
    for _ in 0..3 {
        let ack = timeout(WAIT, acks.recv()).await?.expect("ack");
        acked.push(serde_json::from_str::<Value>(&ack)?["envelope_id"].clone());
    }
    pretty_assert_eq!(acked, vec![json!("env-1"), json!("env-1b"), json!("env-2")]);
    pretty_assert_eq!(fake.connections_opened.load(Ordering::SeqCst), 2);

    cancel.cancel();
    timeout(WAIT, subscription).await???;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn socket_mode_gives_up_after_repeated_failures() -> Result<()> {
    let (fake, api_base) = fake_slack(None).await?;
    let slack = connector(api_base, Some("xapp-revoked"));
    let handler = handler_fn(|_| async { Ok::<_, color_eyre::Report>(()) });

    let result = timeout(WAIT, slack.subscribe(CancellationToken::new(), handler)).await?;
    assert!(
        matches!(result, Err(BrokerError::TransportFailure(_))),
        "unexpected result: {result:?}"
    );
    pretty_assert_eq!(fake.connections_opened.load(Ordering::SeqCst), 3);
    Ok(())
}
