//! Device authorization end to end through the HTTP API.

use clients::switchboard::v1::{
    Client, DevicePoll,
    device::{DeviceAuthorizeRequest, DeviceErrorCode, DeviceErrorResponse},
};
use color_eyre::{Result, eyre::bail};
use pretty_assertions::assert_eq as pretty_assert_eq;
use reqwest::StatusCode;
use switchboard::{auth::Caller, connector::Registry};

use crate::helpers::{self, TestFixture, as_caller};

async fn approve(fixture: &TestFixture, user_code: &str, caller: &Caller) -> Result<StatusCode> {
    let response = as_caller(
        reqwest::Client::new().post(fixture.url("api/v1/device/authorize")),
        caller,
    )
    .json(&DeviceAuthorizeRequest::builder().user_code(user_code).build())
    .send()
    .await?;
    Ok(response.status())
}

#[test_log::test(tokio::test)]
async fn device_login_issues_tokens_once() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;
    let client = Client::new(fixture.base_url.clone());

    let authorization = client.request_device_code().await?;
    pretty_assert_eq!(authorization.interval, 5);
    assert!(
        authorization
            .verification_uri_complete
            .starts_with("http://localhost/device?user_code=")
    );
    pretty_assert_eq!(
        client.poll_device_token(&authorization.device_code).await?,
        DevicePoll::Pending
    );

    let status = approve(&fixture, &authorization.user_code, &helpers::caller()).await?;
    pretty_assert_eq!(status, StatusCode::NO_CONTENT);

    let DevicePoll::Issued(tokens) = client.poll_device_token(&authorization.device_code).await?
    else {
        bail!("expected tokens after approval");
    };
    pretty_assert_eq!(tokens.token_type, "Bearer");
    pretty_assert_eq!(
        client.poll_device_token(&authorization.device_code).await?,
        DevicePoll::Failed(DeviceErrorCode::InvalidDeviceCode)
    );

    // The access token acts as the approving caller.
    let list = client.list_integrations(&tokens.access_token).await?;
    assert!(list.integrations.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn refresh_rotates_and_revoke_ends_the_session() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;
    let client = Client::new(fixture.base_url.clone());

    let authorization = client.request_device_code().await?;
    approve(&fixture, &authorization.user_code, &helpers::caller()).await?;
    let DevicePoll::Issued(first) = client.poll_device_token(&authorization.device_code).await?
    else {
        bail!("expected tokens after approval");
    };

    let Some(second) = client.refresh_token(&first.refresh_token).await? else {
        bail!("expected the refresh to succeed");
    };
    assert_ne!(first.access_token, second.access_token);
    assert!(client.refresh_token(&first.refresh_token).await?.is_none());
    assert!(client.list_integrations(&first.access_token).await.is_err());
    client.list_integrations(&second.access_token).await?;

    client.revoke_token(&second.refresh_token).await?;
    assert!(client.list_integrations(&second.access_token).await.is_err());
    assert!(client.refresh_token(&second.refresh_token).await?.is_none());

    // Unknown tokens revoke without complaint.
    client.revoke_token("not-a-token").await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn user_code_is_forgiving_but_single_use() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;
    let client = Client::new(fixture.base_url.clone());
    let authorization = client.request_device_code().await?;

    let typed = authorization.user_code.replace('-', " ").to_lowercase();
    pretty_assert_eq!(
        approve(&fixture, &typed, &helpers::caller()).await?,
        StatusCode::NO_CONTENT
    );
    pretty_assert_eq!(
        approve(&fixture, &authorization.user_code, &helpers::caller()).await?,
        StatusCode::BAD_REQUEST
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_user_code_is_rejected() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;

    let response = as_caller(
        reqwest::Client::new().post(fixture.url("api/v1/device/authorize")),
        &helpers::caller(),
    )
    .json(&DeviceAuthorizeRequest::builder().user_code("BBBB-BBBB").build())
    .send()
    .await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.json::<DeviceErrorResponse>().await?;
    pretty_assert_eq!(body.error, DeviceErrorCode::InvalidUserCode);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn approval_requires_a_caller() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;
    let client = Client::new(fixture.base_url.clone());
    let authorization = client.request_device_code().await?;

    let response = reqwest::Client::new()
        .post(fixture.url("api/v1/device/authorize"))
        .json(&DeviceAuthorizeRequest::builder().user_code(&authorization.user_code).build())
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    pretty_assert_eq!(
        client.poll_device_token(&authorization.device_code).await?,
        DevicePoll::Pending
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_device_code_is_invalid() -> Result<()> {
    let fixture = TestFixture::spawn(Registry::default()).await?;
    let client = Client::new(fixture.base_url.clone());
    pretty_assert_eq!(
        client.poll_device_token("0000").await?,
        DevicePoll::Failed(DeviceErrorCode::InvalidDeviceCode)
    );
    Ok(())
}
