use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use reqwest::StatusCode;
use tracing::{debug, instrument};
use url::Url;

use super::{
    IntegrationList,
    device::{
        DeviceCodeResponse, DeviceErrorCode, DeviceErrorResponse, DeviceTokenRequest,
        RefreshTokenRequest, RevokeTokenRequest, TokenResponse,
    },
};

/// Extra delay added after the server asks for a slower poll.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

/// Result of a single device token poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DevicePoll {
    /// The user approved the device; this is the only time these tokens are
    /// returned.
    Issued(TokenResponse),

    /// The user has not approved the device yet.
    Pending,

    /// The flow ended without tokens.
    Failed(DeviceErrorCode),
}

/// Client for the Switchboard API.
#[derive(Clone, Debug)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client with the given base URL.
    pub fn new(base: impl Into<Url>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| eyre!("base URL cannot have path segments: {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Start a device authorization.
    #[instrument(skip(self))]
    pub async fn request_device_code(&self) -> Result<DeviceCodeResponse> {
        let url = self.endpoint(&["api", "v1", "device", "code"])?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .context("send POST request")?;

        match response.status() {
            StatusCode::OK => response
                .json::<DeviceCodeResponse>()
                .await
                .context("parse JSON response"),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(eyre!(
                    "unexpected status code from request_device_code: {status}\n{error_body}"
                ))
            }
        }
    }

    /// Poll once for the tokens of a device authorization.
    #[instrument(skip_all)]
    pub async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll> {
        let url = self.endpoint(&["api", "v1", "device", "token"])?;
        let request = DeviceTokenRequest::builder()
            .device_code(device_code)
            .build();
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .context("send POST request")?;

        match response.status() {
            StatusCode::OK => response
                .json::<TokenResponse>()
                .await
                .context("parse JSON response")
                .map(DevicePoll::Issued),
            StatusCode::BAD_REQUEST => {
                let body = response
                    .json::<DeviceErrorResponse>()
                    .await
                    .context("parse JSON error response")?;
                match body.error {
                    DeviceErrorCode::AuthorizationPending => Ok(DevicePoll::Pending),
                    code => Ok(DevicePoll::Failed(code)),
                }
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(eyre!(
                    "unexpected status code from poll_device_token: {status}\n{error_body}"
                ))
            }
        }
    }

    /// Poll until the device authorization is approved, fails, or expires.
    ///
    /// Honors the poll interval advertised by the server. Transport errors
    /// while polling are retried with additional back-off until the device
    /// code expires.
    #[instrument(skip_all, fields(user_code = %authorization.user_code))]
    pub async fn wait_for_device_token(
        &self,
        authorization: &DeviceCodeResponse,
    ) -> Result<TokenResponse> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(authorization.expires_in);
        let mut interval = Duration::from_secs(authorization.interval.max(1));

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                bail!("device code expired before it was approved");
            }

            match self.poll_device_token(&authorization.device_code).await {
                Ok(DevicePoll::Issued(token)) => return Ok(token),
                Ok(DevicePoll::Pending) => debug!("device.poll.pending"),
                Ok(DevicePoll::Failed(code)) => bail!("device authorization failed: {code}"),
                Err(error) => {
                    debug!(?error, "device.poll.retry");
                    interval += POLL_BACKOFF;
                }
            }
        }
    }

    /// Exchange a refresh token for a new token pair.
    ///
    /// Returns `None` if the refresh token is no longer valid; the old pair
    /// is unusable after a successful refresh.
    #[instrument(skip_all)]
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Option<TokenResponse>> {
        let url = self.endpoint(&["api", "v1", "device", "refresh"])?;
        let request = RefreshTokenRequest::builder()
            .refresh_token(refresh_token)
            .build();
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .context("send POST request")?;

        match response.status() {
            StatusCode::OK => response
                .json::<TokenResponse>()
                .await
                .context("parse JSON response")
                .map(Some),
            StatusCode::BAD_REQUEST => Ok(None),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(eyre!(
                    "unexpected status code from refresh_token: {status}\n{error_body}"
                ))
            }
        }
    }

    /// Revoke the token pair that the given access or refresh token belongs to.
    #[instrument(skip_all)]
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        let url = self.endpoint(&["api", "v1", "device", "revoke"])?;
        let request = RevokeTokenRequest::builder().token(token).build();
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .context("send POST request")?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(eyre!(
                    "unexpected status code from revoke_token: {status}\n{error_body}"
                ))
            }
        }
    }

    /// List the integrations of the organization the access token belongs to.
    #[instrument(skip_all)]
    pub async fn list_integrations(&self, access_token: &str) -> Result<IntegrationList> {
        let url = self.endpoint(&["api", "v1", "integrations"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("send GET request")?;

        match response.status() {
            StatusCode::OK => response
                .json::<IntegrationList>()
                .await
                .context("parse JSON response"),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(eyre!(
                    "unexpected status code from list_integrations: {status}\n{error_body}"
                ))
            }
        }
    }
}
