//! reqwest-backed backend client.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::api::{AlertReport, BackendApi, HealthReport, MediaBody, MediaSource};
use crate::domain::{CurrentContentSnapshot, MediaAsset, PollResponse, SyncResponse};
use crate::{Error, Result};

/// Header identifying the screen a request acts for.
pub const SCREEN_ID_HEADER: &str = "X-Screen-ID";

/// Response bodies of 401/403 that mean the screen was taken away from this device.
const UNPAIRED_MARKERS: &[&str] = &["unpaired", "not paired", "not_paired"];

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Who this terminal is, as far as the backend is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub api_base_url: String,
    pub device_token: Option<String>,
    pub device_id: Option<String>,
    pub screen_id: Option<String>,
}

impl DeviceIdentity {
    pub fn is_paired(&self) -> bool {
        self.device_token.is_some() && self.screen_id.is_some()
    }
}

/// Backend client carrying the device's bearer token and screen header.
///
/// The underlying `reqwest::Client` has no total timeout: JSON calls apply
/// `request_timeout` per request, downloads and the event stream rely on the connect
/// timeout and their own read deadlines.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    identity: Arc<RwLock<DeviceIdentity>>,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(
        identity: DeviceIdentity,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        install_rustls_provider();

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("signage-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            identity: Arc::new(RwLock::new(identity)),
            request_timeout,
        })
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    pub fn set_identity(&self, identity: DeviceIdentity) {
        *self.identity.write() = identity;
    }

    /// Forget token and ids, keeping the base URL.
    pub fn clear_credentials(&self) {
        let mut identity = self.identity.write();
        identity.device_token = None;
        identity.device_id = None;
        identity.screen_id = None;
    }

    fn base_url(identity: &DeviceIdentity) -> Result<Url> {
        let mut base = Url::parse(&identity.api_base_url)
            .map_err(|e| Error::config(format!("invalid api base url: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base)
    }

    fn screen_request(&self, suffix: &str) -> Result<(RequestBuilder, String)> {
        let identity = self.identity();
        let (Some(token), Some(screen_id)) = (&identity.device_token, &identity.screen_id) else {
            return Err(Error::Unpaired);
        };
        let url = Self::base_url(&identity)?
            .join(&format!("api/screens/{screen_id}/{suffix}"))
            .map_err(|e| Error::config(format!("invalid screen url: {e}")))?;
        let request = self
            .http
            .get(url.clone())
            .bearer_auth(token)
            .header(SCREEN_ID_HEADER, screen_id.as_str());
        Ok((request, url.to_string()))
    }

    fn device_url(&self, suffix: &str) -> Result<(DeviceIdentity, Url)> {
        let identity = self.identity();
        let Some(device_id) = identity.device_id.clone() else {
            return Err(Error::Unpaired);
        };
        let url = Self::base_url(&identity)?
            .join(&format!("api/devices/{device_id}/{suffix}"))
            .map_err(|e| Error::config(format!("invalid device url: {e}")))?;
        Ok((identity, url))
    }

    async fn get_screen_json<T: DeserializeOwned>(&self, suffix: &str) -> Result<T> {
        let (request, url) = self.screen_request(suffix)?;
        let response = request.timeout(self.request_timeout).send().await?;
        let response = check_status(response, &url, true).await?;
        Ok(response.json::<T>().await?)
    }

    async fn post_device_json<B: Serialize + Sync>(&self, suffix: &str, body: &B) -> Result<()> {
        let (identity, url) = self.device_url(suffix)?;
        let mut request = self
            .http
            .post(url.clone())
            .timeout(self.request_timeout)
            .json(body);
        if let Some(token) = &identity.device_token {
            request = request.bearer_auth(token);
        }
        if let Some(screen_id) = &identity.screen_id {
            request = request.header(SCREEN_ID_HEADER, screen_id.as_str());
        }
        let response = request.send().await?;
        check_status(response, url.as_str(), false).await?;
        Ok(())
    }

    /// Request for the notification event stream.
    pub(crate) fn stream_request(&self) -> Result<RequestBuilder> {
        let (request, _) = self.screen_request("notifications/stream")?;
        Ok(request.header(reqwest::header::ACCEPT, "text/event-stream"))
    }

    fn media_url(&self, raw: &str) -> Result<Url> {
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let identity = self.identity();
                Self::base_url(&identity)?
                    .join(raw.trim_start_matches('/'))
                    .map_err(|e| Error::validation(format!("invalid media url {raw}: {e}")))
            }
            Err(e) => Err(Error::validation(format!("invalid media url {raw}: {e}"))),
        }
    }
}

/// Map non-success responses to errors.
///
/// With `screen_scoped`, only a 401/403 carrying an unpaired marker becomes
/// [`Error::Unpaired`]; every other status, 404 included, stays a retryable
/// [`Error::HttpStatus`].
pub(crate) async fn check_status(
    response: Response,
    url: &str,
    screen_scoped: bool,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if screen_scoped && is_auth_rejection(status) {
        let body = response.text().await.unwrap_or_default();
        if is_unpaired_body(&body) {
            return Err(Error::Unpaired);
        }
        warn!(status = status.as_u16(), url, "Backend rejected device credentials");
    }

    Err(Error::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    })
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn is_unpaired_body(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    UNPAIRED_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl BackendApi for ApiClient {
    async fn fetch_sync(&self) -> Result<SyncResponse> {
        self.get_screen_json("sync").await
    }

    async fn fetch_current_content(&self) -> Result<CurrentContentSnapshot> {
        self.get_screen_json("current-content").await
    }

    async fn poll_notifications(&self) -> Result<PollResponse> {
        self.get_screen_json("notifications/poll").await
    }

    async fn post_health(&self, report: &HealthReport) -> Result<()> {
        self.post_device_json("health", report).await
    }

    async fn post_alert(&self, alert: &AlertReport) -> Result<()> {
        self.post_device_json("alerts", alert).await
    }

    fn forget_credentials(&self) {
        self.clear_credentials();
    }
}

#[async_trait]
impl MediaSource for ApiClient {
    async fn open(&self, asset: &MediaAsset) -> Result<MediaBody> {
        let url = self.media_url(&asset.url)?;
        let identity = self.identity();

        let mut request = self.http.get(url.clone());
        if let Some(token) = &identity.device_token {
            request = request.bearer_auth(token);
        }
        if let Some(screen_id) = &identity.screen_id {
            request = request.header(SCREEN_ID_HEADER, screen_id.as_str());
        }

        let response = request.send().await?;
        let response = check_status(response, url.as_str(), false).await?;
        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(MediaBody {
            content_length,
            chunks,
        })
    }
}
