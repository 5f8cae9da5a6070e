use std::time::Duration;

use reqwest::{Body, Client, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::wire::{
    FileVersion, PendingList, PullRequest, PushRequest, SyncResponse, VersionList, WireEvent,
    WireMetadata,
};

const DEFAULT_BASE_URL: &str = "https://api.cumulus.example";

/// HTTP 419, used by the service for an expired session.
const SESSION_EXPIRED: u16 = 419;

#[derive(Debug, Error)]
pub enum CumulusError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("credentials rejected (expired: {expired})")]
    Unauthorized { expired: bool },
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Outcome class of one call, as seen by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Success,
    NoContent,
    NotAuthorized,
    ExpiredCredentials,
    ConnectionFailed,
    Cancelled,
    Other,
}

#[derive(Clone)]
pub struct CumulusClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl CumulusClient {
    pub fn new(token: impl Into<String>) -> Result<Self, CumulusError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, CumulusError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Sends one batch of client events and returns the server's verdicts
    /// together with any server-side changes since `request.sync_id`.
    pub async fn sync_to(&self, request: &PushRequest) -> Result<SyncResponse, CumulusError> {
        self.post_json("/v1/sync/to", request).await
    }

    pub async fn sync_from(&self, request: &PullRequest) -> Result<SyncResponse, CumulusError> {
        self.post_json("/v1/sync/from", request).await
    }

    pub async fn purge_pending(&self) -> Result<(), CumulusError> {
        let url = self.endpoint("/v1/sync/purge")?;
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    /// `Ok(None)` when the service answers 204 (no such item).
    pub async fn get_metadata(
        &self,
        path: &str,
        is_folder: bool,
    ) -> Result<Option<WireMetadata>, CumulusError> {
        let mut url = self.endpoint("/v1/files/metadata")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("folder", if is_folder { "true" } else { "false" });
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_optional(response).await
    }

    pub async fn get_file_versions(
        &self,
        server_uid: &str,
    ) -> Result<Vec<FileVersion>, CumulusError> {
        let mut url = self.endpoint("/v1/files/versions")?;
        url.query_pairs_mut().append_pair("uid", server_uid);
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        let list: Option<VersionList> = Self::handle_optional(response).await?;
        Ok(list.map(|list| list.versions).unwrap_or_default())
    }

    pub async fn get_all_pending(&self) -> Result<Vec<WireMetadata>, CumulusError> {
        let url = self.endpoint("/v1/sync/pending")?;
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        let list: Option<PendingList> = Self::handle_optional(response).await?;
        Ok(list.map(|list| list.files).unwrap_or_default())
    }

    pub async fn post_file_change(&self, event: &WireEvent) -> Result<WireEvent, CumulusError> {
        self.post_json("/v1/files/change", event).await
    }

    pub async fn upload(
        &self,
        storage_key: &str,
        hash: &str,
        size: u64,
        body: impl Into<Body>,
    ) -> Result<(), CumulusError> {
        let mut url = self.endpoint("/v1/files/upload/")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(storage_key);
        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .header(header::CONTENT_LENGTH, size)
            .header("Content-MD5", hash)
            .body(body)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    /// Returns the raw response so the caller can stream the body to disk.
    pub async fn download(&self, storage_key: &str) -> Result<reqwest::Response, CumulusError> {
        let mut url = self.endpoint("/v1/files/download")?;
        url.query_pairs_mut().append_pair("key", storage_key);
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Checks that the service answers at all. Any HTTP status counts as an
    /// answer; only transport failures are errors.
    pub async fn ping(&self, timeout: Duration) -> Result<StatusCode, CumulusError> {
        let url = self.endpoint("/v1/ping")?;
        let response = self.http.head(url).timeout(timeout).send().await?;
        Ok(response.status())
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, CumulusError> {
        Ok(self.base_url.join(path)?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CumulusError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CumulusError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status.as_u16() == SESSION_EXPIRED {
            let expired = status.as_u16() == SESSION_EXPIRED
                || response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .is_some_and(|value| value.to_ascii_lowercase().contains("expired"));
            return Err(CumulusError::Unauthorized { expired });
        }
        let body = response.text().await.unwrap_or_default();
        Err(CumulusError::Api { status, body })
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CumulusError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn handle_optional<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>, CumulusError> {
        let response = Self::check_status(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json::<T>().await?))
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), CumulusError> {
        Self::check_status(response).await?;
        Ok(())
    }
}

impl CumulusError {
    pub fn status(&self) -> CallStatus {
        match self {
            CumulusError::Request(err) if err.is_connect() || err.is_timeout() => {
                CallStatus::ConnectionFailed
            }
            CumulusError::Request(_) | CumulusError::Url(_) => CallStatus::Other,
            CumulusError::Unauthorized { expired: true } => CallStatus::ExpiredCredentials,
            CumulusError::Unauthorized { expired: false } => CallStatus::NotAuthorized,
            CumulusError::Api { status, .. } => classify_api_status(*status),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.status(), CallStatus::ConnectionFailed)
            || matches!(
                self,
                CumulusError::Api { status, .. }
                    if *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            )
    }
}

fn classify_api_status(status: StatusCode) -> CallStatus {
    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        CallStatus::ConnectionFailed
    } else {
        CallStatus::Other
    }
}
