use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cumulus_core::{
    CallStatus, CumulusClient, CumulusError, FileVersion, PullRequest, PushRequest, SyncResponse,
    WireEvent, WireMetadata,
};
use futures_util::{StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::change::{Change, ContentHash};
use super::transfer::UploadStream;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte progress callback; receives the running total.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub status: CallStatus,
    pub message: String,
    /// HTTP status when the service answered at all.
    pub http_status: Option<u16>,
}

impl TransportError {
    pub fn new(status: CallStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(CallStatus::Other, message)
    }

    pub fn cancelled() -> Self {
        Self::new(CallStatus::Cancelled, "cancelled")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            http_status: Some(404),
            ..Self::other(message)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CallStatus::Cancelled
    }

    pub fn is_connection_failure(&self) -> bool {
        self.status == CallStatus::ConnectionFailed
    }

    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self.status,
            CallStatus::NotAuthorized | CallStatus::ExpiredCredentials
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }
}

impl From<CumulusError> for TransportError {
    fn from(err: CumulusError) -> Self {
        let http_status = match &err {
            CumulusError::Api { status, .. } => Some(status.as_u16()),
            CumulusError::Unauthorized { .. } => Some(401),
            _ => None,
        };
        Self {
            status: err.status(),
            message: err.to_string(),
            http_status,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        CumulusError::from(err).into()
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::other(format!("I/O error: {err}"))
    }
}

/// Everything the engine needs from the remote store.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push_changes(
        &self,
        events: Vec<WireEvent>,
        cursor: &str,
    ) -> Result<SyncResponse, TransportError>;

    async fn pull_changes(&self, cursor: &str) -> Result<SyncResponse, TransportError>;

    async fn purge_pending(&self) -> Result<(), TransportError>;

    async fn get_metadata(
        &self,
        path: &str,
        is_folder: bool,
    ) -> Result<Option<WireMetadata>, TransportError>;

    async fn get_file_versions(&self, server_uid: &str)
    -> Result<Vec<FileVersion>, TransportError>;

    async fn get_all_pending(&self) -> Result<Vec<WireMetadata>, TransportError>;

    async fn upload(
        &self,
        stream: UploadStream,
        change: &Change,
        progress: ProgressFn,
    ) -> Result<(), TransportError>;

    /// Writes the content of `change` to `temp_path`, verifying the hash when
    /// the change carries one.
    async fn download(
        &self,
        change: &Change,
        temp_path: &Path,
        progress: ProgressFn,
    ) -> Result<(), TransportError>;

    async fn post_file_change(&self, event: WireEvent) -> Result<WireEvent, TransportError>;

    async fn is_reachable(&self) -> bool {
        true
    }
}

/// [`Transport`] over the Cumulus HTTP API.
#[derive(Clone)]
pub struct ClientTransport {
    client: CumulusClient,
    device: String,
    cancel: CancellationToken,
}

impl ClientTransport {
    pub fn new(client: CumulusClient, device: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            client,
            device: device.into(),
            cancel,
        }
    }

    async fn race<T>(
        &self,
        call: impl Future<Output = Result<T, CumulusError>>,
    ) -> Result<T, TransportError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::cancelled()),
            result = call => result.map_err(TransportError::from),
        }
    }
}

fn storage_key(change: &Change) -> Result<&str, TransportError> {
    change
        .metadata
        .storage_key
        .as_deref()
        .ok_or_else(|| TransportError::other(format!("{} has no storage key", change.new_path)))
}

#[async_trait]
impl Transport for ClientTransport {
    async fn push_changes(
        &self,
        events: Vec<WireEvent>,
        cursor: &str,
    ) -> Result<SyncResponse, TransportError> {
        let request = PushRequest {
            sync_id: cursor.to_string(),
            device: self.device.clone(),
            events,
        };
        self.race(self.client.sync_to(&request)).await
    }

    async fn pull_changes(&self, cursor: &str) -> Result<SyncResponse, TransportError> {
        let request = PullRequest {
            sync_id: cursor.to_string(),
            device: self.device.clone(),
        };
        self.race(self.client.sync_from(&request)).await
    }

    async fn purge_pending(&self) -> Result<(), TransportError> {
        self.race(self.client.purge_pending()).await
    }

    async fn get_metadata(
        &self,
        path: &str,
        is_folder: bool,
    ) -> Result<Option<WireMetadata>, TransportError> {
        self.race(self.client.get_metadata(path, is_folder)).await
    }

    async fn get_file_versions(
        &self,
        server_uid: &str,
    ) -> Result<Vec<FileVersion>, TransportError> {
        self.race(self.client.get_file_versions(server_uid)).await
    }

    async fn get_all_pending(&self) -> Result<Vec<WireMetadata>, TransportError> {
        self.race(self.client.get_all_pending()).await
    }

    async fn is_reachable(&self) -> bool {
        match self.race(self.client.ping(PING_TIMEOUT)).await {
            Ok(_) => true,
            Err(err) => {
                debug!("reachability check failed: {err}");
                !err.is_connection_failure()
            }
        }
    }

    async fn upload(
        &self,
        stream: UploadStream,
        change: &Change,
        progress: ProgressFn,
    ) -> Result<(), TransportError> {
        let key = storage_key(change)?;
        let len = stream.len();
        let hash = stream.hash().to_hex();
        let mut sent = 0u64;
        let body = ReaderStream::new(stream.into_file()).inspect_ok(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent);
        });
        self.race(
            self.client
                .upload(key, &hash, len, reqwest::Body::wrap_stream(body)),
        )
        .await
    }

    async fn download(
        &self,
        change: &Change,
        temp_path: &Path,
        progress: ProgressFn,
    ) -> Result<(), TransportError> {
        let key = storage_key(change)?;
        let response = self.race(self.client.download(key)).await?;

        let write = async {
            if let Some(parent) = temp_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(temp_path).await?;
            let mut body = response.bytes_stream();
            let mut md5 = md5::Context::new();
            let mut received = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                md5.consume(&chunk);
                received += chunk.len() as u64;
                progress(received);
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, TransportError>(ContentHash(md5.compute().0))
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::cancelled()),
            result = write => result,
        };
        let actual = match result {
            Ok(actual) => actual,
            Err(err) => {
                let _ = tokio::fs::remove_file(temp_path).await;
                return Err(err);
            }
        };

        if let Some(expected) = change.metadata.hash
            && expected != actual
        {
            let _ = tokio::fs::remove_file(temp_path).await;
            return Err(TransportError::other(format!(
                "download integrity check failed for {}: expected {expected}, got {actual}",
                change.new_path
            )));
        }
        Ok(())
    }

    async fn post_file_change(&self, event: WireEvent) -> Result<WireEvent, TransportError> {
        self.race(self.client.post_file_change(&event)).await
    }
}
