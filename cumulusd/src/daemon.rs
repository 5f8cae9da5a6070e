use std::future::pending;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cumulus_core::CumulusClient;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sync::backoff::PollBackoff;
use crate::sync::bus::TracingNotifier;
use crate::sync::engine::{EngineConfig, SyncEngine};
use crate::sync::index::{EventStore, default_db_path};
use crate::sync::local_watcher::{EchoFilter, LocalEvent, start_notify_watcher};
use crate::sync::paths::local_path_for;
use crate::sync::policy::RetryLimits;
use crate::sync::transfer::TransferConfig;
use crate::sync::transport::ClientTransport;

const DEFAULT_SYNC_DIR_NAME: &str = "Cumulus";
const DEFAULT_BASE_URL: &str = "https://api.cumulus.example";
const DEFAULT_DEVICE_NAME: &str = "cumulus-device";
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_RETRY_MS: u64 = 5000;
const DEFAULT_LONG_RETRY_SECS: u64 = 600;
const DEFAULT_MAX_CONNECTION_FAILURES: u64 = 3;
const POLL_BACKOFF_BASE: Duration = Duration::from_secs(2);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub token: String,
    pub base_url: String,
    pub sync_root: PathBuf,
    pub data_dir: PathBuf,
    pub device_name: String,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    /// `None` disables the long retry pool.
    pub long_retry_interval: Option<Duration>,
    pub limits: RetryLimits,
    pub max_connection_failures: u8,
    pub transfer: TransferConfig,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let token = std::env::var("CUMULUS_TOKEN").context("CUMULUS_TOKEN is not set")?;
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let sync_root = std::env::var("CUMULUS_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let data_dir = std::env::var("CUMULUS_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_dir);
        let base_url =
            std::env::var("CUMULUS_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let device_name = std::env::var("CUMULUS_DEVICE_NAME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(default_device_name);

        let defaults = RetryLimits::default();
        let limits = RetryLimits {
            max_failure_retries: read_u32_env(
                "CUMULUS_MAX_FAILURE_RETRIES",
                defaults.max_failure_retries,
            ),
            max_not_founds: read_u32_env("CUMULUS_MAX_NOT_FOUNDS", defaults.max_not_founds),
        };
        let max_connection_failures = u8::try_from(read_u64_env(
            "CUMULUS_MAX_CONNECTION_FAILURES",
            DEFAULT_MAX_CONNECTION_FAILURES,
        ))
        .unwrap_or(u8::MAX);

        Ok(Self {
            token,
            base_url,
            sync_root,
            data_dir,
            device_name,
            poll_interval: Duration::from_secs(read_u64_env("CUMULUS_POLL_SECS", DEFAULT_POLL_SECS)),
            retry_interval: Duration::from_millis(read_u64_env(
                "CUMULUS_RETRY_MS",
                DEFAULT_RETRY_MS,
            )),
            long_retry_interval: parse_optional_secs(
                std::env::var("CUMULUS_LONG_RETRY_SECS").ok().as_deref(),
                DEFAULT_LONG_RETRY_SECS,
            ),
            limits,
            max_connection_failures,
            transfer: TransferConfig::from_env(),
            enable_local_watcher: read_bool_env("CUMULUS_ENABLE_LOCAL_WATCHER", true),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            limits: self.limits,
            retry_interval: self.retry_interval,
            long_retry_interval: self.long_retry_interval,
            transfer: self.transfer,
            max_connection_failures: self.max_connection_failures,
            ..EngineConfig::new(&self.sync_root, &self.device_name)
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: Arc<EventStore>,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;

        let store = Arc::new(
            EventStore::open(&default_db_path(&config.data_dir))
                .await
                .context("failed to initialize event store")?,
        );
        let client = CumulusClient::with_base_url(&config.base_url, config.token.clone())
            .context("invalid sync service url")?;
        let cancel = CancellationToken::new();
        let transport = Arc::new(ClientTransport::new(
            client,
            config.device_name.clone(),
            cancel.child_token(),
        ));
        let engine = SyncEngine::new(
            config.engine_config(),
            transport,
            store.clone(),
            Arc::new(TracingNotifier),
            cancel,
        )
        .context("failed to initialize sync engine")?;

        Ok(Self {
            config,
            store,
            engine: Arc::new(engine),
        })
    }

    /// One run plus the transfers it started.
    pub async fn run_once(self) -> anyhow::Result<()> {
        self.engine.request_poll();
        let result = self.engine.run(false).await;
        self.engine.wait_for_transfers().await;
        self.engine.shutdown();
        let summary = result.context("sync run failed")?;
        info!(
            completed = summary.completed,
            dispatched = summary.dispatched,
            failed = summary.failed,
            "sync pass finished"
        );
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            sync_root = %self.config.sync_root.display(),
            device = %self.config.device_name,
            local_watcher = self.config.enable_local_watcher,
            "cumulusd started"
        );

        let mut triggers = self.engine.take_trigger_receiver();
        let (watcher, local_rx) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.sync_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let (ingested_tx, ingested_rx) = mpsc::unbounded_channel::<()>();
        let mut ingested_rx = Some(ingested_rx);
        let ingest_handle = local_rx.map(|mut rx| {
            let store = self.store.clone();
            let echo = self.engine.echo_filter();
            let sync_root = self.config.sync_root.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match ingest_local_event(&store, &echo, &sync_root, event).await {
                        Ok(true) => {
                            let _ = ingested_tx.send(());
                        }
                        Ok(false) => {}
                        Err(err) => warn!(error = %err, "failed to record local change"),
                    }
                }
            })
        });

        let mut backoff = PollBackoff::new(POLL_BACKOFF_BASE, POLL_BACKOFF_MAX);
        let next_poll = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(next_poll);

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    break;
                }
                _ = &mut next_poll => {
                    self.engine.request_poll();
                    self.run_pass(&mut backoff).await;
                }
                trigger = recv_or_pending(&mut triggers) => {
                    debug!(?trigger, "retry timer fired");
                    self.run_pass(&mut backoff).await;
                }
                _ = recv_or_pending(&mut ingested_rx) => {
                    if let Some(rx) = ingested_rx.as_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                    self.run_pass(&mut backoff).await;
                }
            }

            if self.engine.is_halted() {
                error!("sync halted, restart cumulusd once the cause is fixed");
                tokio::signal::ctrl_c()
                    .await
                    .context("failed waiting for shutdown signal")?;
                break;
            }
            let delay = backoff.next_delay(self.config.poll_interval);
            next_poll.as_mut().reset(Instant::now() + delay);
        }

        info!("shutting down");
        self.engine.shutdown();
        if let Some(handle) = ingest_handle {
            handle.abort();
        }
        drop(watcher);
        Ok(())
    }

    async fn run_pass(&self, backoff: &mut PollBackoff) {
        let mut connection_failed = false;
        match self.engine.run(false).await {
            Ok(summary) if summary.grabbed + summary.server_changes + summary.failed > 0 => {
                info!(
                    grabbed = summary.grabbed,
                    completed = summary.completed,
                    server_changes = summary.server_changes,
                    dispatched = summary.dispatched,
                    failed = summary.failed,
                    "sync run finished"
                );
            }
            Ok(_) => {}
            Err(err) if err.is_cancelled() => debug!("sync run cancelled"),
            Err(err) => {
                connection_failed = err
                    .transport()
                    .is_some_and(|transport| transport.is_connection_failure());
                warn!(error = %err, "sync run failed");
            }
        }
        if connection_failed || self.engine.connection_failures() > 0 {
            backoff.record_failure();
        } else {
            backoff.reset();
        }
    }
}

/// Records a watcher event as a pending change. Returns `false` for events
/// the engine caused itself.
async fn ingest_local_event(
    store: &EventStore,
    echo: &EchoFilter,
    sync_root: &Path,
    event: LocalEvent,
) -> anyhow::Result<bool> {
    let echoed = match &event {
        LocalEvent::Moved { from, to } => echo.is_suppressed(from) || echo.is_suppressed(to),
        other => echo.is_suppressed(other.path()),
    };
    if echoed {
        debug!(path = event.path(), "ignoring echo of an engine change");
        return Ok(false);
    }
    let is_folder = classify_local_event(store, sync_root, &event).await?;
    let change = event.into_change(is_folder);
    let id = store
        .record_local_event(&change)
        .await
        .with_context(|| format!("failed to store change for {}", change.new_path))?;
    debug!(event_id = id, path = %change.new_path, kind = change.kind.label(), "local change recorded");
    Ok(true)
}

/// Whether the event concerns a folder. Gone paths are looked up in the
/// synced state.
async fn classify_local_event(
    store: &EventStore,
    sync_root: &Path,
    event: &LocalEvent,
) -> anyhow::Result<bool> {
    let local = local_path_for(sync_root, event.path())?;
    if let Ok(meta) = tokio::fs::symlink_metadata(&local).await {
        return Ok(meta.is_dir());
    }
    let known_as = match event {
        LocalEvent::Moved { from, .. } => from.as_str(),
        other => other.path(),
    };
    Ok(store
        .get_synced(known_as)
        .await?
        .is_some_and(|item| item.is_folder))
}

async fn recv_or_pending<T>(rx: &mut Option<UnboundedReceiver<T>>) -> T {
    if let Some(rx) = rx
        && let Some(value) = rx.recv().await
    {
        return value;
    }
    pending().await
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cumulus")
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_u32_env(name: &str, default: u32) -> u32 {
    u32::try_from(read_u64_env(name, u64::from(default))).unwrap_or(u32::MAX)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// `0` turns the interval off; unparsable values fall back to the default.
fn parse_optional_secs(value: Option<&str>, default: u64) -> Option<Duration> {
    let secs = value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default);
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
