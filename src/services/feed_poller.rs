//! Feed poller service
//!
//! Periodically fetches the JSON list of published items through the local
//! proxy, so the fetch carries the injected credentials, and announces every
//! item that has not been seen before and was not explicitly removed.
//!
//! A fetch refused by the local proxy means its listener is gone; when a
//! [`ListenerSupervisor`] is attached the poller brings it back up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, HOST};
use hyper::{Method, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RelayError, Result};
use crate::proxy::{ListenerSupervisor, UpstreamConnector};
use crate::retry::{BackoffPolicy, HttpStatusClassifier, RetryingCall};

/// Capacity of the new-entry broadcast channel
const ANNOUNCE_CAPACITY: usize = 256;

/// One item of the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Numeric or string id, depending on the publisher
    pub id: serde_json::Value,
    pub info_hash: String,
    #[serde(default)]
    pub label: String,
}

impl FeedEntry {
    /// The id as plain text, without JSON quoting
    pub fn id_key(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Path of the item's download, relative to the local proxy
    pub fn download_path(&self) -> String {
        format!("/torrent/{}.torrent", self.id_key())
    }

    fn hash_key(&self) -> String {
        self.info_hash.to_lowercase()
    }
}

/// A feed entry seen for the first time
#[derive(Debug, Clone, Serialize)]
pub struct NewFeedEntry {
    pub entry: FeedEntry,
    pub download_path: String,
    pub discovered_at: DateTime<Utc>,
}

/// Feed poller configuration
#[derive(Debug, Clone)]
pub struct FeedPollerConfig {
    /// Local proxy the feed is fetched through
    pub proxy_host: String,
    pub proxy_port: u16,
    pub feed_path: String,
    pub interval: Duration,
    /// Ids or info hashes never announced
    pub removed: HashSet<String>,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

/// Ids and info hashes that are never announced.
///
/// Ids compare exactly; info hashes compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RemovedEntries {
    ids: HashSet<String>,
    hashes: HashSet<String>,
}

impl RemovedEntries {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = Self::default();
        for item in items {
            let item = item.as_ref();
            removed.ids.insert(item.to_string());
            removed.hashes.insert(item.to_lowercase());
        }
        removed
    }

    pub fn matches(&self, entry: &FeedEntry) -> bool {
        self.ids.contains(&entry.id_key()) || self.hashes.contains(&entry.hash_key())
    }
}

/// Parse the body of a feed response
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedEntry>> {
    serde_json::from_slice(body).map_err(|e| RelayError::InvalidFeed(e.to_string()))
}

/// Entries that are neither known nor removed, in feed order, each at most once
pub fn diff_entries(
    entries: &[FeedEntry],
    known: &HashSet<String>,
    removed: &RemovedEntries,
) -> Vec<FeedEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|entry| {
            let hash = entry.hash_key();
            !known.contains(&hash) && !removed.matches(entry) && seen.insert(hash)
        })
        .cloned()
        .collect()
}

/// Feed poller service
pub struct FeedPoller {
    config: FeedPollerConfig,
    connector: UpstreamConnector,
    /// Lowercased info hashes already announced
    known: HashSet<String>,
    removed: RemovedEntries,
    announce_tx: broadcast::Sender<NewFeedEntry>,
    listener: Option<Arc<ListenerSupervisor>>,
}

impl FeedPoller {
    /// Create a new feed poller
    pub fn new(config: FeedPollerConfig) -> Result<Self> {
        config.backoff.validate()?;

        let connector = UpstreamConnector::new(
            config.proxy_host.clone(),
            config.proxy_port,
            false,
            config.connect_timeout,
            config.response_timeout,
        )?;
        let removed = RemovedEntries::new(&config.removed);
        let (announce_tx, _) = broadcast::channel(ANNOUNCE_CAPACITY);

        Ok(Self {
            config,
            connector,
            known: HashSet::new(),
            removed,
            announce_tx,
            listener: None,
        })
    }

    /// Restart this listener whenever a fetch through it is refused
    pub fn with_listener(mut self, listener: Arc<ListenerSupervisor>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Mark info hashes as already present so they are never announced
    pub fn with_known<I, S>(mut self, hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.known
            .extend(hashes.into_iter().map(|h| h.as_ref().to_lowercase()));
        self
    }

    /// Receive every newly discovered entry
    pub fn subscribe(&self) -> broadcast::Receiver<NewFeedEntry> {
        self.announce_tx.subscribe()
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Run the poll loop until shutdown
    #[instrument(skip(self, shutdown), fields(feed = %self.config.feed_path))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting feed poller (every {}s via {})",
            self.config.interval.as_secs(),
            self.connector.addr()
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cancel = shutdown.clone();
                    let outcome = tokio::select! {
                        outcome = self.poll_with_recovery(Some(cancel)) => outcome,
                        _ = stop_requested(&mut shutdown) => Err(RelayError::Cancelled),
                    };
                    match outcome {
                        Ok(new_entries) => {
                            debug!("Feed poll found {} new entries", new_entries.len());
                        }
                        Err(RelayError::Cancelled) => {
                            info!("Feed poll cancelled");
                            break;
                        }
                        Err(e) => {
                            error!("Feed poll failed: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Feed poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// [`poll_once`](Self::poll_once), restarting the local listener when
    /// the fetch was refused
    async fn poll_with_recovery(
        &mut self,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Vec<NewFeedEntry>> {
        let result = self.poll_once(cancel).await;
        if let (Err(e), Some(listener)) = (&result, &self.listener) {
            if e.is_connection_refused() {
                warn!("Local proxy refused the feed request, restarting listener");
                match listener.ensure_running().await {
                    Ok(addr) => info!("Proxy listener running on {}", addr),
                    Err(e) => error!("Failed to restart proxy listener: {}", e),
                }
            }
        }
        result
    }

    /// Fetch the feed once, with retries, and announce what is new
    #[instrument(skip(self, cancel))]
    pub async fn poll_once(
        &mut self,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Vec<NewFeedEntry>> {
        let connector = &self.connector;
        let path = self.config.feed_path.as_str();

        let mut call = RetryingCall::new(|| fetch_feed(connector, path));
        if let Some(cancel) = cancel {
            call = call.with_cancellation(cancel);
        }
        let entries = call
            .start(self.config.backoff.sequence(), HttpStatusClassifier::new())
            .await?;

        let discovered_at = Utc::now();
        let new_entries: Vec<NewFeedEntry> = diff_entries(&entries, &self.known, &self.removed)
            .into_iter()
            .map(|entry| NewFeedEntry {
                download_path: entry.download_path(),
                entry,
                discovered_at,
            })
            .collect();

        for new_entry in &new_entries {
            self.known.insert(new_entry.entry.hash_key());
            info!(
                id = %new_entry.entry.id_key(),
                info_hash = %new_entry.entry.info_hash,
                "New feed entry: {}",
                new_entry.entry.label
            );
            if self.announce_tx.send(new_entry.clone()).is_err() {
                debug!("No subscribers for new feed entries");
            }
        }

        Ok(new_entries)
    }
}

/// Resolves once shutdown is requested or its sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn fetch_feed(connector: &UpstreamConnector, path: &str) -> Result<Vec<FeedEntry>> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, connector.addr())
        .header(ACCEPT, "application/json")
        .body(Empty::<Bytes>::new())
        .map_err(|e| RelayError::InvalidRequest(format!("invalid feed path {:?}: {}", path, e)))?;

    let response = connector.send(req).await?;
    let status = response.status();
    if !status.is_success() {
        warn!("Feed request returned {}", status);
        return Err(RelayError::UpstreamHttpError {
            status: status.as_u16(),
        });
    }

    let body = response.into_body().collect().await?.to_bytes();
    parse_feed(&body)
}

/// Handle for managing the feed poller
pub struct FeedPollerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl FeedPollerHandle {
    /// Handle plus the shutdown receiver to pass to [`FeedPoller::run`]
    pub fn channel() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    /// Spawn the poller on the runtime
    pub fn spawn(poller: FeedPoller) -> (Self, JoinHandle<()>) {
        let (handle, shutdown) = Self::channel();
        let task = tokio::spawn(poller.run(shutdown));
        (handle, task)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for FeedPollerHandle {
    fn default() -> Self {
        Self::channel().0
    }
}
