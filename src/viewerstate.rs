//! Viewer-state ingestion: syncs the upstream viewer directory and
//! rebroadcasts deltas to chat.
//!
//! The sync loop long-polls the upstream with a signed token and streams
//! newline-delimited JSON records into the authoritative map; identical
//! states are coalesced. Any error backs off 30 seconds and reconnects.

use crate::auth;
use crate::config::Config;
use crate::hub::HubHandle;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::warn;

const SYNC_RETRY: Duration = Duration::from_secs(30);
const CHANGE_QUEUE_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("viewer state request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("minting api token failed: {0}")]
    Token(#[from] auth::AuthError),
    #[error("parsing viewer state: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("reading viewer state stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a viewer is watching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamChannel {
    pub channel: String,
    pub service: String,
    pub path: String,
}

/// One upstream viewer-state record.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerState {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub enable_public_state: bool,
    #[serde(default)]
    pub channel: Option<StreamChannel>,
}

impl ViewerState {
    /// Visible-state equality: changes in other fields are not rebroadcast.
    fn same_visible_state(&self, other: &Self) -> bool {
        self.online == other.online
            && self.enable_public_state == other.enable_public_state
            && self.channel == other.channel
    }
}

/// Delta emitted when a viewer changes channel, comes online or goes
/// offline.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ViewerStateChange {
    pub nick: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<StreamChannel>,
}

/// Authoritative copy of the upstream viewer states.
#[derive(Default)]
pub struct ViewerStateStore {
    states: RwLock<HashMap<String, ViewerState>>,
    subscribers: Mutex<Vec<mpsc::Sender<ViewerStateChange>>>,
}

impl ViewerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a change subscriber. The emitter awaits full channels,
    /// so subscribers must keep draining.
    pub fn subscribe(&self) -> mpsc::Receiver<ViewerStateChange> {
        let (tx, rx) = mpsc::channel(CHANGE_QUEUE_SIZE);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Apply one upstream record, emitting a delta unless it is identical
    /// to the held state.
    pub async fn update_public_state(&self, state: ViewerState) {
        let change = {
            let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
            let previous = states.get(&state.user_id);
            if !state.enable_public_state || !state.online {
                match previous {
                    Some(_) => {
                        let nick = state.name.clone();
                        states.remove(&state.user_id);
                        Some(ViewerStateChange { nick, online: false, channel: None })
                    }
                    None => None,
                }
            } else if previous.is_some_and(|p| p.same_visible_state(&state)) {
                None
            } else {
                let change = ViewerStateChange {
                    nick: state.name.clone(),
                    online: true,
                    channel: state.channel.clone(),
                };
                states.insert(state.user_id.clone(), state);
                Some(change)
            }
        };

        if let Some(change) = change {
            self.emit(change).await;
        }
    }

    async fn emit(&self, change: ViewerStateChange) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for subscriber in subscribers {
            let _ = subscriber.send(change.clone()).await;
        }
    }

    /// The current online set, for the HTTP API.
    pub fn dump(&self) -> Vec<ViewerStateChange> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|state| ViewerStateChange {
                nick: state.name.clone(),
                online: true,
                channel: state.channel.clone(),
            })
            .collect()
    }

    async fn sync_once(&self, client: &reqwest::Client, config: &Config) -> Result<(), SyncError> {
        let token = auth::mint_api_token(&config.auth.jwt_secret, &config.auth.api_user_id)?;
        let response = client
            .get(&config.upstream.viewer_state_api)
            .header(
                reqwest::header::COOKIE,
                format!("{}={}", config.auth.jwt_cookie, token),
            )
            .send()
            .await?
            .error_for_status()?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut lines = BufReader::new(StreamReader::new(stream)).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let state: ViewerState = serde_json::from_str(&line)?;
            self.update_public_state(state).await;
        }
        Ok(())
    }
}

/// Long-poll the upstream forever, backing off 30 s on any failure or
/// stream end.
pub async fn run_sync(store: Arc<ViewerStateStore>, client: reqwest::Client, config: Arc<Config>) {
    loop {
        if let Err(e) = store.sync_once(&client, &config).await {
            warn!(error = %e, "error syncing viewer state");
        }
        tokio::time::sleep(SYNC_RETRY).await;
    }
}

/// Forward every state change into the hub as a `VIEWERSTATE` broadcast.
pub async fn run_broadcast(store: Arc<ViewerStateStore>, hub: HubHandle) {
    let mut changes = store.subscribe();
    while let Some(change) = changes.recv().await {
        hub.broadcast("VIEWERSTATE", &change).await;
    }
}
