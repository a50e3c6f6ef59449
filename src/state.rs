//! Mute table and submode flag, persisted as a single binary snapshot.
//!
//! Every mutation rewrites the snapshot under the write lock, so a restart
//! rehydrates the exact moderation state.

use crate::user::Userid;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Serialized snapshot layout. Expiries are unix milliseconds.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    mutes: HashMap<Userid, i64>,
    submode: bool,
}

/// Process-wide moderation state: who is muted until when, and whether
/// subscriber-only mode is active.
#[derive(Debug)]
pub struct ChatState {
    path: PathBuf,
    inner: RwLock<Snapshot>,
}

impl ChatState {
    /// Load the snapshot from `path`, starting empty when it is missing
    /// or unreadable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => match bincode::deserialize(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not decode state file");
                    Snapshot::default()
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no state file, starting fresh");
                Snapshot::default()
            }
        };
        Self {
            path,
            inner: RwLock::new(snapshot),
        }
    }

    /// Whether `id` is currently muted. Expired entries are collected
    /// lazily here and the pruned snapshot persisted.
    pub fn is_muted(&self, id: Userid) -> bool {
        let now = Utc::now().timestamp_millis();
        let expired = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match inner.mutes.get(&id) {
                Some(&until) if until > now => return true,
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if matches!(inner.mutes.get(&id), Some(&until) if until <= now) {
                inner.mutes.remove(&id);
                self.save(&inner);
            }
        }
        false
    }

    /// Mute `id` until the given unix-millisecond timestamp.
    pub fn mute(&self, id: Userid, until: i64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.mutes.insert(id, until);
        self.save(&inner);
    }

    pub fn unmute(&self, id: Userid) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.mutes.remove(&id);
        self.save(&inner);
    }

    pub fn submode(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).submode
    }

    pub fn set_submode(&self, enabled: bool) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.submode = enabled;
        self.save(&inner);
    }

    /// Write the snapshot; called with the lock held.
    fn save(&self, snapshot: &Snapshot) {
        let bytes = match bincode::serialize(snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode state snapshot");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, bytes) {
            warn!(path = %self.path.display(), error = %e, "could not write state file");
        }
    }
}
