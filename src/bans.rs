//! In-memory authoritative ban registry.
//!
//! Loaded from the SQL store at startup; live mutations additionally fan
//! into the hub so matching sockets are disconnected. Lookups are
//! read-locked; expired entries are collected lazily on access.

use crate::user::Userid;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Sentinel expiry for permanent bans: 2030-01-01T00:00:00Z.
pub fn far_future_secs() -> i64 {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
struct BanTables {
    /// Target uid → expiry (unix seconds).
    users: HashMap<Userid, i64>,
    /// Masked IP → (owning uid, expiry).
    ips: HashMap<String, (Userid, i64)>,
}

#[derive(Debug, Default)]
pub struct BanRegistry {
    inner: RwLock<BanTables>,
}

impl BanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban a user id until `end` (unix seconds).
    pub fn ban_user(&self, id: Userid, end: i64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.users.insert(id, end);
    }

    /// Ban a masked IP until `end`, remembering the uid it was taken from.
    pub fn ban_ip(&self, ip: &str, owner: Userid, end: i64) {
        if ip.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.ips.insert(ip.to_string(), (owner, end));
    }

    /// Lift a user ban along with any IP bans recorded for that user.
    pub fn unban_user(&self, id: Userid) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.users.remove(&id);
        inner.ips.retain(|_, &mut (owner, _)| owner != id);
    }

    pub fn is_user_banned(&self, id: Userid) -> bool {
        let now = Utc::now().timestamp();
        let expired = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match inner.users.get(&id) {
                Some(&end) if end > now => return true,
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if matches!(inner.users.get(&id), Some(&end) if end <= now) {
                debug!(uid = %id, "collecting expired user ban");
                inner.users.remove(&id);
            }
        }
        false
    }

    pub fn is_ip_banned(&self, ip: &str) -> bool {
        let now = Utc::now().timestamp();
        let expired = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match inner.ips.get(ip) {
                Some(&(_, end)) if end > now => return true,
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if matches!(inner.ips.get(ip), Some(&(_, end)) if end <= now) {
                debug!(ip = %ip, "collecting expired ip ban");
                inner.ips.remove(ip);
            }
        }
        false
    }

    /// Rehydrate from rows of `(target uid, optional ip, expiry secs)`.
    pub fn load_active(&self, rows: &[(Userid, Option<String>, i64)]) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (uid, ip, end) in rows {
            inner.users.insert(*uid, *end);
            if let Some(ip) = ip {
                if !ip.is_empty() {
                    inner.ips.insert(ip.clone(), (*uid, *end));
                }
            }
        }
    }
}
