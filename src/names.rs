//! The names cache: the authoritative in-memory user directory.
//!
//! Owns every connected [`User`] keyed by id, counts connections
//! (anonymous ones included), and memoises the marshalled `NAMES` payload,
//! regenerated on every change. Also maintains the nick → uid directory
//! used by private messages and moderation target lookup.

use crate::proto::NamesOut;
use crate::user::{FeatureMemo, User, Userid};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use tracing::error;

/// Directory entry for nick lookups.
#[derive(Debug, Clone, Copy)]
pub struct NickEntry {
    pub id: Userid,
    pub protected: bool,
}

#[derive(Debug)]
struct Roster {
    users: HashMap<Userid, Arc<User>>,
    connection_count: u32,
    payload: Arc<String>,
}

pub struct NamesCache {
    inner: RwLock<Roster>,
    nicks: DashMap<String, NickEntry>,
    memo: FeatureMemo,
}

impl Default for NamesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NamesCache {
    pub fn new() -> Self {
        let cache = Self {
            inner: RwLock::new(Roster {
                users: HashMap::new(),
                connection_count: 0,
                payload: Arc::new(String::new()),
            }),
            nicks: DashMap::new(),
            memo: FeatureMemo::new(),
        };
        {
            let mut roster = cache.inner.write().unwrap_or_else(|e| e.into_inner());
            Self::regenerate(&mut roster);
        }
        cache
    }

    /// The feature-label memo shared with user construction.
    pub fn memo(&self) -> &FeatureMemo {
        &self.memo
    }

    /// Register a connection for `user`. Returns the canonical user: there
    /// is only ever one `User` per id, the cache makes sure of that.
    pub fn add(&self, user: User) -> Arc<User> {
        let mut roster = self.inner.write().unwrap_or_else(|e| e.into_inner());
        roster.connection_count += 1;
        let user = match roster.users.get(&user.id) {
            Some(existing) => {
                existing.connections.fetch_add(1, Ordering::SeqCst);
                existing.clone()
            }
            None => {
                user.connections.store(1, Ordering::SeqCst);
                let user = Arc::new(user);
                roster.users.insert(user.id, user.clone());
                self.nicks.insert(
                    user.nick().to_lowercase(),
                    NickEntry { id: user.id, protected: user.is_protected() },
                );
                user
            }
        };
        Self::regenerate(&mut roster);
        user
    }

    /// Unregister one connection for `user`. Returns true when this was
    /// the last connection and the user left the roster.
    pub fn disconnect(&self, user: &Arc<User>) -> bool {
        let mut roster = self.inner.write().unwrap_or_else(|e| e.into_inner());
        roster.connection_count = roster.connection_count.saturating_sub(1);
        let mut removed = false;
        if let Some(existing) = roster.users.get(&user.id).cloned() {
            let remaining = existing.connections.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining <= 0 {
                roster.users.remove(&user.id);
                self.nicks.remove(&existing.nick().to_lowercase());
                removed = true;
            }
        }
        Self::regenerate(&mut roster);
        removed
    }

    /// Count an anonymous connection.
    pub fn add_connection(&self) {
        let mut roster = self.inner.write().unwrap_or_else(|e| e.into_inner());
        roster.connection_count += 1;
        Self::regenerate(&mut roster);
    }

    /// Drop an anonymous connection.
    pub fn remove_connection(&self) {
        let mut roster = self.inner.write().unwrap_or_else(|e| e.into_inner());
        roster.connection_count = roster.connection_count.saturating_sub(1);
        Self::regenerate(&mut roster);
    }

    /// Replace nick and features for a connected user in place.
    pub fn refresh(&self, id: Userid, nick: String, features: u32) -> Option<Arc<User>> {
        let mut roster = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let user = roster.users.get(&id).cloned()?;
        let previous = user.nick().to_lowercase();
        user.refresh(nick, features, &self.memo);
        self.nicks.remove(&previous);
        self.nicks.insert(
            user.nick().to_lowercase(),
            NickEntry { id, protected: user.is_protected() },
        );
        Self::regenerate(&mut roster);
        Some(user)
    }

    pub fn get(&self, id: Userid) -> Option<Arc<User>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .users
            .get(&id)
            .cloned()
    }

    /// Case-insensitive nick lookup against the connected set.
    pub fn lookup_nick(&self, nick: &str) -> Option<NickEntry> {
        self.nicks.get(&nick.to_lowercase()).map(|e| *e.value())
    }

    /// The memoised `NAMES` payload.
    pub fn payload(&self) -> Arc<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .payload
            .clone()
    }

    pub fn connection_count(&self) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .connection_count
    }

    pub fn user_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).users.len()
    }

    fn regenerate(roster: &mut Roster) {
        let mut users = Vec::with_capacity(roster.users.len());
        for user in roster.users.values() {
            // users at zero connections are removed eagerly; guard anyway
            if user.connections.load(Ordering::SeqCst) <= 0 {
                continue;
            }
            users.push(user.simplified());
        }
        let names = NamesOut {
            users,
            connectioncount: roster.connection_count,
        };
        match serde_json::to_string(&names) {
            Ok(payload) => roster.payload = Arc::new(payload),
            Err(e) => error!(error = %e, "could not marshal names"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::features_from_labels;

    fn user(id: i64, nick: &str, labels: &[&str]) -> User {
        let memo = FeatureMemo::new();
        User::new(Userid(id), nick.into(), features_from_labels(labels), &memo)
    }

    #[test]
    fn add_counts_connections() {
        let cache = NamesCache::new();
        let alice = cache.add(user(1, "alice", &[]));
        assert_eq!(cache.connection_count(), 1);
        assert_eq!(alice.connections.load(Ordering::SeqCst), 1);

        // second socket for the same user returns the canonical instance
        let again = cache.add(user(1, "alice", &[]));
        assert!(Arc::ptr_eq(&alice, &again));
        assert_eq!(cache.connection_count(), 2);
        assert_eq!(alice.connections.load(Ordering::SeqCst), 2);
        assert_eq!(cache.user_count(), 1);
    }

    #[test]
    fn disconnect_removes_at_zero() {
        let cache = NamesCache::new();
        let alice = cache.add(user(1, "alice", &[]));
        let _ = cache.add(user(1, "alice", &[]));

        assert!(!cache.disconnect(&alice));
        assert_eq!(cache.user_count(), 1);
        assert!(cache.disconnect(&alice));
        assert_eq!(cache.user_count(), 0);
        assert_eq!(cache.connection_count(), 0);
        assert!(cache.lookup_nick("alice").is_none());
    }

    #[test]
    fn every_cached_user_has_connections() {
        let cache = NamesCache::new();
        let a = cache.add(user(1, "a", &[]));
        let _b = cache.add(user(2, "b", &[]));
        cache.add_connection();
        cache.disconnect(&a);
        // invariant: present in cache iff connections > 0
        for id in [Userid(1), Userid(2)] {
            if let Some(u) = cache.get(id) {
                assert!(u.connections.load(Ordering::SeqCst) > 0);
            }
        }
        // 1 named (b) + 1 anonymous
        assert_eq!(cache.connection_count(), 2);
    }

    #[test]
    fn anonymous_connections_count() {
        let cache = NamesCache::new();
        cache.add_connection();
        cache.add_connection();
        cache.remove_connection();
        assert_eq!(cache.connection_count(), 1);
        assert_eq!(cache.user_count(), 0);
    }

    #[test]
    fn payload_tracks_changes() {
        let cache = NamesCache::new();
        assert_eq!(*cache.payload(), r#"{"users":[],"connectioncount":0}"#);

        let bob = cache.add(user(7, "bob", &["subscriber"]));
        assert_eq!(
            *cache.payload(),
            r#"{"users":[{"nick":"bob","features":["subscriber"]}],"connectioncount":1}"#
        );

        cache.disconnect(&bob);
        assert_eq!(*cache.payload(), r#"{"users":[],"connectioncount":0}"#);
    }

    #[test]
    fn nick_lookup_is_case_insensitive() {
        let cache = NamesCache::new();
        cache.add(user(3, "Cinder", &["protected"]));
        let entry = cache.lookup_nick("cinder").expect("found");
        assert_eq!(entry.id, Userid(3));
        assert!(entry.protected);
    }

    #[test]
    fn refresh_updates_nick_and_features() {
        let cache = NamesCache::new();
        cache.add(user(4, "old", &[]));
        cache
            .refresh(Userid(4), "new".into(), features_from_labels(&["moderator"]))
            .expect("connected");
        assert!(cache.lookup_nick("old").is_none());
        let entry = cache.lookup_nick("new").expect("found");
        assert_eq!(entry.id, Userid(4));
        let refreshed = cache.get(Userid(4)).expect("present");
        assert!(refreshed.is_moderator());
    }
}
