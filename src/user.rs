//! Users: identity, feature bitmask, throttle state, and the simplified
//! on-wire projection.

use crate::error::HandlerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Numeric user identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Userid(pub i64);

impl fmt::Display for Userid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub const ISADMIN: u32 = 1 << 0;
pub const ISMODERATOR: u32 = 1 << 1;
pub const ISVIP: u32 = 1 << 2;
pub const ISPROTECTED: u32 = 1 << 3;
pub const ISSUBSCRIBER: u32 = 1 << 4;
pub const ISBOT: u32 = 1 << 5;

/// Numbered flair bits occupy `FLAIR_BASE..FLAIR_BASE + FLAIR_COUNT`.
const FLAIR_BASE: u32 = 6;
const FLAIR_COUNT: u32 = 21;

/// Parse feature labels into the bitmask. Unknown labels are ignored,
/// `flairN` maps to the numbered flair bits.
pub fn features_from_labels<S: AsRef<str>>(labels: &[S]) -> u32 {
    let mut features = 0u32;
    for label in labels {
        match label.as_ref() {
            "admin" => features |= ISADMIN,
            "moderator" => features |= ISMODERATOR,
            "vip" => features |= ISVIP,
            "protected" => features |= ISPROTECTED,
            "subscriber" => features |= ISSUBSCRIBER,
            "bot" => features |= ISBOT,
            "" => {}
            other => {
                if let Some(n) = other.strip_prefix("flair") {
                    match n.parse::<u32>() {
                        Ok(i) if i < FLAIR_COUNT => features |= 1 << (FLAIR_BASE + i),
                        _ => tracing::debug!(feature = %other, "could not parse feature"),
                    }
                }
            }
        }
    }
    features
}

/// Memoised bitmask → ordered feature labels, shared across all users
/// with the same bitmask. A single lock acquisition covers the lookup
/// and the fill on miss.
#[derive(Default)]
pub struct FeatureMemo {
    cache: Mutex<HashMap<u32, Arc<Vec<String>>>>,
}

impl FeatureMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self, features: u32) -> Arc<Vec<String>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(features)
            .or_insert_with(|| Arc::new(assemble_labels(features)))
            .clone()
    }
}

fn assemble_labels(features: u32) -> Vec<String> {
    let mut labels = Vec::with_capacity(features.count_ones() as usize);
    if features & ISPROTECTED != 0 {
        labels.push("protected".to_string());
    }
    if features & ISSUBSCRIBER != 0 {
        labels.push("subscriber".to_string());
    }
    if features & ISVIP != 0 {
        labels.push("vip".to_string());
    }
    if features & ISMODERATOR != 0 {
        labels.push("moderator".to_string());
    }
    if features & ISADMIN != 0 {
        labels.push("admin".to_string());
    }
    if features & ISBOT != 0 {
        labels.push("bot".to_string());
    }
    for i in 0..FLAIR_COUNT {
        if features & (1 << (FLAIR_BASE + i)) != 0 {
            labels.push(format!("flair{i}"));
        }
    }
    labels
}

/// The on-wire projection of a user: nick plus ordered feature labels.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimplifiedUser {
    pub nick: String,
    pub features: Arc<Vec<String>>,
}

/// Nick, features and the cached projection, swapped atomically on refresh.
#[derive(Debug)]
struct Profile {
    nick: String,
    features: u32,
    simplified: SimplifiedUser,
}

/// Per-user throttle state. Anchored at the last *accepted* message.
#[derive(Debug)]
struct Throttle {
    last_message: String,
    last_message_time: Option<Instant>,
    delay_scale: u16,
}

/// A chat user. Owned by the names cache; connections hold `Arc` references.
pub struct User {
    pub id: Userid,
    profile: RwLock<Profile>,
    throttle: Mutex<Throttle>,
    /// Live connection count, read while holding only the cache's read lock.
    pub connections: AtomicI32,
}

impl User {
    pub fn new(id: Userid, nick: String, features: u32, memo: &FeatureMemo) -> Self {
        let simplified = SimplifiedUser {
            nick: nick.clone(),
            features: memo.labels(features),
        };
        Self {
            id,
            profile: RwLock::new(Profile { nick, features, simplified }),
            throttle: Mutex::new(Throttle {
                last_message: String::new(),
                last_message_time: None,
                delay_scale: 1,
            }),
            connections: AtomicI32::new(0),
        }
    }

    pub fn nick(&self) -> String {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).nick.clone()
    }

    pub fn features(&self) -> u32 {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).features
    }

    pub fn simplified(&self) -> SimplifiedUser {
        self.profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .simplified
            .clone()
    }

    /// Replace nick and features in place, refreshing the projection.
    pub fn refresh(&self, nick: String, features: u32, memo: &FeatureMemo) {
        let mut profile = self.profile.write().unwrap_or_else(|e| e.into_inner());
        profile.simplified = SimplifiedUser {
            nick: nick.clone(),
            features: memo.labels(features),
        };
        profile.nick = nick;
        profile.features = features;
    }

    fn has_feature(&self, mask: u32) -> bool {
        self.features() & mask != 0
    }

    /// Whether the user can use moderation commands.
    pub fn is_moderator(&self) -> bool {
        self.has_feature(ISMODERATOR | ISADMIN)
    }

    /// Whether the user can speak while submode is active.
    pub fn is_subscriber(&self) -> bool {
        self.has_feature(ISSUBSCRIBER | ISADMIN | ISMODERATOR | ISVIP | ISBOT)
    }

    /// Bots are exempt from rate limiting.
    pub fn is_bot(&self) -> bool {
        self.has_feature(ISBOT)
    }

    /// Protected users cannot be moderated.
    pub fn is_protected(&self) -> bool {
        self.has_feature(ISADMIN | ISPROTECTED)
    }

    /// Admission check for an inbound message at `now`.
    ///
    /// The cooldown is `delay * delay_scale`. A rejection doubles the scale
    /// (saturating at `max_scale`); an interval above twice the cooldown
    /// resets it. An identical payload inside the cooldown window is a
    /// `duplicate`. Accepted messages re-anchor the window.
    pub fn check_throttle(
        &self,
        payload: &str,
        now: Instant,
        delay: Duration,
        max_scale: u16,
    ) -> Result<(), HandlerError> {
        let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_bot() {
            throttle.last_message = payload.to_string();
            throttle.last_message_time = Some(now);
            return Ok(());
        }

        if let Some(last) = throttle.last_message_time {
            let since = now.saturating_duration_since(last);
            let cooldown = delay * throttle.delay_scale as u32;
            if since < cooldown {
                if payload == throttle.last_message {
                    return Err(HandlerError::Duplicate);
                }
                throttle.delay_scale = throttle.delay_scale.saturating_mul(2).min(max_scale);
                return Err(HandlerError::Throttled);
            }
            if since > cooldown * 2 {
                throttle.delay_scale = 1;
            }
        }

        throttle.last_message = payload.to_string();
        throttle.last_message_time = Some(now);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn delay_scale(&self) -> u16 {
        self.throttle.lock().unwrap().delay_scale
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("nick", &self.nick())
            .finish()
    }
}
