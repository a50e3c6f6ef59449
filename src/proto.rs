//! Wire codec and event envelopes.
//!
//! Every frame in either direction is `NAME`, a single space, then a
//! compact JSON payload. Inbound frames are parsed into [`ClientCommand`]
//! at the frame boundary; unknown names are rejected there.

use crate::entities::Entities;
use crate::error::HandlerError;
use crate::user::SimplifiedUser;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Per-frame byte cap: 512 chars at up to 8 bytes each, plus overhead.
pub const MAX_FRAME_BYTES: usize = 6144;

/// Current timestamp in UTC unix milliseconds.
pub fn unix_milli() -> i64 {
    Utc::now().timestamp_millis()
}

/// Build a wire frame from an event name and a marshalled payload.
pub fn pack(event: &str, payload: &str) -> String {
    let mut frame = String::with_capacity(event.len() + 1 + payload.len());
    frame.push_str(event);
    frame.push(' ');
    frame.push_str(payload);
    frame
}

/// Build a wire frame from an event name and a serializable payload.
pub fn pack_json<T: Serialize>(event: &str, payload: &T) -> Result<String, serde_json::Error> {
    Ok(pack(event, &serde_json::to_string(payload)?))
}

/// Build an `ERR "<code>"` frame.
pub fn pack_err(code: &str) -> String {
    pack("ERR", &format!("\"{code}\""))
}

/// Split a frame into its event name and raw payload.
///
/// A frame with no payload (`PONG`) yields an empty payload slice.
pub fn split_frame(frame: &str) -> (&str, &str) {
    match frame.split_once(' ') {
        Some((name, payload)) => (name, payload),
        None => (frame, ""),
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MsgIn {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct PrivmsgIn {
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct MuteIn {
    /// Target nick.
    #[serde(default)]
    pub data: String,
    /// Mute duration in nanoseconds; absent means the default.
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BanIn {
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub reason: String,
    /// Ban duration in nanoseconds; absent means the default.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub ispermanent: bool,
    #[serde(default)]
    pub banip: bool,
}

#[derive(Debug, Deserialize)]
pub struct SimpleIn {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct PingIn {
    #[serde(default)]
    pub data: Option<i64>,
}

/// A parsed client frame.
#[derive(Debug)]
pub enum ClientCommand {
    Msg(MsgIn),
    Privmsg(PrivmsgIn),
    Mute(MuteIn),
    Unmute(SimpleIn),
    Ban(BanIn),
    Unban(SimpleIn),
    Subonly(SimpleIn),
    Broadcast(SimpleIn),
    Refresh(SimpleIn),
    Ping(PingIn),
    Pong(PingIn),
}

impl ClientCommand {
    /// Parse a raw frame into a command. Unknown names and malformed
    /// payloads are protocol errors.
    pub fn parse(frame: &str) -> Result<Self, HandlerError> {
        let (name, payload) = split_frame(frame);
        let payload = if payload.is_empty() { "{}" } else { payload };
        let cmd = match name {
            "MSG" => Self::Msg(serde_json::from_str(payload)?),
            "PRIVMSG" => Self::Privmsg(serde_json::from_str(payload)?),
            "MUTE" => Self::Mute(serde_json::from_str(payload)?),
            "UNMUTE" => Self::Unmute(serde_json::from_str(payload)?),
            "BAN" => Self::Ban(serde_json::from_str(payload)?),
            "UNBAN" => Self::Unban(serde_json::from_str(payload)?),
            "SUBONLY" => Self::Subonly(serde_json::from_str(payload)?),
            "BROADCAST" => Self::Broadcast(serde_json::from_str(payload)?),
            "REFRESH" => Self::Refresh(serde_json::from_str(payload)?),
            "PING" => Self::Ping(serde_json::from_str(payload)?),
            "PONG" => Self::Pong(serde_json::from_str(payload)?),
            other => return Err(HandlerError::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }
}

// ============================================================================
// Outbound payloads
// ============================================================================

/// Payload of a broadcast chat event (`MSG`, `JOIN`, `QUIT`, moderation
/// notices, `BROADCAST`).
#[derive(Debug, Serialize)]
pub struct EventDataOut {
    /// Sender projection; flattened to `nick` and `features`.
    #[serde(flatten)]
    pub user: Option<SimplifiedUser>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extradata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Entities>,
}

impl EventDataOut {
    /// A bare user event (`JOIN`/`QUIT`).
    pub fn user_event(user: SimplifiedUser) -> Self {
        Self {
            user: Some(user),
            timestamp: unix_milli(),
            data: String::new(),
            extradata: None,
            entities: None,
        }
    }

    /// A chat message with extracted entities.
    pub fn message(user: SimplifiedUser, data: String, entities: Entities) -> Self {
        Self {
            user: Some(user),
            timestamp: unix_milli(),
            data,
            extradata: None,
            entities: Some(entities),
        }
    }

    /// A moderation notice: the acting moderator plus the target nick.
    pub fn notice(user: SimplifiedUser, data: String) -> Self {
        Self {
            user: Some(user),
            timestamp: unix_milli(),
            data,
            extradata: None,
            entities: None,
        }
    }

    /// A senderless event (`BROADCAST`).
    pub fn system(data: String) -> Self {
        Self {
            user: None,
            timestamp: unix_milli(),
            data,
            extradata: None,
            entities: None,
        }
    }
}

/// Payload of the `NAMES` roster frame.
#[derive(Debug, Serialize)]
pub struct NamesOut {
    pub users: Vec<SimplifiedUser>,
    pub connectioncount: u32,
}

/// Payload of an outbound `PING`.
#[derive(Debug, Serialize)]
pub struct PingOut {
    pub data: i64,
}
