//! Unified error handling for chatd.
//!
//! Handler errors map onto single-frame `ERR "<code>"` replies. Policy
//! rejections keep the connection open; protocol-class errors close it.

use thiserror::Error;

/// Errors that can occur while handling a client frame.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("login required")]
    NeedLogin,

    #[error("subscriber-only mode is active")]
    Submode,

    #[error("muted")]
    Muted,

    #[error("throttled")]
    Throttled,

    #[error("duplicate message")]
    Duplicate,

    #[error("no permission")]
    NoPermission,

    #[error("target not found")]
    NotFound,

    #[error("ban reason required")]
    NeedBanReason,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed payload")]
    BadPayload,

    #[error("frame too long")]
    TooLong,
}

impl From<serde_json::Error> for HandlerError {
    fn from(_: serde_json::Error) -> Self {
        HandlerError::BadPayload
    }
}

impl HandlerError {
    /// Wire error code sent back to the client as `ERR "<code>"`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NeedLogin => "needlogin",
            Self::Submode => "submode",
            Self::Muted => "muted",
            Self::Throttled => "throttled",
            Self::Duplicate => "duplicate",
            Self::NoPermission => "nopermission",
            Self::NotFound => "notfound",
            Self::NeedBanReason => "needbanreason",
            Self::UnknownCommand(_) => "unknowncommand",
            Self::BadPayload => "protocolerror",
            Self::TooLong => "toolong",
        }
    }

    /// Protocol-class errors tear the connection down after the `ERR` reply.
    /// Policy rejections (muted, throttled, ...) leave it open.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommand(_) | Self::BadPayload | Self::TooLong
        )
    }
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(HandlerError::NeedLogin.code(), "needlogin");
        assert_eq!(HandlerError::Throttled.code(), "throttled");
        assert_eq!(HandlerError::UnknownCommand("X".into()).code(), "unknowncommand");
        assert_eq!(HandlerError::BadPayload.code(), "protocolerror");
    }

    #[test]
    fn policy_errors_keep_connection_open() {
        assert!(!HandlerError::Muted.closes_connection());
        assert!(!HandlerError::Throttled.closes_connection());
        assert!(!HandlerError::Submode.closes_connection());
        assert!(!HandlerError::NoPermission.closes_connection());
    }

    #[test]
    fn protocol_errors_close_connection() {
        assert!(HandlerError::TooLong.closes_connection());
        assert!(HandlerError::BadPayload.closes_connection());
        assert!(HandlerError::UnknownCommand("BOGUS".into()).closes_connection());
    }
}
