use std::path::PathBuf;

use thiserror::Error;
use wdog_proto::ErrorCode;

/// Error surface for the watchdog client.
///
/// `AlreadySubscribed` and `NotSubscribed` are pure local state-machine checks
/// and never involve the daemon. `StaleRegistration` escapes only from the
/// low-level [`WdogClient`](crate::WdogClient); [`Watchdog`](crate::Watchdog)
/// absorbs its first occurrence by re-subscribing.
#[derive(Debug, Error)]
pub enum WdogError {
    #[error("already subscribed")]
    AlreadySubscribed,

    #[error("not subscribed")]
    NotSubscribed,

    #[error("invalid timeout: {detail}")]
    InvalidTimeout { detail: String },

    #[error("registration no longer known to the daemon")]
    StaleRegistration,

    #[error("watchdog daemon is not reachable (socket: {socket})")]
    Unreachable { socket: PathBuf },

    #[error("daemon error: {message} ({code})")]
    Daemon { code: ErrorCode, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WdogError {
    WdogError::Io {
        path: path.into(),
        source,
    }
}
