//! Request/response frames exchanged with the watchdog daemon.
//!
//! One JSON object per line over a Unix domain stream socket. The client
//! writes a single request line and reads a single response line per
//! connection; the daemon answers every line it can parse, and answers the
//! rest with a `bad_request` error.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Daemon-assigned handle for one registration. Non-negative on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationId(pub i32);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i32> for RegistrationId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Fencing token returned on every successful state-mutating call.
///
/// The client presents its last-seen token on the next call; a mismatch tells
/// the daemon that the client's knowledge of its registration is out of date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckToken(pub u32);

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for AckToken {
    fn from(token: u32) -> Self {
        Self(token)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One client request.
///
/// `pid` rides along on subscribe so the daemon can attribute a missed
/// deadline to the right process in its reset-reason record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Subscribe {
        pid: u32,
        label: Option<Vec<u8>>,
        timeout_ms: u32,
    },
    Unsubscribe {
        id: RegistrationId,
        ack: AckToken,
    },
    Kick {
        id: RegistrationId,
        ack: AckToken,
    },
    Extend {
        id: RegistrationId,
        timeout_ms: u32,
        ack: AckToken,
    },
    Enable {
        enable: bool,
    },
    Status,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Daemon-wide state reported by the status operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub enabled: bool,
    pub subscribers: usize,
}

/// Successful results, tagged by `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Payload {
    Pong,
    Subscribed { id: RegistrationId, ack: AckToken },
    Unsubscribed,
    Kicked { ack: AckToken },
    Extended { ack: AckToken },
    Enabled { enabled: bool },
    Status(DaemonStatus),
}

/// Machine-readable failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Requested timeout is below the daemon's configured minimum.
    InvalidTimeout,
    /// The presented registration id or ack token is unknown to the daemon.
    StaleRegistration,
    /// The request could not be understood.
    BadRequest,
    /// Daemon-side failure unrelated to the request.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidTimeout => write!(f, "invalid_timeout"),
            ErrorCode::StaleRegistration => write!(f, "stale_registration"),
            ErrorCode::BadRequest => write!(f, "bad_request"),
            ErrorCode::Internal => write!(f, "internal"),
        }
    }
}

/// Failure reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} ({code})")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One daemon reply: either a payload or an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: Payload },
    Err { err: WireError },
}

impl Response {
    pub fn ok(payload: Payload) -> Self {
        Response::Ok { ok: payload }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Err {
            err: WireError::new(code, message),
        }
    }

    /// Flattens the wrapper into a `Result`.
    pub fn into_result(self) -> Result<Payload, WireError> {
        match self {
            Response::Ok { ok } => Ok(ok),
            Response::Err { err } => Err(err),
        }
    }
}

impl From<WireError> for Response {
    fn from(err: WireError) -> Self {
        Response::Err { err }
    }
}

// ---------------------------------------------------------------------------
// Line codec
// ---------------------------------------------------------------------------

/// Serializes a frame as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parses a frame from one line; the trailing newline may be present or not.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
