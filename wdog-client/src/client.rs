//! Synchronous protocol client: one connection, one request line, one
//! response line per operation.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use tracing::trace;
use wdog_proto::wire::{decode_line, encode_line};
use wdog_proto::{
    paths, AckToken, DaemonStatus, ErrorCode, Label, Payload, RegistrationId, Request, Response,
    WireError,
};

use crate::error::{io_err, WdogError};

/// Low-level handle on the daemon socket.
///
/// Stateless apart from the socket path; every operation opens a fresh
/// connection. Most callers want [`Watchdog`](crate::Watchdog), which layers
/// the subscription state machine and recovery on top of this.
#[derive(Debug, Clone)]
pub struct WdogClient {
    socket: PathBuf,
}

impl Default for WdogClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WdogClient {
    /// Client against the default socket path (see [`wdog_proto::paths`]).
    pub fn new() -> Self {
        Self {
            socket: paths::socket_path(),
        }
    }

    /// Client against an explicit socket path.
    pub fn with_socket(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Asks the daemon whether it is alive. Collapses every failure to `false`.
    pub fn ping(&self) -> bool {
        matches!(self.roundtrip(&Request::Ping), Ok(Payload::Pong))
    }

    /// Registers the calling process. Returns the registration id and the
    /// initial ack token.
    pub fn subscribe(
        &self,
        label: &Label,
        timeout_ms: u32,
    ) -> Result<(RegistrationId, AckToken), WdogError> {
        let request = Request::Subscribe {
            pid: std::process::id(),
            label: label.to_wire(),
            timeout_ms,
        };
        match self.roundtrip(&request)? {
            Payload::Subscribed { id, ack } => Ok((id, ack)),
            other => Err(unexpected("subscribed", &other)),
        }
    }

    /// Removes a registration.
    pub fn unsubscribe(&self, id: RegistrationId, ack: AckToken) -> Result<(), WdogError> {
        match self.roundtrip(&Request::Unsubscribe { id, ack })? {
            Payload::Unsubscribed => Ok(()),
            other => Err(unexpected("unsubscribed", &other)),
        }
    }

    /// Proves liveness for a registration. Returns the next ack token.
    pub fn kick(&self, id: RegistrationId, ack: AckToken) -> Result<AckToken, WdogError> {
        match self.roundtrip(&Request::Kick { id, ack })? {
            Payload::Kicked { ack } => Ok(ack),
            other => Err(unexpected("kicked", &other)),
        }
    }

    /// Changes a registration's timeout and kicks it in the same call.
    /// Returns the next ack token.
    pub fn extend(
        &self,
        id: RegistrationId,
        timeout_ms: u32,
        ack: AckToken,
    ) -> Result<AckToken, WdogError> {
        match self.roundtrip(&Request::Extend { id, timeout_ms, ack })? {
            Payload::Extended { ack } => Ok(ack),
            other => Err(unexpected("extended", &other)),
        }
    }

    /// Switches daemon-side deadline enforcement on or off. Returns the state
    /// the daemon settled on.
    pub fn enable(&self, enable: bool) -> Result<bool, WdogError> {
        match self.roundtrip(&Request::Enable { enable })? {
            Payload::Enabled { enabled } => Ok(enabled),
            other => Err(unexpected("enabled", &other)),
        }
    }

    /// Reports daemon-wide state.
    pub fn status(&self) -> Result<DaemonStatus, WdogError> {
        match self.roundtrip(&Request::Status)? {
            Payload::Status(status) => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// Send one request line to the daemon socket and read one response line.
    fn roundtrip(&self, request: &Request) -> Result<Payload, WdogError> {
        if !self.socket.exists() {
            return Err(WdogError::Unreachable {
                socket: self.socket.clone(),
            });
        }

        let mut stream = UnixStream::connect(&self.socket).map_err(|err| {
            if matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
            ) {
                WdogError::Unreachable {
                    socket: self.socket.clone(),
                }
            } else {
                io_err(&self.socket, err)
            }
        })?;

        let line = encode_line(request)?;
        stream
            .write_all(line.as_bytes())
            .map_err(|e| io_err(&self.socket, e))?;
        stream.flush().map_err(|e| io_err(&self.socket, e))?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        let read = reader
            .read_line(&mut reply)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(WdogError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }

        trace!(request = ?request, reply = reply.trim_end(), "daemon roundtrip");
        let response: Response = decode_line(&reply)?;
        response.into_result().map_err(translate)
    }
}

/// Maps a daemon-reported wire error onto the client taxonomy.
fn translate(err: WireError) -> WdogError {
    match err.code {
        ErrorCode::InvalidTimeout => WdogError::InvalidTimeout {
            detail: err.message,
        },
        ErrorCode::StaleRegistration => WdogError::StaleRegistration,
        code => WdogError::Daemon {
            code,
            message: err.message,
        },
    }
}

fn unexpected(wanted: &str, got: &Payload) -> WdogError {
    WdogError::Protocol(format!("expected {wanted} reply, got {got:?}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
