//! The caller-held subscription handle: state machine plus recovery.
//!
//! State is exactly one field: `registration` is `Some` while the handle
//! believes itself registered and `None` otherwise. Kick and extend absorb a
//! single "registration unknown" answer from the daemon by re-subscribing
//! with the stored label and timeout, then retrying once; everything else
//! surfaces to the caller untouched.

use std::time::Duration;

use tracing::{debug, warn};
use wdog_proto::{AckToken, ErrorCode, Label, RegistrationId};

use crate::client::WdogClient;
use crate::error::WdogError;

/// One process-side liveness subscription.
///
/// All operations are synchronous, blocking round-trips; mutating operations
/// take `&mut self`, so sharing a handle across threads requires the caller's
/// own lock (the protocol is sequential anyway: each call presents the ack
/// token returned by the previous one). Dropping a still-subscribed handle
/// leaves the registration behind on the daemon, which will expire it when
/// its deadline passes.
#[derive(Debug)]
pub struct Watchdog {
    client: WdogClient,
    label: Label,
    timeout_ms: u32,
    ack: AckToken,
    registration: Option<RegistrationId>,
}

impl Watchdog {
    /// Handle speaking to the daemon on the default socket path.
    pub fn new(label: impl Into<Label>) -> Self {
        Self::with_client(label, WdogClient::new())
    }

    /// Handle speaking through an explicit client; tests point this at their
    /// own socket.
    pub fn with_client(label: impl Into<Label>, client: WdogClient) -> Self {
        Self {
            client,
            label: label.into(),
            timeout_ms: 0,
            ack: AckToken::default(),
            registration: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn label(&self) -> &Label {
        &self.label
    }

    /// Whether the handle currently believes itself registered.
    pub fn is_subscribed(&self) -> bool {
        self.registration.is_some()
    }

    /// The current timeout window, while subscribed.
    pub fn timeout(&self) -> Option<Duration> {
        self.registration
            .map(|_| Duration::from_millis(u64::from(self.timeout_ms)))
    }

    /// The most recent daemon-issued ack token. Diagnostic only.
    pub fn last_ack(&self) -> AckToken {
        self.ack
    }

    /// Probes daemon reachability without touching the subscription.
    pub fn ping(&self) -> bool {
        self.client.ping()
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Registers this process with the daemon.
    ///
    /// `timeout` is converted to whole milliseconds at the wire boundary; the
    /// daemon rejects values below its configured minimum (1 second on a
    /// default-configured daemon).
    pub fn subscribe(&mut self, timeout: Duration) -> Result<(), WdogError> {
        if self.registration.is_some() {
            return Err(WdogError::AlreadySubscribed);
        }
        let timeout_ms = as_millis(timeout)?;
        self.timeout_ms = timeout_ms;
        let (id, ack) = self.client.subscribe(&self.label, timeout_ms)?;
        self.registration = Some(id);
        self.ack = ack;
        Ok(())
    }

    /// Withdraws the registration.
    ///
    /// If the daemon no longer knows the registration (it restarted since the
    /// last call), the goal state already holds; the handle resets and
    /// reports success. Any other failure leaves the handle subscribed so the
    /// caller can retry.
    pub fn unsubscribe(&mut self) -> Result<(), WdogError> {
        let id = self.registration.ok_or(WdogError::NotSubscribed)?;
        match self.client.unsubscribe(id, self.ack) {
            Ok(()) => {
                self.registration = None;
                Ok(())
            }
            Err(WdogError::StaleRegistration) => {
                debug!(%id, "registration already gone, unsubscribe is a no-op");
                self.registration = None;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Proves liveness within the current timeout window.
    pub fn pet(&mut self) -> Result<(), WdogError> {
        self.kick_with_recovery(None)
    }

    /// Makes `timeout` the new window, effective immediately.
    ///
    /// The stored timeout is updated on success, so a later recovery
    /// re-subscribes with the new value rather than the original.
    pub fn extend(&mut self, timeout: Duration) -> Result<(), WdogError> {
        if self.registration.is_none() {
            return Err(WdogError::NotSubscribed);
        }
        let timeout_ms = as_millis(timeout)?;
        self.kick_with_recovery(Some(timeout_ms))
    }

    /// Kick (or extend, when `extend_ms` is set) with the one-shot
    /// re-subscribe on a stale registration.
    ///
    /// The stale answer is only expected after a daemon restart wiped the
    /// registration table. One re-subscribe with the stored label/timeout,
    /// one retry of the original call; a second stale in the same call
    /// surfaces as a daemon error instead of looping.
    fn kick_with_recovery(&mut self, extend_ms: Option<u32>) -> Result<(), WdogError> {
        let mut recovered = false;
        loop {
            let id = self.registration.ok_or(WdogError::NotSubscribed)?;
            let result = match extend_ms {
                None => self.client.kick(id, self.ack),
                Some(ms) => self.client.extend(id, ms, self.ack),
            };
            match result {
                Ok(ack) => {
                    self.ack = ack;
                    if let Some(ms) = extend_ms {
                        self.timeout_ms = ms;
                    }
                    return Ok(());
                }
                Err(WdogError::StaleRegistration) if !recovered => {
                    recovered = true;
                    debug!(%id, label = %self.label, "registration stale, re-subscribing");
                    self.registration = None;
                    let (id, ack) = self.client.subscribe(&self.label, self.timeout_ms)?;
                    self.registration = Some(id);
                    self.ack = ack;
                }
                Err(WdogError::StaleRegistration) => {
                    warn!(%id, "registration stale again right after re-subscribing");
                    return Err(WdogError::Daemon {
                        code: ErrorCode::StaleRegistration,
                        message: "registration lost again after re-subscribing".to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Whole-millisecond wire form of a timeout.
fn as_millis(timeout: Duration) -> Result<u32, WdogError> {
    u32::try_from(timeout.as_millis()).map_err(|_| WdogError::InvalidTimeout {
        detail: format!("{timeout:?} does not fit in u32 milliseconds"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
