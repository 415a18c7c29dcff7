//! Client for a process-liveness watchdog daemon.
//!
//! A process registers with the local daemon ("subscribes"), promising to
//! prove liveness within a timeout window, then periodically pets the
//! watchdog. A process that goes quiet past its deadline is flagged by the
//! daemon through its reset-reason side channel. If the daemon restarts and
//! loses its registration table, the next pet or extend transparently
//! re-registers — the caller never sees the hiccup.
//!
//! ```no_run
//! use std::time::Duration;
//! use wdog_client::Watchdog;
//!
//! # fn main() -> Result<(), wdog_client::WdogError> {
//! let mut wdog = Watchdog::new("my-service");
//! wdog.subscribe(Duration::from_secs(2))?;
//! for _ in 0..10 {
//!     // ... one unit of work ...
//!     wdog.pet()?;
//! }
//! wdog.unsubscribe()?;
//! # Ok(())
//! # }
//! ```
//!
//! A [`Watchdog`] is a single-owner handle: operations take `&mut self` and
//! block until the daemon answers. To share one across threads, wrap it in a
//! `Mutex` — the protocol is sequential regardless, since every call presents
//! the ack token returned by the previous one.

pub mod client;
pub mod error;
pub mod subscription;

pub use client::WdogClient;
pub use error::WdogError;
pub use subscription::Watchdog;
pub use wdog_proto::{AckToken, DaemonStatus, Label, RegistrationId};

use std::path::PathBuf;

/// Probes the daemon on the default socket path. Never fails; any problem
/// reads as "not reachable".
pub fn ping() -> bool {
    WdogClient::new().ping()
}

/// Probes a daemon on an explicit socket path.
pub fn ping_at(socket: impl Into<PathBuf>) -> bool {
    WdogClient::with_socket(socket).ping()
}
