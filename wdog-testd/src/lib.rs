//! In-process watchdog daemon for exercising clients in tests.
//!
//! Serves the wdog wire protocol on a Unix socket from a background thread.
//! Registrations live in memory only, so stopping an instance and spawning a
//! new one on the same socket path is a faithful stand-in for a daemon
//! restart. Missed deadlines are reported through the reset-reason record
//! and the supervisor script instead of resetting anything.

mod error;
pub mod registry;
pub mod reset;
mod runtime;

pub use error::TestdError;
pub use registry::{Registration, Registry};
pub use reset::{parse_reset_reason, RESET_CODE_MISSED_DEADLINE, SUPERVISOR_TAG};
pub use runtime::{init_tracing, DaemonOptions, Testd};
