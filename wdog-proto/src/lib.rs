//! Wire protocol shared by the wdog client and daemon.
//!
//! - [`label`] — how a subscriber identifies itself
//! - [`wire`] — request/response frames and the line codec
//! - [`paths`] — where the daemon socket lives

pub mod label;
pub mod paths;
pub mod wire;

pub use label::Label;
pub use wire::{
    AckToken, DaemonStatus, ErrorCode, Payload, RegistrationId, Request, Response, WireError,
};
