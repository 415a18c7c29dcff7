//! Subscriber labels.
//!
//! The daemon treats a label as an opaque byte string and only ever echoes it
//! back in logs and reset-reason records. Text labels are fixed to their UTF-8
//! bytes at construction and never re-interpreted afterwards.

use std::fmt;

/// Identity a client presents when subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Label {
    /// No identification; the daemon records the subscriber by pid alone.
    #[default]
    None,
    /// A human-readable name.
    Text(String),
    /// An arbitrary byte sequence.
    Bytes(Vec<u8>),
}

impl Label {
    /// The byte form sent on the wire, or `None` when the label is absent.
    pub fn as_wire(&self) -> Option<&[u8]> {
        match self {
            Label::None => None,
            Label::Text(s) => Some(s.as_bytes()),
            Label::Bytes(b) => Some(b),
        }
    }

    /// Owned wire form, for embedding in a request.
    pub fn to_wire(&self) -> Option<Vec<u8>> {
        self.as_wire().map(<[u8]>::to_vec)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Label::None)
    }
}

impl fmt::Display for Label {
    /// Lossy rendering for logs; an absent label prints as `-`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::None => write!(f, "-"),
            Label::Text(s) => s.fmt(f),
            Label::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Label::Text(s.to_owned())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Label::Text(s)
    }
}

impl From<&[u8]> for Label {
    fn from(b: &[u8]) -> Self {
        Label::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Label {
    fn from(b: Vec<u8>) -> Self {
        Label::Bytes(b)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
