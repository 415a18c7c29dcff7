use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the test daemon runtime.
#[derive(Debug, Error)]
pub enum TestdError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon socket already in use: {socket}")]
    SocketBusy { socket: PathBuf },

    #[error("daemon runtime error: {0}")]
    Runtime(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TestdError {
    TestdError::Io {
        path: path.into(),
        source,
    }
}
